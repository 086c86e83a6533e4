//! Sharded in-memory store.
//!
//! The keyspace is split into `shard_count` segments; a key's owner shard is
//! `hash(key) % shard_count`. Each shard guards its hash tables (one per
//! logical database) and an intent-lock ledger behind one mutex, so a
//! handler touches at most one shard lock per key and never holds it across
//! an await point.

pub mod entry;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

pub use entry::{now_millis, Entry};

/// Counted lock intents on a key or shard. Intents are a ledger consulted by
/// the transaction layer and the lock observability queries; acquisition
/// never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    pub fn can_acquire_exclusive(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    pub fn can_acquire_shared(&self) -> bool {
        self.exclusive == 0
    }

    pub fn acquire_exclusive(&mut self) {
        self.exclusive += 1;
    }

    pub fn release_exclusive(&mut self) {
        debug_assert!(self.exclusive > 0);
        self.exclusive = self.exclusive.saturating_sub(1);
    }

    fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }
}

#[derive(Debug, Default)]
struct Shard {
    dbs: Vec<HashMap<Vec<u8>, Entry>>,
    key_locks: HashMap<(usize, Vec<u8>), IntentLock>,
    shard_lock: IntentLock,
}

impl Shard {
    fn new(num_dbs: usize) -> Self {
        Shard {
            dbs: (0..num_dbs).map(|_| HashMap::new()).collect(),
            key_locks: HashMap::new(),
            shard_lock: IntentLock::default(),
        }
    }

    fn expire_if_due(&mut self, db: usize, key: &[u8], now_ms: u64) {
        let due = self.dbs[db]
            .get(key)
            .map(|e| e.is_expired(now_ms))
            .unwrap_or(false);
        if due {
            self.dbs[db].remove(key);
        }
    }
}

#[derive(Debug)]
pub struct DataStore {
    shards: Vec<Mutex<Shard>>,
    num_dbs: usize,
}

impl DataStore {
    pub fn new(shard_count: usize, num_dbs: usize) -> Self {
        let shard_count = shard_count.max(1);
        DataStore {
            shards: (0..shard_count)
                .map(|_| Mutex::new(Shard::new(num_dbs)))
                .collect(),
            num_dbs,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn num_dbs(&self) -> usize {
        self.num_dbs
    }

    pub fn shard_id(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Runs `f` against the owning shard's table for `db`, after lazily
    /// expiring `key` if its deadline passed.
    pub fn with_map<R>(
        &self,
        db: usize,
        key: &[u8],
        f: impl FnOnce(&mut HashMap<Vec<u8>, Entry>) -> R,
    ) -> R {
        let mut shard = self.shards[self.shard_id(key)].lock().unwrap();
        shard.expire_if_due(db, key, now_millis());
        f(&mut shard.dbs[db])
    }

    pub fn get(&self, db: usize, key: &[u8]) -> Option<Entry> {
        self.with_map(db, key, |map| map.get(key).cloned())
    }

    pub fn set(&self, db: usize, key: &[u8], entry: Entry) {
        self.with_map(db, key, |map| {
            map.insert(key.to_vec(), entry);
        });
    }

    pub fn remove(&self, db: usize, key: &[u8]) -> bool {
        self.with_map(db, key, |map| map.remove(key).is_some())
    }

    pub fn flush_db(&self, db: usize) {
        for shard in &self.shards {
            shard.lock().unwrap().dbs[db].clear();
        }
    }

    /// Number of live keys in `db`, for diagnostics.
    pub fn db_size(&self, db: usize) -> usize {
        let now = now_millis();
        self.shards
            .iter()
            .map(|shard| {
                shard.lock().unwrap().dbs[db]
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .count()
            })
            .sum()
    }

    // -- intent-lock ledger -------------------------------------------------

    /// Registers exclusive intents on every key (deduplicated by the caller).
    pub fn acquire_keys(&self, db: usize, keys: &[Vec<u8>]) {
        for key in keys {
            let mut shard = self.shards[self.shard_id(key)].lock().unwrap();
            shard
                .key_locks
                .entry((db, key.clone()))
                .or_default()
                .acquire_exclusive();
        }
    }

    pub fn release_keys(&self, db: usize, keys: &[Vec<u8>]) {
        for key in keys {
            let mut shard = self.shards[self.shard_id(key)].lock().unwrap();
            if let Some(lock) = shard.key_locks.get_mut(&(db, key.clone())) {
                lock.release_exclusive();
                if lock.is_free() {
                    shard.key_locks.remove(&(db, key.clone()));
                }
            }
        }
    }

    /// Whether an exclusive intent on `key` would currently be refused.
    pub fn key_is_locked(&self, db: usize, key: &[u8]) -> bool {
        let shard = self.shards[self.shard_id(key)].lock().unwrap();
        shard
            .key_locks
            .get(&(db, key.to_vec()))
            .map(|lock| !lock.can_acquire_exclusive())
            .unwrap_or(false)
    }

    /// Whether any shard-global lock would refuse a shared intent.
    pub fn shard_set_locked(&self) -> bool {
        self.shards
            .iter()
            .any(|shard| !shard.lock().unwrap().shard_lock.can_acquire_shared())
    }
}
