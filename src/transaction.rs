//! Transaction coordinator.
//!
//! A `Transaction` is created by the dispatcher for transactional commands
//! and bound to the sharded store. For a multi-command scope (EXEC, script
//! runs) the same instance is reused across the inner commands:
//! `set_exec_cmd` + `init_by_args` re-point it at each one, `schedule`
//! registers the declared key intents up front and `unlock_multi` drops them
//! when the scope ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::{arg_to_i64, CommandId};
use crate::store::DataStore;

static NEXT_TXID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TxState {
    cid: Arc<CommandId>,
    db_index: usize,
    /// Unique keys of the command currently pointed at.
    keys: Vec<Vec<u8>>,
    unique_shards: usize,
    /// Keys whose intents are held since `schedule`, until `unlock_multi`.
    locked: Vec<Vec<u8>>,
    out_of_order: bool,
}

#[derive(Debug)]
pub struct Transaction {
    txid: u64,
    store: Arc<DataStore>,
    state: Mutex<TxState>,
}

impl Transaction {
    pub fn new(cid: Arc<CommandId>, store: Arc<DataStore>) -> Arc<Self> {
        Arc::new(Transaction {
            txid: NEXT_TXID.fetch_add(1, Ordering::Relaxed),
            store,
            state: Mutex::new(TxState {
                cid,
                db_index: 0,
                keys: Vec::new(),
                unique_shards: 0,
                locked: Vec::new(),
                out_of_order: false,
            }),
        })
    }

    /// Re-derives the per-command key state from a fresh argv. Scripts
    /// declare their keys explicitly in the EVAL argv; every other command
    /// exposes them through its positional key descriptor.
    pub fn init_by_args(&self, db_index: usize, args: &[Vec<u8>]) {
        let mut state = self.state.lock().unwrap();
        state.db_index = db_index;
        state.keys = derive_keys(&state.cid, args);

        let mut shards: Vec<usize> = state
            .keys
            .iter()
            .map(|k| self.store.shard_id(k))
            .collect();
        shards.sort_unstable();
        shards.dedup();
        state.unique_shards = if state.cid.is_global_trans() {
            self.store.shard_count()
        } else {
            shards.len()
        };
    }

    /// Points the transaction at the next command of a multi scope.
    pub fn set_exec_cmd(&self, cid: Arc<CommandId>) {
        self.state.lock().unwrap().cid = cid;
    }

    /// Starts the multi-key lock lifecycle: registers exclusive intents for
    /// the current key set. Must be paired with `unlock_multi`.
    pub fn schedule(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.locked.is_empty());
        let keys = state.keys.clone();
        self.store.acquire_keys(state.db_index, &keys);
        state.locked = keys;
    }

    /// Releases every intent held since `schedule`. Safe to call when
    /// nothing was scheduled.
    pub fn unlock_multi(&self) {
        let mut state = self.state.lock().unwrap();
        if state.locked.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut state.locked);
        self.store.release_keys(state.db_index, &keys);
    }

    pub fn txid(&self) -> u64 {
        self.txid
    }

    pub fn is_ooo(&self) -> bool {
        self.state.lock().unwrap().out_of_order
    }

    pub fn unique_shard_cnt(&self) -> usize {
        self.state.lock().unwrap().unique_shards
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A panicking handler must not leak intents.
        self.unlock_multi();
    }
}

fn derive_keys(cid: &CommandId, args: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = Vec::new();
    if cid.is_eval_kind() {
        // EVAL script numkeys key [key ...]: the declared KEYS slice.
        if let Some(num_keys) = args.get(2).and_then(|a| arg_to_i64(a)) {
            let num_keys = num_keys.max(0) as usize;
            for key in args.iter().skip(3).take(num_keys) {
                keys.push(key.clone());
            }
        }
    } else {
        let (start, end) = cid.key_range(args.len());
        let step = cid.key_arg_step().max(1) as usize;
        let mut i = start;
        while i < end {
            keys.push(args[i].clone());
            i += step;
        }
    }
    keys.sort_unstable();
    keys.dedup();
    keys
}
