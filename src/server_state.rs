//! Process-wide execution state shared by every connection.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::metrics::Metrics;
use crate::scripting::Interpreter;

/// Lifecycle flag consulted on every dispatch. Transitions are rare; reads
/// happen on the hot path, hence the relaxed atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GlobalState {
    Active = 0,
    Loading = 1,
    ShuttingDown = 2,
}

impl GlobalState {
    pub fn name(self) -> &'static str {
        match self {
            GlobalState::Active => "ACTIVE",
            GlobalState::Loading => "LOADING",
            GlobalState::ShuttingDown => "SHUTTING DOWN",
        }
    }

    fn from_u8(v: u8) -> GlobalState {
        match v {
            1 => GlobalState::Loading,
            2 => GlobalState::ShuttingDown,
            _ => GlobalState::Active,
        }
    }
}

/// Shared handle the dispatcher reads per invocation: the lifecycle flag,
/// the master/replica role, the scripting engine and the command metrics.
#[derive(Debug)]
pub struct ServerState {
    gstate: AtomicU8,
    is_master: AtomicBool,
    pub interpreter: Mutex<Interpreter>,
    pub metrics: Metrics,
}

impl ServerState {
    pub fn new(is_master: bool) -> Self {
        ServerState {
            gstate: AtomicU8::new(GlobalState::Active as u8),
            is_master: AtomicBool::new(is_master),
            interpreter: Mutex::new(Interpreter::new()),
            metrics: Metrics::new(),
        }
    }

    pub fn global_state(&self) -> GlobalState {
        GlobalState::from_u8(self.gstate.load(Ordering::Acquire))
    }

    pub fn set_global_state(&self, state: GlobalState) {
        self.gstate.store(state as u8, Ordering::Release);
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Relaxed)
    }

    pub fn set_master(&self, master: bool) {
        self.is_master.store(master, Ordering::Relaxed);
    }
}
