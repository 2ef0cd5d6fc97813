//! Lifecycle events published by the supervisor.
//!
//! These complement the running-set and log observables: the running set says
//! *what* is running, events say *why* it changed (spawn, spawn failure, exit code).

use tokio::sync::broadcast;

use crate::identity::ConfigIdentity;

pub const EVENT_BUFFER: usize = 64;

/// Represents a lifecycle change of one supervised instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A child process was spawned and registered.
    Started { identity: ConfigIdentity, pid: Option<u32> },
    /// The OS refused to spawn the child.
    StartFailed { identity: ConfigIdentity, error: String },
    /// The child exited. `requested` is false when it exited on its own.
    Exited {
        identity: ConfigIdentity,
        code: Option<i32>,
        requested: bool,
    },
}

pub fn channel() -> broadcast::Sender<SupervisorEvent> {
    let (tx, _) = broadcast::channel(EVENT_BUFFER);
    tx
}
