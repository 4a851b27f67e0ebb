use crate::message::{ServerId, Transaction, Zxid};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Where the participant currently is in its lifecycle, surfaced to the
/// application for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Electing,
    Discovering,
    Synchronizing,
    Broadcasting,
}

/// The application half of the engine. Callbacks are invoked from the
/// participant's tasks; implementations should return promptly.
///
/// Delivery contract: `deliver` is invoked at most once per zxid, in
/// strictly increasing zxid order. After `restore(snapshot)` the engine
/// adopts the snapshot's zxid as its delivery watermark, so nothing at or
/// below it is ever delivered again.
pub trait StateMachine: Send + 'static {
    /// A committed transaction. The externally visible commit point.
    fn deliver(&mut self, txn: &Transaction);

    /// The zxid the state machine's recovered state reflects, queried once
    /// at boot. An ephemeral machine returns `Zxid::NULL`; one which
    /// reloaded its own snapshot reports the snapshot's watermark, and the
    /// engine will never deliver at or below it.
    fn recovered(&mut self) -> Zxid {
        Zxid::NULL
    }

    /// This replica established leadership of `peers`.
    fn leading(&mut self, _peers: &BTreeSet<ServerId>) {}

    /// This replica is following `leader`.
    fn following(&mut self, _leader: &ServerId) {}

    /// The cluster membership changed.
    fn cluster_change(&mut self, _peers: &BTreeSet<ServerId>) {}

    /// Capture a snapshot of all delivered state, for full-state transfer
    /// to a lagging peer.
    fn save(&mut self) -> Bytes {
        Bytes::new()
    }

    /// Replace all state with a previously saved snapshot.
    fn restore(&mut self, _snapshot: Bytes) {}

    /// The participant moved to `phase`.
    fn state_changed(&mut self, _phase: Phase) {}
}

/// State machines are driven from the commit processor's task and the
/// participant driver, so they're shared behind a lock.
pub type SharedStateMachine = Arc<Mutex<dyn StateMachine>>;

pub fn shared(sm: impl StateMachine) -> SharedStateMachine {
    Arc::new(Mutex::new(sm))
}
