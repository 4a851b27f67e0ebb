pub mod config;
pub mod log;
pub mod message;
pub mod oracle;
pub mod participant;
pub mod persistence;
pub mod processors;
pub mod queue;
pub mod state_machine;
pub mod transport;

pub use config::Config;
pub use message::{ClusterConfig, Message, ServerId, Transaction, Zxid};
pub use participant::{Handle, Participant, Status};
pub use state_machine::{Phase, StateMachine};

/// Outcome of a protocol round, and the control flow of the participant
/// driver: recoverable variants unwind the current round back to election,
/// the rest are terminal for the participant or the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer of interest went silent for longer than the configured
    /// timeout. Recovered by re-entering election.
    #[error("timed out waiting on the peer of interest")]
    Timeout,
    /// The election oracle (or a disconnect from the peer of interest)
    /// told us to abandon the round. Recovered by re-entering election.
    #[error("abandoning the current round for a new election")]
    BackToElection,
    /// The leader removed this server from the cluster. Terminal for the
    /// participant, but not for the process.
    #[error("this server was removed from the cluster")]
    LeftCluster,
    /// Join was requested but cannot proceed. Surfaced to the `join` caller.
    #[error("cannot join the cluster: {0}")]
    JoinFailure(String),
    /// Durable state failed validation. Fatal: a human has to look at the
    /// log directory before this server may serve again.
    #[error("persistent state is corrupt: {0}")]
    PersistenceCorruption(String),
    /// A peer sent something the protocol forbids in the current phase.
    /// Recovered by re-entering election.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The participant was asked to shut down. Unwinds cleanly.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors which restart the protocol round rather than ending the
    /// participant.
    pub fn is_round_restart(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::BackToElection | Error::ProtocolViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
