use crate::message::ServerId;
use crate::Result;
use std::collections::VecDeque;
use std::sync::Mutex;

/// The elected-leader oracle: an external collaborator which produces one
/// leader identifier per election round. The engine asks on demand and
/// trusts the answer; disagreement between replicas simply burns a round.
#[async_trait::async_trait]
pub trait ElectionOracle: Send + Sync + 'static {
    async fn elect(&self, round: u64) -> Result<ServerId>;
}

/// Always elects the same server. Useful for bootstrap and tests.
pub struct FixedLeader(pub ServerId);

#[async_trait::async_trait]
impl ElectionOracle for FixedLeader {
    async fn elect(&self, _round: u64) -> Result<ServerId> {
        Ok(self.0.clone())
    }
}

/// Elects the lexicographically smallest configured server id. A naive
/// stand-in for a real failure-detecting elector.
pub struct LowestId(pub Vec<ServerId>);

#[async_trait::async_trait]
impl ElectionOracle for LowestId {
    async fn elect(&self, _round: u64) -> Result<ServerId> {
        self.0
            .iter()
            .min()
            .cloned()
            .ok_or_else(|| crate::Error::BackToElection)
    }
}

/// Replays a scripted sequence of outcomes, then parks forever. Tests use
/// this to steer exactly which rounds happen.
pub struct Scripted {
    outcomes: Mutex<VecDeque<ServerId>>,
}

impl Scripted {
    pub fn new(outcomes: impl IntoIterator<Item = ServerId>) -> Scripted {
        Scripted {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl ElectionOracle for Scripted {
    async fn elect(&self, _round: u64) -> Result<ServerId> {
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(id) => Ok(id),
            // Script exhausted: this replica sits out all further rounds.
            None => futures::future::pending().await,
        }
    }
}
