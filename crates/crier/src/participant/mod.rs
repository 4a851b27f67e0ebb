//! The per-replica driver: election, discovery, synchronization, and the
//! broadcasting loop, in leader or follower role. One task drives the
//! phase machine; processors run as their own tasks and are shut down
//! deterministically on every round exit.

mod follower;
mod leader;
mod sync;

use crate::config::Config;
use crate::message::{Inbound, Message, ServerId, Transaction, Zxid};
use crate::oracle::ElectionOracle;
use crate::persistence::Persistence;
use crate::queue::QueueSender;
use crate::state_machine::{Phase, SharedStateMachine, StateMachine};
use crate::transport::Transport;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A snapshot of where the participant is, published for handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    pub leader: Option<ServerId>,
    pub is_leader: bool,
}

pub struct Participant {
    config: Config,
    transport: Arc<dyn Transport>,
    oracle: Arc<dyn ElectionOracle>,
    state_machine: SharedStateMachine,
    persistence: Arc<Mutex<Persistence>>,
    rx: mpsc::Receiver<Inbound>,
    queue: QueueSender,
    cancel: CancellationToken,
    status: watch::Sender<Status>,
    last_delivered: Zxid,
    round: u64,
}

/// Cheap clone handed to the application: submit requests, observe phase
/// transitions, request shutdown.
#[derive(Clone)]
pub struct Handle {
    id: ServerId,
    queue: QueueSender,
    cancel: CancellationToken,
    status: watch::Receiver<Status>,
}

impl Handle {
    /// Enqueue a client request. It is proposed once the cluster is
    /// broadcasting: a leading participant proposes it itself, a following
    /// one forwards it to its leader. Outside of broadcasting it is
    /// dropped with a warning.
    pub async fn send(&self, body: Bytes) {
        self.queue
            .message(self.id.clone(), Message::Request { body })
            .await;
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Resolves once the participant enters the broadcasting phase.
    pub async fn broadcasting(&mut self) -> Status {
        self.status
            .wait_for(|status| status.phase == Phase::Broadcasting)
            .await
            .expect("participant dropped its status channel")
            .clone()
    }

    /// Ask the participant to unwind and exit cleanly.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Participant {
    /// Builds a participant over an already-validated `config`. Opens (and
    /// exclusively locks) the durable state under `config.logdir`.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        queue: QueueSender,
        rx: mpsc::Receiver<Inbound>,
        oracle: Arc<dyn ElectionOracle>,
        state_machine: impl StateMachine,
    ) -> Result<(Participant, Handle)> {
        let mut persistence = Persistence::open(&config.logdir, config.segment_max_bytes)?;
        let state_machine = crate::state_machine::shared(state_machine);

        // A trimmed log can only be served on top of state the application
        // recovered itself; otherwise the missing prefix is unrecoverable.
        let last_delivered = state_machine.lock().unwrap().recovered();
        let floor = persistence.log().floor();
        if !floor.is_null() && last_delivered < floor {
            return Err(Error::PersistenceCorruption(format!(
                "log is trimmed to {floor} but the state machine only recovered through {last_delivered}"
            )));
        }

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(Status {
            phase: Phase::Electing,
            leader: None,
            is_leader: false,
        });

        let handle = Handle {
            id: config.server_id.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            status: status_rx,
        };
        let participant = Participant {
            config,
            transport,
            oracle,
            state_machine,
            persistence: Arc::new(Mutex::new(persistence)),
            rx,
            queue,
            cancel,
            status: status_tx,
            last_delivered,
            round: 0,
        };
        Ok((participant, handle))
    }

    /// Drives the phase machine until cancellation (`Ok`), removal from
    /// the cluster, or a fatal persistence failure.
    pub async fn run(mut self) -> Result<()> {
        self.seed_config()?;
        match self.drive().await {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// First boot of a statically configured ensemble: the configured
    /// servers seed the membership. A server started with no peers stays
    /// uninitialized and must `join` instead.
    fn seed_config(&mut self) -> Result<()> {
        let mut persistence = self.persistence.lock().unwrap();
        if persistence.last_seen_config().is_some() || self.config.servers.is_empty() {
            return Ok(());
        }
        let peers = self
            .config
            .servers
            .keys()
            .cloned()
            .chain(std::iter::once(self.config.server_id.clone()));
        let seeded = crate::message::ClusterConfig::new(Zxid::NULL, peers);
        tracing::info!(peers = seeded.peers.len(), "seeding cluster configuration");
        persistence.set_last_seen_config(seeded)
    }

    /// Join an existing cluster via `contact`, then keep running. Fails
    /// with `JoinFailure` only when no prior configuration exists and the
    /// join round itself could not complete.
    pub async fn join(mut self, contact: ServerId) -> Result<()> {
        if self
            .persistence
            .lock()
            .unwrap()
            .last_seen_config()
            .is_some()
        {
            tracing::warn!("join requested but a cluster configuration exists; electing instead");
            return self.run().await;
        }

        self.round += 1;
        tracing::info!(contact = %contact, "joining cluster");
        let err = follower::follow(&mut self, contact, true)
            .await
            .expect_err("rounds only exit by error");

        let joined = self
            .persistence
            .lock()
            .unwrap()
            .last_seen_config()
            .is_some();
        match err {
            Error::Cancelled => Ok(()),
            err if err.is_round_restart() && !joined => Err(Error::JoinFailure(err.to_string())),
            err if err.is_round_restart() => match self.drive().await {
                Err(Error::Cancelled) => Ok(()),
                other => other,
            },
            Error::LeftCluster => Err(Error::LeftCluster),
            fatal => Err(fatal),
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.round += 1;
            let err = self
                .run_round()
                .await
                .expect_err("rounds only exit by error");

            if err.is_round_restart() {
                tracing::debug!(round = self.round, %err, "round failed; back to election");
                continue;
            }
            match err {
                Error::LeftCluster => {
                    tracing::info!("left the cluster on leader's instruction");
                    return Err(Error::LeftCluster);
                }
                Error::Cancelled => return Err(Error::Cancelled),
                fatal => {
                    let (epoch, latest) = {
                        let persistence = self.persistence.lock().unwrap();
                        (persistence.ack_epoch(), persistence.latest_zxid())
                    };
                    tracing::error!(
                        round = self.round,
                        epoch,
                        latest = %latest,
                        error = %fatal,
                        "participant failed"
                    );
                    return Err(fatal);
                }
            }
        }
    }

    async fn run_round(&mut self) -> Result<()> {
        self.set_phase(Phase::Electing, None, false);
        let leader = tokio::select! {
            elected = self.oracle.elect(self.round) => elected?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };
        tracing::info!(round = self.round, leader = %leader, "oracle elected a leader");

        if leader == self.config.server_id {
            leader::lead(self).await
        } else {
            follower::follow(self, leader, false).await
        }
    }

    fn set_phase(&self, phase: Phase, leader: Option<ServerId>, is_leader: bool) {
        let _ = self.status.send(Status {
            phase,
            leader,
            is_leader,
        });
        self.state_machine.lock().unwrap().state_changed(phase);
    }

    /// One queue receive, bounded by `deadline` and by cancellation.
    async fn recv(&mut self, deadline: Instant) -> Result<Inbound> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            received = tokio::time::timeout_at(deadline, self.rx.recv()) => match received {
                Err(_) => Err(Error::Timeout),
                Ok(None) => Err(Error::Cancelled),
                Ok(Some(inbound)) => Ok(inbound),
            },
        }
    }

    /// Deliver every log entry past the delivery watermark to the state
    /// machine, in order.
    fn deliver_pending(&mut self) -> Result<()> {
        let txns: Vec<Transaction> = {
            let mut persistence = self.persistence.lock().unwrap();
            let from = self.last_delivered.next();
            persistence
                .log()
                .iterate(from)?
                .collect::<Result<Vec<_>>>()?
        };
        if txns.is_empty() {
            return Ok(());
        }

        let mut state_machine = self.state_machine.lock().unwrap();
        for txn in &txns {
            tracing::trace!(zxid = %txn.zxid, "delivering from log");
            state_machine.deliver(txn);
            self.last_delivered = txn.zxid;
        }
        Ok(())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.timeout
    }
}
