//! The follower's side of a round: discover the new epoch, synchronize the
//! log to the leader's history, then accept broadcast traffic until the
//! leader is lost.

use super::Participant;
use crate::message::{Message, ServerId, SyncDirective, Transaction, Zxid};
use crate::processors::{AckSink, CommitInput, CommitProcessor, SyncProposalProcessor};
use crate::state_machine::Phase;
use crate::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(super) async fn follow(
    p: &mut Participant,
    leader: ServerId,
    via_join: bool,
) -> Result<()> {
    p.set_phase(Phase::Discovering, Some(leader.clone()), false);

    // Open discovery with our promises, or with a join for an
    // uninitialized server asking to be admitted.
    let opener = if via_join {
        Message::Join
    } else {
        let persistence = p.persistence.lock().unwrap();
        Message::ProposedEpoch {
            proposed: persistence.proposed_epoch(),
            acked: persistence.ack_epoch(),
            config: persistence.last_seen_config().cloned(),
        }
    };
    p.transport.send(&leader, opener).await;

    let epoch = match get_expected(p, &leader, "NEW_EPOCH").await? {
        Message::NewEpoch { epoch } => epoch,
        _ => unreachable!("get_expected matched the kind"),
    };

    let (acked, latest) = {
        let mut persistence = p.persistence.lock().unwrap();
        if epoch < persistence.proposed_epoch() {
            return Err(Error::ProtocolViolation(format!(
                "leader's epoch {} is behind our promise {}",
                epoch,
                persistence.proposed_epoch()
            )));
        }
        persistence.set_proposed_epoch(epoch)?;
        (persistence.ack_epoch(), persistence.latest_zxid())
    };
    p.transport
        .send(
            &leader,
            Message::AckEpoch {
                acked,
                last_zxid: latest,
            },
        )
        .await;

    p.set_phase(Phase::Synchronizing, Some(leader.clone()), false);
    let buffered = wait_for_sync(p, &leader, epoch).await?;

    // Everything synchronized is committed; surface it before accepting
    // broadcast traffic.
    p.deliver_pending()?;
    p.state_machine.lock().unwrap().following(&leader);

    p.set_phase(Phase::Broadcasting, Some(leader.clone()), false);
    broadcasting(p, leader, buffered).await
}

/// Receive policy for a follower: timeouts and go-backs unwind the round, a
/// lost leader unwinds the round, other disconnects just clear, and
/// leader-gathering messages are never addressed to a follower, so their
/// sender is cleared and the message dropped.
async fn get_message(p: &mut Participant, leader: &ServerId) -> Result<(ServerId, Message)> {
    loop {
        let deadline = p.deadline();
        match p.recv(deadline).await? {
            crate::message::Inbound::GoBack => return Err(Error::BackToElection),
            crate::message::Inbound::Disconnected { peer } if peer == *leader => {
                return Err(Error::BackToElection)
            }
            crate::message::Inbound::Disconnected { peer } => {
                p.transport.clear(&peer).await;
            }
            crate::message::Inbound::Message { from, message } => {
                if matches!(
                    message,
                    Message::ProposedEpoch { .. }
                        | Message::AckEpoch { .. }
                        | Message::Ack { .. }
                        | Message::Join
                ) {
                    tracing::debug!(from = %from, kind = message.kind(), "not a follower's message; clearing sender");
                    p.transport.clear(&from).await;
                    continue;
                }
                return Ok((from, message));
            }
        }
    }
}

/// Loop `get_message` until `kind` arrives from the leader, discarding the
/// rest.
async fn get_expected(p: &mut Participant, leader: &ServerId, kind: &str) -> Result<Message> {
    loop {
        let (from, message) = get_message(p, leader).await?;
        if from == *leader && message.kind() == kind {
            return Ok(message);
        }
        if message == Message::Heartbeat && from == *leader {
            p.transport.send(leader, Message::Heartbeat).await;
            continue;
        }
        tracing::debug!(
            from = %from,
            kind = message.kind(),
            expected = kind,
            "discarding while waiting"
        );
    }
}

/// Apply the leader's synchronization stream: an alignment directive, the
/// history proposals, then `NewLeader` closing the stream and a `Commit`
/// sealing it. Returns broadcast-phase proposals which raced ahead of the
/// seal, to be replayed into the processors.
async fn wait_for_sync(
    p: &mut Participant,
    leader: &ServerId,
    epoch: u32,
) -> Result<Vec<Transaction>> {
    // When a snapshot replaces the log, its watermark stands in for log
    // entries the follower no longer holds.
    let mut floor = Zxid::NULL;

    let sync_zxid = loop {
        let (from, message) = get_message(p, leader).await?;
        if from != *leader {
            match message {
                Message::QueryLeader => {
                    p.transport
                        .send(
                            &from,
                            Message::QueryLeaderReply {
                                leader: Some(leader.clone()),
                            },
                        )
                        .await;
                }
                _ => {
                    tracing::debug!(from = %from, kind = message.kind(), "ignoring non-leader message during sync")
                }
            }
            continue;
        }

        match message {
            Message::SyncDirective(SyncDirective::Diff { from: base }) => {
                tracing::debug!(base = %base, "aligning by diff");
            }
            Message::SyncDirective(SyncDirective::Truncate { to }) => {
                if p.last_delivered > to {
                    return Err(Error::ProtocolViolation(format!(
                        "truncate to {} would cut below delivered {}",
                        to, p.last_delivered
                    )));
                }
                tracing::info!(to = %to, "truncating divergent suffix");
                p.persistence.lock().unwrap().log().truncate(to)?;
            }
            Message::SyncDirective(SyncDirective::Snapshot { zxid, state }) => {
                tracing::info!(zxid = %zxid, "restoring from snapshot");
                p.persistence.lock().unwrap().log().truncate(Zxid::NULL)?;
                p.state_machine.lock().unwrap().restore(state);
                p.last_delivered = zxid;
                floor = zxid;
            }
            Message::Proposal { txn } => {
                p.persistence.lock().unwrap().log().append(&txn)?;
            }
            Message::PullLog { from: base } => {
                // We hold the initial history; ship it to the leader.
                ship_log(p, leader, base).await?;
            }
            Message::NewLeader {
                epoch: new_leader_epoch,
                config,
            } => {
                if new_leader_epoch != epoch {
                    return Err(Error::ProtocolViolation(format!(
                        "new leader epoch {new_leader_epoch} does not match discovered {epoch}"
                    )));
                }
                let latest = {
                    let mut persistence = p.persistence.lock().unwrap();
                    persistence.log().sync()?;
                    persistence.set_ack_epoch(new_leader_epoch)?;

                    let adopt = match persistence.last_seen_config() {
                        None => true,
                        Some(current) => config.version > current.version,
                    };
                    if adopt {
                        persistence.set_last_seen_config(config.clone())?;
                    }
                    let latest = persistence.latest_zxid().max(floor);
                    drop(persistence);
                    if adopt {
                        p.state_machine.lock().unwrap().cluster_change(&config.peers);
                    }
                    latest
                };
                p.transport
                    .send(leader, Message::Ack { zxid: latest })
                    .await;
                break latest;
            }
            Message::Heartbeat => {
                p.transport.send(leader, Message::Heartbeat).await;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message from leader during sync");
            }
        }
    };

    // The round is sealed by a commit of exactly the synchronized history.
    // Proposals may already be streaming for the broadcast phase; buffer
    // them until the seal.
    let mut buffered = Vec::new();
    loop {
        let (from, message) = get_message(p, leader).await?;
        if from != *leader {
            tracing::debug!(from = %from, kind = message.kind(), "ignoring non-leader message during sync");
            continue;
        }
        match message {
            Message::Commit { zxid } => {
                if zxid != sync_zxid {
                    return Err(Error::ProtocolViolation(format!(
                        "sync commit names {zxid}, expected {sync_zxid}"
                    )));
                }
                return Ok(buffered);
            }
            Message::Proposal { txn } => buffered.push(txn),
            Message::Heartbeat => {
                p.transport.send(leader, Message::Heartbeat).await;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message from leader awaiting seal");
            }
        }
    }
}

/// Answer the leader's `PullLog` with our entire suffix above `base`,
/// closed by `PullDone`.
async fn ship_log(p: &mut Participant, leader: &ServerId, base: Zxid) -> Result<()> {
    let (txns, latest) = {
        let mut persistence = p.persistence.lock().unwrap();
        let from = if base.is_null() { Zxid::NULL } else { base.next() };
        let txns = persistence
            .log()
            .iterate(from)?
            .collect::<Result<Vec<_>>>()?;
        (txns, persistence.latest_zxid())
    };
    tracing::info!(count = txns.len(), latest = %latest, "shipping log to leader");

    for txn in txns {
        p.transport.send(leader, Message::Proposal { txn }).await;
    }
    p.transport
        .send(leader, Message::PullDone { last_zxid: latest })
        .await;
    Ok(())
}

async fn forward_proposal(
    sync_tx: &mpsc::Sender<Transaction>,
    commit_tx: &mpsc::Sender<CommitInput>,
    ack_epoch: u32,
    txn: Transaction,
) -> Result<()> {
    if txn.zxid.epoch != ack_epoch {
        return Err(Error::ProtocolViolation(format!(
            "proposal {} is not in the acknowledged epoch {}",
            txn.zxid, ack_epoch
        )));
    }
    // A closed processor queue means the pipeline is gone; unwind and let
    // teardown surface the processor's own error if it has one.
    sync_tx
        .send(txn.clone())
        .await
        .map_err(|_| Error::BackToElection)?;
    commit_tx
        .send(CommitInput::Proposal(txn))
        .await
        .map_err(|_| Error::BackToElection)?;
    Ok(())
}

/// The follower's accepting loop and its deterministic teardown.
async fn broadcasting(
    p: &mut Participant,
    leader: ServerId,
    buffered: Vec<Transaction>,
) -> Result<()> {
    let ack_epoch = p.persistence.lock().unwrap().ack_epoch();

    let commit = CommitProcessor::spawn(
        p.state_machine.clone(),
        p.last_delivered,
        p.config.queue_depth,
    );
    let sync = SyncProposalProcessor::spawn(
        p.persistence.clone(),
        AckSink::Peer {
            transport: p.transport.clone(),
            to: leader.clone(),
        },
        p.config.server_id.clone(),
        p.config.sync_max_batch_size,
        p.config.queue_depth,
    );

    let result = accept(p, &leader, ack_epoch, &commit, &sync, buffered).await;

    // Teardown: drain the pipeline, adopt the final delivery watermark,
    // and drop the leader connection.
    let sync_result = sync.shutdown().await;
    p.last_delivered = commit.shutdown().await;
    p.transport.clear(&leader).await;

    match (result, sync_result) {
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(sync_err)) => {
            // Prefer the error which is fatal over a mere round restart.
            if err.is_round_restart() && !sync_err.is_round_restart() {
                Err(sync_err)
            } else {
                Err(err)
            }
        }
        (Ok(()), Err(sync_err)) => Err(sync_err),
        (Ok(()), Ok(())) => unreachable!("the accepting loop only exits by error"),
    }
}

async fn accept(
    p: &mut Participant,
    leader: &ServerId,
    ack_epoch: u32,
    commit: &CommitProcessor,
    sync: &SyncProposalProcessor,
    buffered: Vec<Transaction>,
) -> Result<()> {
    let commit_tx = commit.sender();
    let sync_tx = sync.sender();
    let self_id = p.config.server_id.clone();

    // Broadcast proposals which raced ahead of the sync seal enter the
    // pipeline first, preserving zxid order.
    for txn in buffered {
        forward_proposal(&sync_tx, &commit_tx, ack_epoch, txn).await?;
    }

    let mut last_heard = Instant::now();
    loop {
        let deadline = last_heard + p.config.timeout;
        let inbound = match p.recv(deadline).await {
            Err(Error::Timeout) => {
                tracing::warn!(leader = %leader, "leader went silent");
                return Err(Error::Timeout);
            }
            other => other?,
        };

        let (from, message) = match inbound {
            crate::message::Inbound::GoBack => return Err(Error::BackToElection),
            crate::message::Inbound::Disconnected { peer } if peer == *leader => {
                return Err(Error::BackToElection)
            }
            crate::message::Inbound::Disconnected { peer } => {
                p.transport.clear(&peer).await;
                continue;
            }
            crate::message::Inbound::Message { from, message } => (from, message),
        };

        if from == *leader {
            last_heard = Instant::now();
            match message {
                Message::Proposal { txn } => {
                    forward_proposal(&sync_tx, &commit_tx, ack_epoch, txn).await?;
                }
                Message::Commit { zxid } => {
                    commit_tx
                        .send(CommitInput::Commit(zxid))
                        .await
                        .map_err(|_| Error::BackToElection)?;
                }
                Message::Heartbeat => {
                    p.transport.send(leader, Message::Heartbeat).await;
                }
                Message::ShutDown => return Err(Error::LeftCluster),
                Message::QueryLeader => {
                    p.transport
                        .send(
                            leader,
                            Message::QueryLeaderReply {
                                leader: Some(leader.clone()),
                            },
                        )
                        .await;
                }
                other => {
                    tracing::warn!(kind = other.kind(), "dropping unexpected message from leader");
                }
            }
        } else {
            match message {
                Message::Request { body } if from == self_id => {
                    // Local client request: forward to the leader.
                    p.transport
                        .send(leader, Message::Request { body })
                        .await;
                }
                Message::QueryLeader => {
                    p.transport
                        .send(
                            &from,
                            Message::QueryLeaderReply {
                                leader: Some(leader.clone()),
                            },
                        )
                        .await;
                }
                Message::ProposedEpoch { .. }
                | Message::AckEpoch { .. }
                | Message::Ack { .. }
                | Message::Join => {
                    tracing::debug!(from = %from, "not a follower's message; clearing sender");
                    p.transport.clear(&from).await;
                }
                other => {
                    tracing::warn!(from = %from, kind = other.kind(), "dropping unexpected message");
                }
            }
        }
    }
}
