//! The leader's side of a round: gather a quorum of epoch proposals,
//! establish the new epoch, adopt and replicate the initial history, then
//! run the broadcast pipeline and absorb late joiners.

use super::{sync, Participant};
use crate::message::{ClusterConfig, Inbound, Message, ServerId, Transaction, Zxid};
use crate::processors::{
    AckInput, AckProcessor, AckSink, CommitInput, CommitProcessor, PreProcessor,
    SyncProposalProcessor,
};
use crate::state_machine::Phase;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// A peer being caught up while the cluster is live.
enum Joiner {
    /// We answered its discovery with our epoch; its history head is next.
    AwaitingAckEpoch { via_join: bool },
    /// Its synchronization stream is shipped; it owes an ack of the sync
    /// point before it participates.
    Syncing { sync_zxid: Zxid, via_join: bool },
}

pub(super) async fn lead(p: &mut Participant) -> Result<()> {
    let self_id = p.config.server_id.clone();
    p.set_phase(Phase::Discovering, Some(self_id.clone()), true);

    let mut config = match p.persistence.lock().unwrap().last_seen_config().cloned() {
        Some(config) => config,
        None => {
            tracing::warn!("elected without a cluster configuration; no quorum to gather");
            return Err(Error::BackToElection);
        }
    };

    // Discovery messages from servers outside the configuration are
    // replayed once the broadcast pipeline can absorb them.
    let mut stash: Vec<(ServerId, Message)> = Vec::new();

    // Gather a quorum (ourselves included) of epoch proposals.
    let mut responders: BTreeSet<ServerId> = BTreeSet::new();
    let mut max_proposed = p.persistence.lock().unwrap().proposed_epoch();
    let deadline = p.deadline();
    while responders.len() + 1 < config.quorum_size() {
        let (from, message) = recv(p, deadline).await?;
        match message {
            Message::ProposedEpoch {
                proposed,
                acked,
                config: peer_config,
            } => {
                if config.peers.contains(&from) {
                    adopt_config(p, &mut config, peer_config.as_ref())?;
                    max_proposed = max_proposed.max(proposed);
                    responders.insert(from);
                } else {
                    tracing::debug!(from = %from, "deferring out-of-configuration peer to join handling");
                    stash.push((
                        from,
                        Message::ProposedEpoch {
                            proposed,
                            acked,
                            config: peer_config,
                        },
                    ));
                }
            }
            Message::Join => stash.push((from, Message::Join)),
            Message::QueryLeader => {
                reply_leader(p, &from, &self_id).await;
            }
            Message::Heartbeat => {}
            other => unexpected(p, &from, &other).await,
        }
    }

    let epoch = max_proposed + 1;
    p.persistence.lock().unwrap().set_proposed_epoch(epoch)?;
    for peer in &responders {
        p.transport.send(peer, Message::NewEpoch { epoch }).await;
    }
    tracing::info!(epoch, responders = responders.len(), "established new epoch");

    // Collect the responders' history heads; a quorum of them (with us)
    // is enough to proceed once the deadline passes.
    let mut infos: BTreeMap<ServerId, (u32, Zxid)> = BTreeMap::new();
    let deadline = p.deadline();
    while infos.len() < responders.len() {
        let (from, message) = match recv(p, deadline).await {
            Err(Error::Timeout) if infos.len() + 1 >= config.quorum_size() => break,
            other => other?,
        };
        match message {
            Message::AckEpoch { acked, last_zxid } if responders.contains(&from) => {
                infos.insert(from, (acked, last_zxid));
            }
            Message::ProposedEpoch { .. } | Message::Join => stash.push((from, message)),
            Message::QueryLeader => reply_leader(p, &from, &self_id).await,
            Message::Heartbeat => {}
            other => unexpected(p, &from, &other).await,
        }
    }
    if infos.len() + 1 < config.quorum_size() {
        return Err(Error::Timeout);
    }

    p.set_phase(Phase::Synchronizing, Some(self_id.clone()), true);

    // The best (ackEpoch, lastZxid) history becomes the initial history,
    // ties broken by ascending server id.
    let own = {
        let persistence = p.persistence.lock().unwrap();
        (persistence.ack_epoch(), persistence.latest_zxid())
    };
    let mut candidates: Vec<(&ServerId, (u32, Zxid))> = vec![(&self_id, own)];
    candidates.extend(infos.iter().map(|(id, info)| (id, *info)));
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let (owner, owner_info) = (candidates[0].0.clone(), candidates[0].1);
    tracing::info!(
        owner = %owner,
        owner_epoch = owner_info.0,
        owner_latest = %owner_info.1,
        "selected initial history"
    );

    if owner != self_id {
        pull_history(p, &owner).await?;
    }
    {
        let mut persistence = p.persistence.lock().unwrap();
        persistence.set_ack_epoch(epoch)?;
        persistence.log().sync()?;
    }

    // Replicate the initial history. There is no broadcast traffic yet,
    // so the in-flight tail is empty and the watermark is quiescent.
    let (_delivered_guard, delivered) = watch::channel(p.last_delivered);
    let tail = BTreeMap::new();
    let mut expected: BTreeMap<ServerId, Zxid> = BTreeMap::new();
    for (id, (_acked, last_zxid)) in &infos {
        let sync_zxid =
            sync::ship(p, id, *last_zxid, epoch, &config, &delivered, &tail, false).await?;
        expected.insert(id.clone(), sync_zxid);
    }

    // Await acks of the sync point from a quorum.
    let mut synced: BTreeSet<ServerId> = BTreeSet::new();
    let deadline = p.deadline();
    while synced.len() + 1 < config.quorum_size() {
        let (from, message) = recv(p, deadline).await?;
        match message {
            Message::Ack { zxid } if expected.get(&from) == Some(&zxid) => {
                synced.insert(from);
            }
            Message::Ack { zxid } => {
                tracing::debug!(from = %from, %zxid, "ack does not name the sync point");
            }
            Message::ProposedEpoch { .. } | Message::Join => stash.push((from, message)),
            Message::QueryLeader => reply_leader(p, &from, &self_id).await,
            Message::Heartbeat => {}
            other => unexpected(p, &from, &other).await,
        }
    }

    // Seal the round: commit the synchronized history on every acked
    // follower and locally.
    for id in &synced {
        let zxid = expected[id];
        p.transport.send(id, Message::Commit { zxid }).await;
    }
    p.deliver_pending()?;
    p.state_machine.lock().unwrap().leading(&config.peers);

    // Responders which acked the epoch but not yet the sync point finish
    // synchronizing while we broadcast.
    let mut joiners: HashMap<ServerId, Joiner> = HashMap::new();
    for (id, _) in &infos {
        if !synced.contains(id) {
            joiners.insert(
                id.clone(),
                Joiner::Syncing {
                    sync_zxid: expected[id],
                    via_join: false,
                },
            );
        }
    }

    let latest = p.persistence.lock().unwrap().latest_zxid();
    p.set_phase(Phase::Broadcasting, Some(self_id.clone()), true);
    broadcasting(p, epoch, latest, config, synced, joiners, stash).await
}

/// Receive policy while leading, before the broadcast pipeline exists:
/// timeouts and go-backs unwind, disconnects only clear (quorum formation
/// decides liveness).
async fn recv(p: &mut Participant, deadline: Instant) -> Result<(ServerId, Message)> {
    loop {
        match p.recv(deadline).await? {
            Inbound::GoBack => return Err(Error::BackToElection),
            Inbound::Disconnected { peer } => {
                p.transport.clear(&peer).await;
            }
            Inbound::Message { from, message } => return Ok((from, message)),
        }
    }
}

/// Another server speaking with a leader's voice is stale or competing;
/// clear it so it reconnects and re-discovers.
async fn unexpected(p: &mut Participant, from: &ServerId, message: &Message) {
    match message {
        Message::NewEpoch { .. }
        | Message::NewLeader { .. }
        | Message::SyncDirective(_)
        | Message::Proposal { .. }
        | Message::Commit { .. }
        | Message::PullLog { .. } => {
            tracing::warn!(from = %from, kind = message.kind(), "leader-role message from a peer; clearing");
            p.transport.clear(from).await;
        }
        other => {
            tracing::debug!(from = %from, kind = other.kind(), "dropping unexpected message");
        }
    }
}

async fn reply_leader(p: &mut Participant, to: &ServerId, leader: &ServerId) {
    p.transport
        .send(
            to,
            Message::QueryLeaderReply {
                leader: Some(leader.clone()),
            },
        )
        .await;
}

fn adopt_config(
    p: &mut Participant,
    config: &mut ClusterConfig,
    peer_config: Option<&ClusterConfig>,
) -> Result<()> {
    let Some(peer_config) = peer_config else {
        return Ok(());
    };
    if peer_config.version <= config.version {
        return Ok(());
    }
    tracing::info!(version = %peer_config.version, "adopting newer cluster configuration from peer");
    p.persistence
        .lock()
        .unwrap()
        .set_last_seen_config(peer_config.clone())?;
    *config = peer_config.clone();
    p.state_machine
        .lock()
        .unwrap()
        .cluster_change(&config.peers);
    Ok(())
}

/// Fetch the initial history from its owner and graft it onto our log:
/// keep the common prefix, truncate our divergent suffix, append theirs.
async fn pull_history(p: &mut Participant, owner: &ServerId) -> Result<()> {
    p.transport
        .send(owner, Message::PullLog { from: Zxid::NULL })
        .await;

    let mut pulled: Vec<Transaction> = Vec::new();
    let deadline = p.deadline();
    loop {
        let (from, message) = recv(p, deadline).await?;
        if from != *owner {
            tracing::debug!(from = %from, kind = message.kind(), "ignoring while pulling history");
            continue;
        }
        match message {
            Message::Proposal { txn } => pulled.push(txn),
            Message::PullDone { last_zxid } => {
                let got = pulled.last().map(|txn| txn.zxid).unwrap_or(Zxid::NULL);
                if got != last_zxid {
                    return Err(Error::ProtocolViolation(format!(
                        "history pull ended at {got}, owner reported {last_zxid}"
                    )));
                }
                break;
            }
            Message::Heartbeat => {}
            other => {
                tracing::debug!(kind = other.kind(), "ignoring while pulling history");
            }
        }
    }
    tracing::info!(count = pulled.len(), "pulled initial history");

    let mut persistence = p.persistence.lock().unwrap();
    let mine: Vec<Zxid> = persistence
        .log()
        .iterate(Zxid::NULL)?
        .map(|txn| txn.map(|txn| txn.zxid))
        .collect::<Result<_>>()?;

    let mut common = 0;
    while common < mine.len() && common < pulled.len() && mine[common] == pulled[common].zxid {
        common += 1;
    }
    if common < mine.len() {
        let cut = if common == 0 {
            Zxid::NULL
        } else {
            pulled[common - 1].zxid
        };
        if p.last_delivered > cut {
            return Err(Error::ProtocolViolation(format!(
                "initial history would cut below delivered {}",
                p.last_delivered
            )));
        }
        persistence.log().truncate(cut)?;
    }
    for txn in &pulled[common..] {
        persistence.log().append(txn)?;
    }
    persistence.log().sync()?;
    Ok(())
}

/// The broadcast pipeline and its deterministic teardown.
async fn broadcasting(
    p: &mut Participant,
    epoch: u32,
    latest: Zxid,
    config: ClusterConfig,
    active: BTreeSet<ServerId>,
    joiners: HashMap<ServerId, Joiner>,
    stash: Vec<(ServerId, Message)>,
) -> Result<()> {
    let self_id = p.config.server_id.clone();
    let depth = p.config.queue_depth;

    let commit = CommitProcessor::spawn(p.state_machine.clone(), p.last_delivered, depth);
    let ack = AckProcessor::spawn(
        p.transport.clone(),
        commit.sender(),
        active.clone(),
        config.quorum_size(),
        latest,
        depth,
    );
    let sync_proc = SyncProposalProcessor::spawn(
        p.persistence.clone(),
        AckSink::Loop(ack.sender()),
        self_id.clone(),
        p.config.sync_max_batch_size,
        depth,
    );
    let (pre_out_tx, mut pre_out_rx) = mpsc::channel(depth);
    let pre = PreProcessor::spawn(epoch, pre_out_tx, depth);

    let result = accept(
        p,
        epoch,
        config,
        active,
        joiners,
        stash,
        &commit,
        &ack,
        &sync_proc,
        &pre,
        &mut pre_out_rx,
    )
    .await;

    // Teardown in pipeline order: stop accepting requests, then drain
    // persistence, then quorum accounting, then delivery.
    drop(pre_out_rx);
    pre.shutdown().await;
    let sync_result = sync_proc.shutdown().await;
    ack.shutdown().await;
    p.last_delivered = commit.shutdown().await;

    for peer in p.config.servers.keys() {
        if *peer != self_id {
            p.transport.clear(peer).await;
        }
    }

    match (result, sync_result) {
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(sync_err)) => {
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
    epoch: u32,
    mut config: ClusterConfig,
    active: BTreeSet<ServerId>,
    mut joiners: HashMap<ServerId, Joiner>,
    stash: Vec<(ServerId, Message)>,
    commit: &CommitProcessor,
    ack: &AckProcessor,
    sync_proc: &SyncProposalProcessor,
    pre: &PreProcessor,
    pre_out_rx: &mut mpsc::Receiver<Transaction>,
) -> Result<()> {
    let self_id = p.config.server_id.clone();
    let commit_tx = commit.sender();
    let ack_tx = ack.sender();
    let sync_tx = sync_proc.sender();
    let pre_tx = pre.sender();
    let delivered = commit.delivered();

    // Join attempts which arrived before the pipeline existed.
    for (from, message) in stash {
        p.queue.message(from, message).await;
    }

    let mut active: BTreeMap<ServerId, Instant> = active
        .into_iter()
        .map(|id| (id, Instant::now()))
        .collect();
    // Proposals fanned out but possibly not yet in the log; joiner syncs
    // ship from the log plus this tail.
    let mut tail: BTreeMap<Zxid, Transaction> = BTreeMap::new();
    let mut beat = tokio::time::interval(p.config.heartbeat_period());
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let cancel = p.cancel.clone();

    enum Event {
        Inbound(Inbound),
        Proposal(Transaction),
        Beat,
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            inbound = p.rx.recv() => match inbound {
                Some(inbound) => Event::Inbound(inbound),
                None => return Err(Error::Cancelled),
            },
            proposal = pre_out_rx.recv() => match proposal {
                Some(txn) => Event::Proposal(txn),
                None => return Err(Error::BackToElection),
            },
            _ = beat.tick() => Event::Beat,
        };

        match event {
            Event::Inbound(Inbound::GoBack) => return Err(Error::BackToElection),
            Event::Inbound(Inbound::Disconnected { peer }) => {
                if active.remove(&peer).is_some() {
                    let _ = ack_tx.send(AckInput::RemoveFollower(peer.clone())).await;
                    tracing::warn!(peer = %peer, "active follower disconnected");
                } else {
                    joiners.remove(&peer);
                }
                p.transport.clear(&peer).await;
                if active.len() + 1 < config.quorum_size() {
                    return Err(Error::BackToElection);
                }
            }
            Event::Inbound(Inbound::Message { from, message }) => {
                if let Some(heard) = active.get_mut(&from) {
                    *heard = Instant::now();
                }
                match message {
                    Message::Request { body } => {
                        pre_tx.send(body).await.map_err(|_| Error::BackToElection)?;
                    }
                    Message::Ack { zxid } => match joiners.get(&from) {
                        Some(Joiner::Syncing { sync_zxid, via_join }) if zxid == *sync_zxid => {
                            let via_join = *via_join;
                            joiners.remove(&from);
                            activate(
                                p,
                                &from,
                                zxid,
                                via_join,
                                &mut config,
                                &mut active,
                                &ack_tx,
                                &delivered,
                            )
                            .await?;
                        }
                        _ => {
                            ack_tx
                                .send(AckInput::Ack { from, zxid })
                                .await
                                .map_err(|_| Error::BackToElection)?;
                        }
                    },
                    Message::AckEpoch { acked: _, last_zxid } => match joiners.get(&from) {
                        Some(Joiner::AwaitingAckEpoch { via_join }) => {
                            let via_join = *via_join;
                            let sync_zxid = sync::ship(
                                p, &from, last_zxid, epoch, &config, &delivered, &tail, true,
                            )
                            .await?;
                            joiners.insert(from, Joiner::Syncing { sync_zxid, via_join });
                        }
                        _ => {
                            tracing::debug!(from = %from, "dropping unsolicited epoch ack");
                        }
                    },
                    Message::ProposedEpoch { proposed, .. } => {
                        if proposed > epoch {
                            tracing::warn!(from = %from, proposed, "peer promised a newer epoch");
                            return Err(Error::BackToElection);
                        }
                        p.transport.send(&from, Message::NewEpoch { epoch }).await;
                        joiners.insert(from, Joiner::AwaitingAckEpoch { via_join: false });
                    }
                    Message::Join => {
                        p.transport.send(&from, Message::NewEpoch { epoch }).await;
                        joiners.insert(from, Joiner::AwaitingAckEpoch { via_join: true });
                    }
                    Message::Heartbeat => {}
                    Message::QueryLeader => reply_leader(p, &from, &self_id).await,
                    Message::QueryLeaderReply { .. } | Message::PullDone { .. } => {
                        tracing::debug!(from = %from, kind = message.kind(), "dropping");
                    }
                    Message::ShutDown => {
                        tracing::warn!(from = %from, "ignoring shutdown not addressed to a follower");
                    }
                    other => unexpected(p, &from, &other).await,
                }
            }
            Event::Proposal(txn) => {
                let log_latest = p.persistence.lock().unwrap().latest_zxid();
                tail.retain(|zxid, _| *zxid > log_latest);
                tail.insert(txn.zxid, txn.clone());

                for peer in active.keys() {
                    p.transport
                        .send(peer, Message::Proposal { txn: txn.clone() })
                        .await;
                }
                for (peer, joiner) in &joiners {
                    if matches!(joiner, Joiner::Syncing { .. }) {
                        p.transport
                            .send(peer, Message::Proposal { txn: txn.clone() })
                            .await;
                    }
                }
                sync_tx
                    .send(txn.clone())
                    .await
                    .map_err(|_| Error::BackToElection)?;
                commit_tx
                    .send(CommitInput::Proposal(txn))
                    .await
                    .map_err(|_| Error::BackToElection)?;
            }
            Event::Beat => {
                for peer in active.keys() {
                    p.transport.send(peer, Message::Heartbeat).await;
                }
                let now = Instant::now();
                let fresh = active
                    .values()
                    .filter(|heard| now.duration_since(**heard) <= p.config.timeout)
                    .count();
                if fresh + 1 < config.quorum_size() {
                    tracing::warn!(
                        fresh,
                        quorum = config.quorum_size(),
                        "lost contact with the quorum"
                    );
                    return Err(Error::Timeout);
                }
            }
        }
    }
}

/// A synchronized peer becomes an active follower: seal its history with
/// commits, start counting it toward quorums, and record membership when
/// it joined from outside the configuration.
#[allow(clippy::too_many_arguments)]
async fn activate(
    p: &mut Participant,
    peer: &ServerId,
    sync_zxid: Zxid,
    via_join: bool,
    config: &mut ClusterConfig,
    active: &mut BTreeMap<ServerId, Instant>,
    ack_tx: &mpsc::Sender<AckInput>,
    delivered: &watch::Receiver<Zxid>,
) -> Result<()> {
    p.transport
        .send(peer, Message::Commit { zxid: sync_zxid })
        .await;
    let watermark = *delivered.borrow();
    if watermark > sync_zxid {
        p.transport
            .send(peer, Message::Commit { zxid: watermark })
            .await;
    }

    active.insert(peer.clone(), Instant::now());
    ack_tx
        .send(AckInput::AddFollower(peer.clone()))
        .await
        .map_err(|_| Error::BackToElection)?;
    tracing::info!(peer = %peer, sync = %sync_zxid, "follower is synchronized and active");

    if via_join && !config.peers.contains(peer) {
        let latest = p.persistence.lock().unwrap().latest_zxid();
        config.peers.insert(peer.clone());
        config.version = if latest > config.version {
            latest
        } else {
            config.version.next()
        };
        p.persistence
            .lock()
            .unwrap()
            .set_last_seen_config(config.clone())?;
        p.state_machine
            .lock()
            .unwrap()
            .cluster_change(&config.peers);
        ack_tx
            .send(AckInput::SetQuorum(config.quorum_size()))
            .await
            .map_err(|_| Error::BackToElection)?;
        tracing::info!(peer = %peer, version = %config.version, "admitted to the cluster");
    }
    Ok(())
}
