//! Leader-side alignment of a follower's log: pick a strategy from the
//! follower's history head, then ship the directive, the history stream,
//! and the closing `NewLeader`.

use super::Participant;
use crate::log::Log;
use crate::message::{ClusterConfig, Message, ServerId, SyncDirective, Transaction, Zxid};
use crate::Result;
use std::collections::BTreeMap;
use tokio::sync::watch;

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Plan {
    /// The follower's head is a prefix of ours: ship what it lacks.
    Diff { from: Zxid },
    /// The follower holds a divergent suffix: cut it back to the common
    /// ancestor, then ship from there.
    Truncate { to: Zxid },
    /// The range the follower needs has been retired from the log: full
    /// state transfer.
    Snapshot,
}

pub(super) fn plan(log: &Log, follower_last: Zxid) -> Plan {
    if log.contains(follower_last) || (follower_last.is_null() && log.floor().is_null()) {
        return Plan::Diff {
            from: follower_last,
        };
    }
    if follower_last < log.floor() {
        return Plan::Snapshot;
    }
    match log.greatest_below(follower_last) {
        Some(ancestor) => Plan::Truncate { to: ancestor },
        None if log.floor().is_null() => Plan::Truncate { to: Zxid::NULL },
        None => Plan::Snapshot,
    }
}

/// Ship one follower's synchronization stream. `tail` holds proposals
/// fanned out by the accepting loop which may not have reached the log
/// yet; `delivered` is the live delivery watermark. Returns the sync
/// point the follower is expected to acknowledge.
///
/// During the initial round synchronization (`live == false`) the whole
/// history ships ahead of `NewLeader`: the quorum of sync acks is what
/// commits it. For a join into a broadcasting cluster (`live == true`)
/// only the committed prefix is sealed that way; anything past the
/// delivery watermark is uncommitted, and ships after `NewLeader` as
/// ordinary proposals which commit through quorum accounting.
pub(super) async fn ship(
    p: &mut Participant,
    to: &ServerId,
    follower_last: Zxid,
    epoch: u32,
    config: &ClusterConfig,
    delivered: &watch::Receiver<Zxid>,
    tail: &BTreeMap<Zxid, Transaction>,
    live: bool,
) -> Result<Zxid> {
    let watermark = *delivered.borrow();

    let decided = {
        let mut persistence = p.persistence.lock().unwrap();
        let log = persistence.log();
        if live && follower_last > watermark {
            // The follower's head is past our committed prefix; tear it
            // back and re-ship the suffix through the live path.
            if log.contains(watermark) {
                Plan::Truncate { to: watermark }
            } else {
                match log.greatest_below(watermark) {
                    Some(ancestor) => Plan::Truncate { to: ancestor },
                    None if log.floor().is_null() => Plan::Truncate { to: Zxid::NULL },
                    None => Plan::Snapshot,
                }
            }
        } else {
            plan(log, follower_last)
        }
    };

    let (directive, base) = match decided {
        Plan::Diff { from } => (SyncDirective::Diff { from }, from),
        Plan::Truncate { to } => (SyncDirective::Truncate { to }, to),
        Plan::Snapshot => {
            // Capture the snapshot and its watermark under the state
            // machine's lock, so the watermark names exactly what the
            // snapshot contains.
            let (zxid, state) = {
                let mut state_machine = p.state_machine.lock().unwrap();
                (*delivered.borrow(), state_machine.save())
            };
            (SyncDirective::Snapshot { zxid, state }, zxid)
        }
    };

    let (mut stream, log_latest) = {
        let mut persistence = p.persistence.lock().unwrap();
        let stream: Vec<Transaction> = persistence
            .log()
            .iterate(base.next())?
            .collect::<Result<Vec<_>>>()?;
        (stream, persistence.latest_zxid())
    };
    // Proposals in flight past the log's head complete the stream.
    for (zxid, txn) in tail.range(..) {
        if *zxid > base && *zxid > log_latest {
            stream.push(txn.clone());
        }
    }

    // Split the sealed history from the uncommitted suffix.
    let uncommitted = if live {
        let cut = stream.partition_point(|txn| txn.zxid <= watermark);
        stream.split_off(cut)
    } else {
        Vec::new()
    };
    let sync_zxid = stream.last().map(|txn| txn.zxid).unwrap_or(base);

    let strategy = match &directive {
        SyncDirective::Diff { .. } => "diff",
        SyncDirective::Truncate { .. } => "truncate",
        SyncDirective::Snapshot { .. } => "snapshot",
    };
    tracing::info!(
        to = %to,
        strategy,
        base = %base,
        count = stream.len(),
        in_flight = uncommitted.len(),
        sync = %sync_zxid,
        "synchronizing follower"
    );

    p.transport.send(to, Message::SyncDirective(directive)).await;
    for txn in stream {
        p.transport.send(to, Message::Proposal { txn }).await;
    }
    p.transport
        .send(
            to,
            Message::NewLeader {
                epoch,
                config: config.clone(),
            },
        )
        .await;
    for txn in uncommitted {
        p.transport.send(to, Message::Proposal { txn }).await;
    }
    Ok(sync_zxid)
}
