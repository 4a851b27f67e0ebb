use bytes::Bytes;
use std::collections::BTreeSet;

/// Identity of a server within the ensemble. Unique, stable across restarts.
pub type ServerId = String;

/// Transaction id: the total order over everything the cluster broadcasts.
/// Ordering is lexicographic over (epoch, counter).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Zxid {
    pub epoch: u32,
    pub counter: u64,
}

impl Zxid {
    /// Sentinel which precedes every real transaction id.
    pub const NULL: Zxid = Zxid {
        epoch: 0,
        counter: 0,
    };

    pub fn new(epoch: u32, counter: u64) -> Zxid {
        Zxid { epoch, counter }
    }

    pub fn is_null(&self) -> bool {
        *self == Zxid::NULL
    }

    /// The id following this one within the same epoch.
    pub fn next(&self) -> Zxid {
        Zxid {
            epoch: self.epoch,
            counter: self.counter + 1,
        }
    }
}

impl std::fmt::Display for Zxid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch, self.counter)
    }
}

/// A single broadcast transaction. Created once by the leader's
/// pre-processor and immutable from then on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub zxid: Zxid,
    pub kind: u32,
    pub body: Bytes,
}

impl Transaction {
    pub fn new(zxid: Zxid, kind: u32, body: Bytes) -> Transaction {
        Transaction { zxid, kind, body }
    }
}

/// The most recently observed cluster membership, versioned by the zxid at
/// which it was recorded. Quorum counting is a strict majority of `peers`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterConfig {
    pub version: Zxid,
    pub peers: BTreeSet<ServerId>,
}

impl ClusterConfig {
    pub fn new(version: Zxid, peers: impl IntoIterator<Item = ServerId>) -> ClusterConfig {
        ClusterConfig {
            version,
            peers: peers.into_iter().collect(),
        }
    }

    /// Smallest number of servers which constitutes a strict majority.
    pub fn quorum_size(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// How a follower's log is brought in line with the leader's, shipped ahead
/// of the proposal stream which follows it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncDirective {
    /// Keep everything at or below `from`; proposals above it follow.
    Diff { from: Zxid },
    /// Drop the divergent suffix above `to`, then apply the diff.
    Truncate { to: Zxid },
    /// Full state transfer: the needed range is no longer in the leader's
    /// log. `zxid` is the watermark the snapshot captures.
    Snapshot { zxid: Zxid, state: Bytes },
}

/// The logical wire protocol. Serialization is the transport's concern;
/// these are the messages the engine sends and receives.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Message {
    /// Follower -> elected leader: open discovery with our promised and
    /// acknowledged epochs and last-seen configuration.
    ProposedEpoch {
        proposed: u32,
        acked: u32,
        config: Option<ClusterConfig>,
    },
    /// Leader -> follower: the epoch of the new round.
    NewEpoch { epoch: u32 },
    /// Follower -> leader: accepted the new epoch; here is our history head.
    AckEpoch { acked: u32, last_zxid: Zxid },
    /// Leader -> follower: how the follower's log will be aligned.
    SyncDirective(SyncDirective),
    /// Leader -> follower: the synchronization stream is complete. Carries
    /// the leader's current membership, which followers adopt when its
    /// version is newer than theirs.
    NewLeader { epoch: u32, config: ClusterConfig },
    /// Acknowledges a durably persisted zxid.
    Ack { zxid: Zxid },
    /// Orders delivery of everything at or below `zxid`.
    Commit { zxid: Zxid },
    /// A broadcast (or history replay) transaction.
    Proposal { txn: Transaction },
    /// A client request, submitted locally or forwarded by a follower.
    Request { body: Bytes },
    Heartbeat,
    QueryLeader,
    QueryLeaderReply { leader: Option<ServerId> },
    /// An uninitialized server asking to be admitted to the cluster.
    Join,
    /// Leader -> initial-history owner: ship your log above `from`.
    PullLog { from: Zxid },
    /// Closes a `PullLog` proposal stream.
    PullDone { last_zxid: Zxid },
    /// Leader -> follower: you have been removed; leave the cluster.
    ShutDown,
}

impl Message {
    /// Stable name used for expectation matching and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ProposedEpoch { .. } => "PROPOSED_EPOCH",
            Message::NewEpoch { .. } => "NEW_EPOCH",
            Message::AckEpoch { .. } => "ACK_EPOCH",
            Message::SyncDirective(_) => "SYNC_DIRECTIVE",
            Message::NewLeader { .. } => "NEW_LEADER",
            Message::Ack { .. } => "ACK",
            Message::Commit { .. } => "COMMIT",
            Message::Proposal { .. } => "PROPOSAL",
            Message::Request { .. } => "REQUEST",
            Message::Heartbeat => "HEARTBEAT",
            Message::QueryLeader => "QUERY_LEADER",
            Message::QueryLeaderReply { .. } => "QUERY_LEADER_REPLY",
            Message::Join => "JOIN",
            Message::PullLog { .. } => "PULL_LOG",
            Message::PullDone { .. } => "PULL_DONE",
            Message::ShutDown => "SHUT_DOWN",
        }
    }
}

/// What the participant driver consumes from its single inbound queue:
/// peer messages, plus the two synthetic tuples.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message { from: ServerId, message: Message },
    /// The transport lost the connection to `peer`.
    Disconnected { peer: ServerId },
    /// The election oracle wants the round restarted.
    GoBack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zxid_order_is_lexicographic() {
        let mut ids = vec![
            Zxid::new(2, 1),
            Zxid::new(1, 9),
            Zxid::NULL,
            Zxid::new(1, 10),
            Zxid::new(2, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                Zxid::NULL,
                Zxid::new(1, 9),
                Zxid::new(1, 10),
                Zxid::new(2, 0),
                Zxid::new(2, 1),
            ]
        );
    }

    #[test]
    fn zxid_null_precedes_all() {
        assert!(Zxid::NULL < Zxid::new(0, 1));
        assert!(Zxid::NULL < Zxid::new(1, 0));
        assert!(Zxid::NULL.is_null());
        assert!(!Zxid::new(0, 1).is_null());
    }

    #[test]
    fn quorum_is_strict_majority() {
        let cfg = |n: usize| {
            ClusterConfig::new(Zxid::NULL, (0..n).map(|i| format!("s{i}")))
        };
        assert_eq!(cfg(1).quorum_size(), 1);
        assert_eq!(cfg(2).quorum_size(), 2);
        assert_eq!(cfg(3).quorum_size(), 2);
        assert_eq!(cfg(4).quorum_size(), 3);
        assert_eq!(cfg(5).quorum_size(), 3);
    }

    #[test]
    fn wire_shapes_are_stable() {
        // Peers of mixed versions must agree on these encodings.
        let messages = vec![
            Message::ProposedEpoch {
                proposed: 1,
                acked: 0,
                config: Some(ClusterConfig::new(
                    Zxid::new(0, 0),
                    ["a".to_string(), "b".to_string()],
                )),
            },
            Message::NewEpoch { epoch: 2 },
            Message::AckEpoch {
                acked: 1,
                last_zxid: Zxid::new(1, 7),
            },
            Message::Commit {
                zxid: Zxid::new(2, 1),
            },
            Message::Heartbeat,
        ];
        insta::assert_snapshot!(
            serde_json::to_string(&messages).unwrap(),
            @r###"[{"ProposedEpoch":{"proposed":1,"acked":0,"config":{"version":{"epoch":0,"counter":0},"peers":["a","b"]}}},{"NewEpoch":{"epoch":2}},{"AckEpoch":{"acked":1,"last_zxid":{"epoch":1,"counter":7}}},{"Commit":{"zxid":{"epoch":2,"counter":1}}},"Heartbeat"]"###
        );
    }

    #[test]
    fn messages_round_trip_through_json() {
        let msg = Message::Proposal {
            txn: Transaction::new(Zxid::new(3, 7), 1, Bytes::from_static(b"payload")),
        };
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }
}
