//! Multi-replica scenarios over the in-process transport: a scripted
//! oracle picks leaders, replicas run the full phase machine, and the
//! recorded deliveries are checked for ordering, prefix agreement, and
//! durability across crashes.

use bytes::Bytes;
use crier::log::Log;
use crier::message::{ServerId, Transaction, Zxid};
use crier::oracle::{ElectionOracle, FixedLeader};
use crier::persistence::Persistence;
use crier::transport::mem::Hub;
use crier::{queue, Config, Handle, Participant, Phase, StateMachine};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Recorded {
    delivered: Arc<Mutex<Vec<(Zxid, Bytes)>>>,
    restored: Arc<Mutex<Option<Bytes>>>,
}

impl Recorded {
    fn zxids(&self) -> Vec<Zxid> {
        self.delivered.lock().unwrap().iter().map(|(z, _)| *z).collect()
    }

    fn bodies(&self) -> Vec<Bytes> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }
}

/// Test state machine: records deliveries, supports snapshot transfer as
/// an opaque copy of the recorded bodies.
struct Recorder {
    recorded: Recorded,
    watermark: Zxid,
    snapshot: Bytes,
}

impl Recorder {
    fn new(recorded: Recorded) -> Recorder {
        Recorder {
            recorded,
            watermark: Zxid::NULL,
            snapshot: Bytes::new(),
        }
    }

    fn recovered_at(recorded: Recorded, watermark: Zxid, snapshot: Bytes) -> Recorder {
        Recorder {
            recorded,
            watermark,
            snapshot,
        }
    }
}

impl StateMachine for Recorder {
    fn deliver(&mut self, txn: &Transaction) {
        self.recorded
            .delivered
            .lock()
            .unwrap()
            .push((txn.zxid, txn.body.clone()));
    }

    fn recovered(&mut self) -> Zxid {
        self.watermark
    }

    fn save(&mut self) -> Bytes {
        self.snapshot.clone()
    }

    fn restore(&mut self, snapshot: Bytes) {
        *self.recorded.restored.lock().unwrap() = Some(snapshot);
    }
}

struct Replica {
    id: ServerId,
    dir: TempDir,
    handle: Handle,
    task: tokio::task::JoinHandle<crier::Result<()>>,
    recorded: Recorded,
}

impl Replica {
    /// Stop the replica and release its log directory lock.
    async fn stop(self) -> (TempDir, crier::Result<()>) {
        self.handle.shutdown();
        let result = self.task.await.expect("replica panicked");
        (self.dir, result)
    }
}

fn config_for(id: &str, members: &[&str], dir: &Path, timeout: Duration) -> Config {
    let servers: BTreeMap<ServerId, String> = members
        .iter()
        .map(|m| (m.to_string(), format!("mem:{m}")))
        .collect();
    Config {
        server_id: id.to_string(),
        servers,
        logdir: dir.to_path_buf(),
        timeout,
        sync_max_batch_size: 16,
        segment_max_bytes: 1 << 20,
        queue_depth: 256,
    }
}

fn start_replica(
    hub: &Hub,
    id: &str,
    members: &[&str],
    dir: TempDir,
    oracle: Arc<dyn ElectionOracle>,
    timeout: Duration,
) -> Replica {
    start_replica_with(hub, id, members, dir, oracle, timeout, Recorder::new)
}

fn start_replica_with(
    hub: &Hub,
    id: &str,
    members: &[&str],
    dir: TempDir,
    oracle: Arc<dyn ElectionOracle>,
    timeout: Duration,
    make_sm: impl FnOnce(Recorded) -> Recorder,
) -> Replica {
    let recorded = Recorded::default();
    let config = config_for(id, members, dir.path(), timeout);
    config.validate().unwrap();

    let (queue_tx, queue_rx) = queue::bounded(config.queue_depth);
    hub.register(id.to_string(), queue_tx.clone());
    let transport = Arc::new(hub.endpoint(id.to_string()));

    let (participant, handle) = Participant::new(
        config,
        transport,
        queue_tx,
        queue_rx,
        oracle,
        make_sm(recorded.clone()),
    )
    .expect("failed to build participant");

    Replica {
        id: id.to_string(),
        dir,
        handle,
        task: tokio::spawn(participant.run()),
        recorded,
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn all_broadcasting(replicas: &mut [&mut Replica]) {
    for replica in replicas {
        tokio::time::timeout(Duration::from_secs(10), replica.handle.broadcasting())
            .await
            .unwrap_or_else(|_| panic!("{} never entered broadcasting", replica.id));
    }
}

fn log_zxids(dir: &Path) -> Vec<Zxid> {
    let mut log = Log::open(dir.join("log"), 1 << 20).unwrap();
    log.iterate(Zxid::NULL)
        .unwrap()
        .collect::<crier::Result<Vec<_>>>()
        .unwrap()
        .into_iter()
        .map(|txn| txn.zxid)
        .collect()
}

/// Seed a log directory with entries and epochs, as a crashed replica
/// would have left it.
fn prepare_dir(dir: &Path, entries: &[(u32, u64)], proposed: u32, acked: u32) {
    let mut persistence = Persistence::open(dir, 1 << 20).unwrap();
    persistence.set_proposed_epoch(proposed).unwrap();
    persistence.set_ack_epoch(acked).unwrap();
    for &(epoch, counter) in entries {
        let txn = Transaction::new(
            Zxid::new(epoch, counter),
            0,
            Bytes::from(format!("txn-{epoch}-{counter}")),
        );
        persistence.log().append(&txn).unwrap();
    }
    persistence.log().sync().unwrap();
}

const TIMEOUT: Duration = Duration::from_millis(1_000);

#[tokio::test]
async fn three_node_happy_path() {
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s1".to_string()));

    let mut replicas: Vec<Replica> = members
        .iter()
        .map(|id| {
            start_replica(
                &hub,
                id,
                &members,
                TempDir::new().unwrap(),
                oracle.clone(),
                TIMEOUT,
            )
        })
        .collect();

    {
        let mut refs: Vec<&mut Replica> = replicas.iter_mut().collect();
        all_broadcasting(&mut refs).await;
    }
    assert!(replicas[0].handle.status().is_leader);

    replicas[0].handle.send(Bytes::from_static(b"x")).await;

    for replica in &replicas {
        let recorded = replica.recorded.clone();
        eventually("all replicas deliver x", move || {
            recorded.bodies() == vec![Bytes::from_static(b"x")]
        })
        .await;
        assert_eq!(replica.recorded.zxids(), vec![Zxid::new(1, 1)]);
    }

    // Every log holds exactly [(1,1)], durably.
    for replica in replicas {
        let (dir, result) = replica.stop().await;
        result.unwrap();
        assert_eq!(log_zxids(dir.path()), vec![Zxid::new(1, 1)]);
    }
}

#[tokio::test]
async fn follower_crash_diff_catchup() {
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s1".to_string()));

    let mut s1 = start_replica(&hub, "s1", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);
    let mut s2 = start_replica(&hub, "s2", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);
    let mut s3 = start_replica(&hub, "s3", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);

    all_broadcasting(&mut [&mut s1, &mut s2, &mut s3]).await;
    s1.handle.send(Bytes::from_static(b"x")).await;
    for replica in [&s1, &s2, &s3] {
        let recorded = replica.recorded.clone();
        eventually("x delivered", move || recorded.zxids() == vec![Zxid::new(1, 1)]).await;
    }

    // Kill s3, keep committing on the surviving majority.
    let (s3_dir, _) = s3.stop().await;
    hub.deregister(&"s3".to_string());

    s1.handle.send(Bytes::from_static(b"y")).await;
    for replica in [&s1, &s2] {
        let recorded = replica.recorded.clone();
        eventually("y delivered on the majority", move || {
            recorded.zxids() == vec![Zxid::new(1, 1), Zxid::new(1, 2)]
        })
        .await;
    }

    // Restart s3: it rediscovers, receives a diff, and catches up.
    let mut s3 = start_replica(&hub, "s3", &members, s3_dir, oracle.clone(), TIMEOUT);
    all_broadcasting(&mut [&mut s3]).await;

    let recorded = s3.recorded.clone();
    eventually("s3 catches up through y", move || {
        recorded.zxids() == vec![Zxid::new(1, 1), Zxid::new(1, 2)]
    })
    .await;
    assert_eq!(
        s3.recorded.bodies(),
        vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]
    );

    for replica in [s1, s2, s3] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn leader_crash_partial_proposal_is_adopted() {
    // The previous leader s1 crashed after shipping (1,3) to s2 alone.
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s2".to_string()));

    let s2_dir = TempDir::new().unwrap();
    let s3_dir = TempDir::new().unwrap();
    prepare_dir(s2_dir.path(), &[(1, 1), (1, 2), (1, 3)], 1, 1);
    prepare_dir(s3_dir.path(), &[(1, 1), (1, 2)], 1, 1);

    let mut s2 = start_replica(&hub, "s2", &members, s2_dir, oracle.clone(), TIMEOUT);
    let mut s3 = start_replica(&hub, "s3", &members, s3_dir, oracle.clone(), TIMEOUT);

    all_broadcasting(&mut [&mut s2, &mut s3]).await;

    // s2's richer history wins: (1,3) is adopted into the new epoch's
    // initial history and both survivors deliver the same prefix.
    let expect = vec![Zxid::new(1, 1), Zxid::new(1, 2), Zxid::new(1, 3)];
    for replica in [&s2, &s3] {
        let recorded = replica.recorded.clone();
        let expect = expect.clone();
        eventually("survivors agree on the prefix", move || recorded.zxids() == expect).await;
    }

    // The new epoch is past the crashed leader's.
    s2.handle.send(Bytes::from_static(b"z")).await;
    let recorded = s2.recorded.clone();
    eventually("the new epoch broadcasts", move || {
        recorded.zxids().last() == Some(&Zxid::new(2, 1))
    })
    .await;

    for replica in [s2, s3] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn divergent_suffix_is_truncated_and_never_delivered() {
    // s1 led epoch 3 and wrote (3,2) to nobody else before a partition;
    // s2 and s3 moved on at epoch 4 and committed (4,1).
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s2".to_string()));

    let s1_dir = TempDir::new().unwrap();
    let s2_dir = TempDir::new().unwrap();
    let s3_dir = TempDir::new().unwrap();
    prepare_dir(s1_dir.path(), &[(3, 1), (3, 2)], 3, 3);
    prepare_dir(s2_dir.path(), &[(3, 1), (4, 1)], 4, 4);
    prepare_dir(s3_dir.path(), &[(3, 1), (4, 1)], 4, 4);

    let mut s1 = start_replica(&hub, "s1", &members, s1_dir, oracle.clone(), TIMEOUT);
    let mut s2 = start_replica(&hub, "s2", &members, s2_dir, oracle.clone(), TIMEOUT);
    let mut s3 = start_replica(&hub, "s3", &members, s3_dir, oracle.clone(), TIMEOUT);

    all_broadcasting(&mut [&mut s1, &mut s2, &mut s3]).await;

    let expect = vec![Zxid::new(3, 1), Zxid::new(4, 1)];
    for replica in [&s1, &s2, &s3] {
        let recorded = replica.recorded.clone();
        let expect = expect.clone();
        eventually("all replicas agree", move || recorded.zxids() == expect).await;
    }
    // The divergent (3,2) was delivered by no replica.
    for replica in [&s1, &s2, &s3] {
        assert!(!replica.recorded.zxids().contains(&Zxid::new(3, 2)));
    }

    // s1's log now matches the authoritative history.
    let (s1_dir, result) = s1.stop().await;
    result.unwrap();
    assert_eq!(log_zxids(s1_dir.path()), expect);

    for replica in [s2, s3] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn stale_epoch_peer_adopts_the_bumped_epoch() {
    // s3 rejoins with an ancient promised epoch; discovery bumps everyone
    // past the cluster's highest.
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s1".to_string()));

    let s1_dir = TempDir::new().unwrap();
    let s2_dir = TempDir::new().unwrap();
    let s3_dir = TempDir::new().unwrap();
    prepare_dir(s1_dir.path(), &[], 5, 5);
    prepare_dir(s2_dir.path(), &[], 5, 5);
    prepare_dir(s3_dir.path(), &[], 1, 1);

    let mut s1 = start_replica(&hub, "s1", &members, s1_dir, oracle.clone(), TIMEOUT);
    let mut s2 = start_replica(&hub, "s2", &members, s2_dir, oracle.clone(), TIMEOUT);
    let mut s3 = start_replica(&hub, "s3", &members, s3_dir, oracle.clone(), TIMEOUT);

    all_broadcasting(&mut [&mut s1, &mut s2, &mut s3]).await;

    s1.handle.send(Bytes::from_static(b"z")).await;
    for replica in [&s1, &s2, &s3] {
        let recorded = replica.recorded.clone();
        eventually("post-bump broadcast reaches everyone", move || {
            recorded.zxids() == vec![Zxid::new(6, 1)]
        })
        .await;
    }

    for replica in [s1, s2, s3] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn heartbeat_timeout_unwinds_to_election() {
    let hub = Hub::new();
    let members = ["s1", "s2", "s3"];
    let timeout = Duration::from_millis(400);
    // One scripted round each: after the leader freeze, every replica
    // parks in election.
    let oracles: Vec<Arc<dyn ElectionOracle>> = members
        .iter()
        .map(|_| {
            Arc::new(crier::oracle::Scripted::new(["s1".to_string()])) as Arc<dyn ElectionOracle>
        })
        .collect();

    let mut s1 = start_replica(&hub, "s1", &members, TempDir::new().unwrap(), oracles[0].clone(), timeout);
    let mut s2 = start_replica(&hub, "s2", &members, TempDir::new().unwrap(), oracles[1].clone(), timeout);
    let mut s3 = start_replica(&hub, "s3", &members, TempDir::new().unwrap(), oracles[2].clone(), timeout);

    all_broadcasting(&mut [&mut s1, &mut s2, &mut s3]).await;

    // Freeze the leader: nobody hears from it, it hears from nobody.
    hub.partition(&"s1".to_string(), &"s2".to_string());
    hub.partition(&"s1".to_string(), &"s3".to_string());

    for replica in [&s1, &s2, &s3] {
        let handle = replica.handle.clone();
        eventually("replica re-enters election", move || {
            handle.status().phase == Phase::Electing
        })
        .await;
    }

    for replica in [s1, s2, s3] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn uninitialized_server_joins_a_live_cluster() {
    let hub = Hub::new();
    let members = ["s1", "s2"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s1".to_string()));

    let mut s1 = start_replica(&hub, "s1", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);
    let mut s2 = start_replica(&hub, "s2", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);
    all_broadcasting(&mut [&mut s1, &mut s2]).await;

    s1.handle.send(Bytes::from_static(b"before")).await;
    let recorded = s1.recorded.clone();
    eventually("pre-join commit lands", move || recorded.zxids().len() == 1).await;

    // s3 starts with no peers at all and joins through s1.
    let recorded3 = Recorded::default();
    let dir3 = TempDir::new().unwrap();
    let config = config_for("s3", &[], dir3.path(), TIMEOUT);
    let (queue_tx, queue_rx) = queue::bounded(config.queue_depth);
    hub.register("s3".to_string(), queue_tx.clone());
    let (participant, mut handle3) = Participant::new(
        config,
        Arc::new(hub.endpoint("s3".to_string())),
        queue_tx,
        queue_rx,
        oracle.clone(),
        Recorder::new(recorded3.clone()),
    )
    .unwrap();
    let task3 = tokio::spawn(participant.join("s1".to_string()));

    tokio::time::timeout(Duration::from_secs(10), handle3.broadcasting())
        .await
        .expect("s3 never entered broadcasting");

    // The joiner replayed the committed history...
    let catchup = recorded3.clone();
    eventually("join replays history", move || {
        catchup.bodies() == vec![Bytes::from_static(b"before")]
    })
    .await;

    // ...and participates in new commits.
    s1.handle.send(Bytes::from_static(b"after")).await;
    let live = recorded3.clone();
    eventually("joiner receives live traffic", move || {
        live.bodies().last() == Some(&Bytes::from_static(b"after"))
    })
    .await;

    handle3.shutdown();
    task3.await.unwrap().unwrap();
    for replica in [s1, s2] {
        replica.stop().await.1.unwrap();
    }
}

#[tokio::test]
async fn trimmed_log_syncs_an_empty_peer_by_snapshot() {
    let hub = Hub::new();
    let members = ["s1", "s2"];
    let oracle: Arc<dyn ElectionOracle> = Arc::new(FixedLeader("s1".to_string()));

    // s1 has delivered through (1,4), retired everything below (1,3), and
    // its application recovered its own snapshot of that state.
    let s1_dir = TempDir::new().unwrap();
    {
        let mut persistence = Persistence::open(s1_dir.path(), 1).unwrap();
        persistence.set_proposed_epoch(1).unwrap();
        persistence.set_ack_epoch(1).unwrap();
        for counter in 1..=4 {
            let txn = Transaction::new(
                Zxid::new(1, counter),
                0,
                Bytes::from(format!("txn-{counter}")),
            );
            persistence.log().append(&txn).unwrap();
        }
        persistence.log().sync().unwrap();
        persistence.log().trim(Zxid::new(1, 3)).unwrap();
    }

    let snapshot = Bytes::from_static(b"state-through-1.4");
    let mut s1 = start_replica_with(
        &hub,
        "s1",
        &members,
        s1_dir,
        oracle.clone(),
        TIMEOUT,
        |recorded| Recorder::recovered_at(recorded, Zxid::new(1, 4), snapshot.clone()),
    );
    let mut s2 = start_replica(&hub, "s2", &members, TempDir::new().unwrap(), oracle.clone(), TIMEOUT);

    all_broadcasting(&mut [&mut s1, &mut s2]).await;

    // s2 could not be served a diff; it received the snapshot.
    let restored = s2.recorded.clone();
    eventually("snapshot restored on the empty peer", move || {
        restored.restored.lock().unwrap().as_deref() == Some(b"state-through-1.4".as_ref())
    })
    .await;

    // And the watermark holds: new traffic lands after (1,4), with no
    // re-delivery of snapshotted history.
    s1.handle.send(Bytes::from_static(b"fresh")).await;
    let live = s2.recorded.clone();
    eventually("post-snapshot broadcast flows", move || {
        live.zxids() == vec![Zxid::new(2, 1)]
    })
    .await;

    for replica in [s1, s2] {
        replica.stop().await.1.unwrap();
    }
}
