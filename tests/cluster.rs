//! Loopback end-to-end tests: small clusters on 127.0.0.1.
//!
//! Each test uses its own port range so they can run in parallel.
//! Submissions are retried with a stable payload id; the sequencer's
//! dedup makes that idempotent, which is exactly how real clients
//! survive reconnects.

use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};
use tempfile::TempDir;

use ordercast::config::Config;
use ordercast::ids::{NodeId, PayloadId, Seq};
use ordercast::proto::OrderRecord;
use ordercast::runtime::{self, PeerHandle, PeerOptions, RoleHint};

const DEADLINE: Duration = Duration::from_secs(30);

fn test_config(wal_dir: &Path, udp_base: u16, discovery_port: u16) -> Config {
    Config {
        single_host: true,
        node_udp_base: udp_base,
        discovery_port,
        wal_dir: wal_dir.to_path_buf(),
        ..Config::default()
    }
}

fn start_peer(
    node_id: u32,
    role_hint: RoleHint,
    stream_port: u16,
    config: &Config,
) -> (PeerHandle, Receiver<OrderRecord>) {
    let (delivery_tx, delivery_rx) = unbounded();
    let peer = runtime::start(PeerOptions {
        node_id: NodeId::new(node_id),
        role_hint,
        stream_port,
        config: config.clone(),
        print_deliveries: false,
        delivery: Some(delivery_tx),
    })
    .expect("peer start");
    (peer, delivery_rx)
}

/// Re-submit `payload_id` until a record for it shows up on `deliveries`.
fn submit_until_delivered(
    submitter: &PeerHandle,
    payload_id: &PayloadId,
    body: &str,
    deliveries: &Receiver<OrderRecord>,
) -> OrderRecord {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        submitter.submit(payload_id.clone(), body);
        if let Ok(record) = deliveries.recv_timeout(Duration::from_millis(500)) {
            assert_eq!(&record.payload_id, payload_id);
            return record;
        }
    }
    panic!("no delivery for {payload_id} within {DEADLINE:?}");
}

fn recv_record(deliveries: &Receiver<OrderRecord>) -> OrderRecord {
    deliveries
        .recv_timeout(DEADLINE)
        .expect("delivery within the deadline")
}

#[test]
fn follower_submission_is_delivered_everywhere() {
    let wal_dir = TempDir::new().unwrap();
    let config = test_config(wal_dir.path(), 46_200, 46_020);

    let (leader, leader_rx) = start_peer(10, RoleHint::Leader, 46_501, &config);
    let (follower, follower_rx) = start_peer(2, RoleHint::Follower, 46_502, &config);

    let payload_id = PayloadId::mint();
    let on_follower = submit_until_delivered(&follower, &payload_id, "two espressos", &follower_rx);
    let on_leader = recv_record(&leader_rx);

    assert_eq!(on_leader.seq, Seq::FIRST);
    assert_eq!(on_follower.seq, Seq::FIRST);
    assert_eq!(on_leader.payload_id, payload_id);
    assert_eq!(on_leader.epoch, on_follower.epoch);
    assert_eq!(on_leader.body, "two espressos");

    follower.shutdown();
    leader.shutdown();
}

#[test]
fn late_follower_catches_up_from_history() {
    let wal_dir = TempDir::new().unwrap();
    let config = test_config(wal_dir.path(), 46_300, 46_021);

    let (leader, leader_rx) = start_peer(10, RoleHint::Leader, 46_511, &config);

    let first = PayloadId::mint();
    let second = PayloadId::mint();
    submit_until_delivered(&leader, &first, "one flat white", &leader_rx);
    submit_until_delivered(&leader, &second, "three croissants", &leader_rx);

    // A follower that saw none of that connects and catches up in order.
    let (follower, follower_rx) = start_peer(3, RoleHint::Follower, 46_512, &config);
    let caught_up_first = recv_record(&follower_rx);
    let caught_up_second = recv_record(&follower_rx);

    assert_eq!(caught_up_first.seq, Seq::new(1));
    assert_eq!(caught_up_first.payload_id, first);
    assert_eq!(caught_up_second.seq, Seq::new(2));
    assert_eq!(caught_up_second.payload_id, second);

    follower.shutdown();
    leader.shutdown();
}
