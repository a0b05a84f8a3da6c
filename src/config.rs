//! Cluster-wide configuration: membership, ports, timings and safety limits.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Fixed datagram port the leader answers discovery queries on.
pub const DISCOVERY_PORT: u16 = 37020;

/// Per-peer datagram port is `NODE_UDP_BASE + node_id`.
pub const NODE_UDP_BASE: u16 = 37100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Known membership set. Finite and closed; membership change is not
    /// supported at runtime.
    pub cluster: Vec<NodeId>,
    pub discovery_port: u16,
    pub node_udp_base: u16,
    /// All peers share one host: discovery targets include loopback.
    pub single_host: bool,
    pub wal_dir: PathBuf,
    pub timing: Timing,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: vec![NodeId::new(2), NodeId::new(3), NodeId::new(10)],
            discovery_port: DISCOVERY_PORT,
            node_udp_base: NODE_UDP_BASE,
            single_host: false,
            wal_dir: PathBuf::from("."),
            timing: Timing::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    pub fn node_udp_port(&self, node_id: NodeId) -> u16 {
        self.node_udp_base + node_id.get() as u16
    }
}

/// Protocol timings. Field names are explicit about their units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub discovery_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Copies of each heartbeat sent per interval to mask single-packet loss.
    pub heartbeat_redundancy: u32,
    pub leader_timeout_ms: u64,
    pub election_answer_timeout_ms: u64,
    pub coordinator_timeout_ms: u64,
    /// Minimum spacing between repeated catch-up requests for the same gap.
    pub resend_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_redundancy: 2,
            leader_timeout_ms: 3_500,
            election_answer_timeout_ms: 1_200,
            coordinator_timeout_ms: 3_000,
            resend_interval_ms: 500,
            tick_interval_ms: 250,
            connect_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_datagram_bytes: usize,
    /// Cap on the out-of-order buffer; once full, further records are refused
    /// and another catch-up request is issued instead.
    pub max_pending_records: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_datagram_bytes: 8 * 1024,
            max_pending_records: 1024,
        }
    }
}

/// Apply process-environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = get("ORDERCAST_SINGLE_HOST") {
        config.single_host =
            matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Some(dir) = get("ORDERCAST_WAL_DIR")
        && !dir.trim().is_empty()
    {
        config.wal_dir = PathBuf::from(dir);
    }
}
