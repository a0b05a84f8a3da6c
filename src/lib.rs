//! LAN-scoped totally-ordered broadcast for small clusters.
//!
//! Every peer delivers the same sequence of submitted payloads in the same
//! order, tolerating the crash of any single peer, including the one
//! currently acting as sequencer. Ordering comes from a single elected
//! leader (Bully election, epoch-tagged), durability from a per-peer
//! write-ahead log, and gap repair from follower-initiated catch-up.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ids;
pub mod net;
pub mod proto;
pub mod replica;
pub mod runtime;
pub mod stream;
pub mod telemetry;
pub mod wal;

pub use config::Config;
pub use error::Error;
pub use ids::{Epoch, NodeId, PayloadId, Seq};
pub use proto::OrderRecord;
pub use runtime::{PeerHandle, PeerOptions, RoleHint};
