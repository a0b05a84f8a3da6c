//! Crate-level convenience error.
//!
//! A thin wrapper over the per-module errors; nothing is flattened away.

use thiserror::Error;

use crate::bus::BusError;
use crate::proto::ProtoError;
use crate::runtime::RuntimeError;
use crate::stream::StreamError;
use crate::wal::WalError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
