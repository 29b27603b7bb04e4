//! Error types for the stream bridge

use thiserror::Error;

use crate::registry::StreamId;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Ring buffer creation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("Ring buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("Ring buffer allocation of {0} bytes failed")]
    Allocation(usize),
}

/// Audio backend errors, reported synchronously from open/start/pause
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Failed to start stream: {0}")]
    StreamStart(String),

    #[error("Stream control failed: {0}")]
    StreamControl(String),
}

/// Stream registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Stale stream id {0}")]
    Stale(StreamId),

    #[error("Stream {0} is not an input stream")]
    NotInput(StreamId),

    #[error("Stream {0} is not an output stream")]
    NotOutput(StreamId),
}

/// Failure of a single begin/end transaction on the realtime path.
///
/// Fatal to the stream: there is no time budget left to retry, so the
/// bridge reports a [`StreamFault`] and stops instead of propagating this
/// across the backend boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransactionError(pub String);

/// Fatal condition detected on the realtime thread.
///
/// Carried over the stream's bounded fault channel so the owning thread
/// can observe it and tear the stream down; never unwound through the
/// backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// The consumer fell too far behind: the mandatory minimum no longer
    /// fits in the ring buffer. Storing it would wrap over unread data.
    #[error("Ring buffer overflow: {needed} frames required, {free} free")]
    Overflow { needed: usize, free: usize },

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Backend stream error: {0}")]
    Backend(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
