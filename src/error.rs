//! Error types for the module bridge, one enum per fallible subsystem.
//!
//! Each subsystem gets its own small `thiserror`-derived enum rather than
//! one crate-wide catch-all. Callers that cross a subsystem boundary wrap
//! the inner error with `#[from]`.

use thiserror::Error;

/// Errors from the wire codec (`crate::wire`).
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame's version byte did not match a version this codec understands.
    #[error("unsupported control version: {0}")]
    UnsupportedVersion(u8),
    /// The frame's type byte did not match any known `ControlFrame` variant.
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    /// The buffer ended before a fixed-size field could be read.
    #[error("truncated frame: needed at least {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    /// A length-prefixed field claimed a length exceeding the remaining buffer.
    #[error("length prefix {declared} exceeds remaining {remaining} bytes")]
    LengthOverflow { declared: usize, remaining: usize },
}

/// Errors from the transport layer (`crate::transport`).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening or connecting the underlying socket failed.
    #[error("failed to open transport for endpoint {endpoint}: {source}")]
    Open {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    /// A send or receive failed for a reason other than would-block/timeout.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A non-blocking operation had no data/buffer space available.
    #[error("operation would block")]
    WouldBlock,
    /// A blocking receive exceeded its configured timeout.
    #[error("operation timed out")]
    TimedOut,
}

/// Errors from `ProxyHandle::create`.
#[derive(Debug, Error)]
pub enum ProxyCreateError {
    /// The broker reference passed to `create` was absent.
    #[error("broker reference is required")]
    MissingBroker,
    /// The configuration passed to `create` was absent.
    #[error("configuration is required")]
    MissingConfig,
    /// Opening the message or control transport failed.
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    /// The async-creator thread could not be spawned.
    #[error("failed to spawn creator thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The create handshake with the remote host failed or timed out
    /// (sync mode only — async mode never returns this).
    #[error("create handshake failed")]
    HandshakeFailed,
}

/// Errors from `HostHandle::attach`.
#[derive(Debug, Error)]
pub enum HostAttachError {
    /// The supplied module vtable is missing a required callback.
    #[error("module vtable must implement at least create, receive and destroy")]
    IncompleteVtable,
    /// The connection id was empty or exceeded the implementation bound.
    #[error("connection id must be non-empty and at most {max} bytes")]
    InvalidConnectionId { max: usize },
    /// Opening the control transport in the reply role failed.
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}
