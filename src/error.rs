// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The eight-kind error taxonomy producers see from the public API.
//!
//! Everything else (reader/writer task failures, drain faults, keepalive
//! misses) is aggregated into the Muxer's background error log and only
//! surfaces here when it also causes a producer-facing call to fail.

use thiserror::Error;

/// Errors returned from the public Muxer/Connection/Cache/TagManager API.
#[derive(Debug, Error, Clone)]
pub enum MuxError {
    /// Invalid option value, missing required field, bad URL. Fatal at
    /// startup.
    #[error("config error: {0}")]
    Config(String),

    /// The indexer rejected the shared secret. Connection-fatal; the Muxer
    /// does not retry that Connection until reconfigured.
    #[error("auth error: {0}")]
    Auth(String),

    /// Dial failure, TLS handshake failure, I/O error, framing error,
    /// keepalive timeout. Recovered by reconnect with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad magic, bad length, unknown command id. Handled like
    /// `TransportError` (drop and reconnect) but logged loudly.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Disk I/O failure on Cache append. Surfaced to the `WriteEntry` caller
    /// only when caching is the only path; otherwise logged.
    #[error("cache error: {0}")]
    Cache(String),

    /// Entry exceeds `MaxEntrySize`. The Entry is dropped.
    #[error("entry of {size} bytes exceeds the {max}-byte limit")]
    Oversize { size: usize, max: usize },

    /// No Hot Connection, no Cache, timeout elapsed.
    #[error("no hot connection available")]
    NotHot,

    /// `WriteEntry` called after `Close`.
    #[error("muxer is closing")]
    Closing,
}

impl MuxError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// `ProtocolError` is classified the same way as `TransportError` for
    /// retry purposes (drop and reconnect) while remaining a distinct,
    /// loudly-logged variant.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
