//! Error types for the onion-routing client
//!
//! This module provides the error taxonomy shared by every layer:
//! - Framing errors from the cell codec (fatal for the link)
//! - Integrity errors from the per-hop crypto (fatal for the circuit)
//! - Timeouts and stream failures (absorbed into circuit ranking)
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Link errors (1xx)
    TransportFailed = 100,
    Timeout = 101,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    MalformedCell = 202,
    TruncatedRead = 203,

    // Circuit errors (3xx)
    CircuitClosed = 300,
    CircuitDestroyed = 301,
    NoFreeCircuitIds = 302,
    StreamFailed = 303,
    NoFreeStreamIds = 304,
    ResolveFailed = 305,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    HandshakeVerificationFailed = 501,
    RelayCellNotRecognized = 502,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Link Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for {operation} after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    // ===== Framing Errors =====
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Truncated read: got {got} of {expected} bytes")]
    TruncatedRead { got: usize, expected: usize },

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    // ===== Crypto Errors =====
    #[error("Handshake verification failed: key handle mismatch")]
    HandshakeVerificationFailed,

    #[error("Relay cell not recognized by any hop")]
    RelayCellNotRecognized,

    #[error("Crypto error: {0}")]
    Crypto(String),

    // ===== Circuit Errors =====
    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("No free circuit ids on this connection")]
    NoFreeCircuitIds,

    // ===== Stream Errors =====
    #[error("Stream build failed: {reason}")]
    StreamBuildFailed { reason: String },

    #[error("Stream ended by exit: reason={reason} ({reason_name})")]
    StreamEnded { reason: u8, reason_name: String },

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream reader fell behind: inbound queue of {capacity} cells overflowed")]
    StreamOverrun { capacity: usize },

    #[error("No free stream ids on this circuit")]
    NoFreeStreamIds,

    #[error("Resolve failed: {0}")]
    Resolve(String),

    // ===== State Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::Transport(_) => ErrorCode::TransportFailed,
            TorError::Timeout { .. } => ErrorCode::Timeout,

            TorError::MalformedCell(_) => ErrorCode::MalformedCell,
            TorError::TruncatedRead { .. } => ErrorCode::TruncatedRead,
            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,

            TorError::HandshakeVerificationFailed => ErrorCode::HandshakeVerificationFailed,
            TorError::RelayCellNotRecognized => ErrorCode::RelayCellNotRecognized,
            TorError::Crypto(_) => ErrorCode::CryptoError,

            TorError::CircuitClosed(_) => ErrorCode::CircuitClosed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::NoFreeCircuitIds => ErrorCode::NoFreeCircuitIds,

            TorError::StreamBuildFailed { .. }
            | TorError::StreamEnded { .. }
            | TorError::StreamClosed
            | TorError::StreamOverrun { .. } => ErrorCode::StreamFailed,
            TorError::NoFreeStreamIds => ErrorCode::NoFreeStreamIds,
            TorError::Resolve(_) => ErrorCode::ResolveFailed,

            TorError::InvalidState(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the operation may succeed on another circuit or a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::Timeout { .. }
                | TorError::Transport(_)
                | TorError::CircuitClosed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::StreamBuildFailed { .. }
                | TorError::NoFreeStreamIds
        )
    }

    /// Whether the error means the cryptographic state of a circuit or link
    /// can no longer be trusted
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            TorError::HandshakeVerificationFailed
                | TorError::RelayCellNotRecognized
                | TorError::MalformedCell(_)
                | TorError::TruncatedRead { .. }
        )
    }

    pub fn timeout(operation: &'static str, elapsed: Duration) -> Self {
        TorError::Timeout { operation, elapsed }
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason,
            reason_name: destroy_reason_name(reason).to_string(),
        }
    }

    /// Create a StreamEnded error with the reason name
    pub fn stream_ended(reason: u8) -> Self {
        TorError::StreamEnded {
            reason,
            reason_name: end_reason_name(reason).to_string(),
        }
    }
}

/// Name of a DESTROY / TRUNCATED reason byte
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "OR_CONN_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

/// Name of a RELAY_END reason byte
pub fn end_reason_name(reason: u8) -> &'static str {
    match reason {
        1 => "MISC",
        2 => "RESOLVEFAILED",
        3 => "CONNECTREFUSED",
        4 => "EXITPOLICY",
        5 => "DESTROY",
        6 => "DONE",
        7 => "TIMEOUT",
        8 => "NOROUTE",
        9 => "HIBERNATING",
        10 => "INTERNAL",
        11 => "RESOURCELIMIT",
        12 => "CONNRESET",
        13 => "TORPROTOCOL",
        14 => "NOTDIRECTORY",
        _ => "UNKNOWN",
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        TorError::Transport(err.to_string())
    }
}

impl From<rsa::Error> for TorError {
    fn from(err: rsa::Error) -> Self {
        TorError::Crypto(err.to_string())
    }
}

impl From<TorError> for std::io::Error {
    fn from(err: TorError) -> Self {
        let kind = match &err {
            TorError::Timeout { .. } => std::io::ErrorKind::TimedOut,
            TorError::StreamClosed | TorError::CircuitClosed(_) => {
                std::io::ErrorKind::NotConnected
            }
            TorError::StreamEnded { .. } | TorError::CircuitDestroyed { .. } => {
                std::io::ErrorKind::ConnectionReset
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
