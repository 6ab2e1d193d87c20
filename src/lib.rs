//! # Tor Onion Client
//!
//! The client side of Tor onion routing: fixed-size cells, the TAP
//! handshake, multi-hop circuits with per-hop layered encryption, streams
//! multiplexed over circuits, and SENDME flow control.
//!
//! ## Architecture
//!
//! ```text
//! TorStream (BEGIN / DATA / END)
//!   ↓
//! Circuit (hop list, onion layering, stream table)
//!   ↓
//! Connection (circuit-id table, cell reassembly)
//!   ↓
//! Transport (link to the entry relay, owned by the caller)
//! ```
//!
//! Directory fetching, path selection and the TLS link handshake are left
//! to the embedding application: it hands in [`ServerDescriptor`]s and a
//! [`Transport`], and feeds inbound bytes to [`Connection::deliver`] or
//! [`Connection::run_reader`].

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod scenario_tests;

pub use config::{CircuitConfig, ConnectionConfig};
pub use connection::Connection;
pub use error::{ErrorCode, Result, TorError};
pub use protocol::{
    Cell, CellCommand, Circuit, CircuitStatus, RelayCell, RelayCommand, ResolvedAnswer,
    ServerDescriptor, TorStream,
};
pub use transport::{AsyncWriteTransport, ChannelTransport, Transport};
