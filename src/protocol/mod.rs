//! Tor protocol implementation
//!
//! This module implements the client side of onion routing:
//! - Cell protocol (fixed cells, relay cells)
//! - TAP handshake and per-hop key derivation
//! - Circuit building and onion layering
//! - Stream management and name resolution
//! - SENDME flow control

mod cell;
mod circuit;
mod crypto;
mod flow_control;
mod hop;
mod relay;
mod stream;

#[cfg(test)]
pub(crate) mod test_keys;

pub use cell::{
    decode_cell, encode_cell, peek_circuit_id, Cell, CellCommand, FixedCell, RelayCell,
    RelayCommand, RelayDecrypt, CELL_SIZE, DIGEST_RANGE, PAYLOAD_SIZE, RECOGNIZED_RANGE,
    RELAY_HEADER_SIZE,
};
pub use circuit::{Circuit, CircuitStatus};
pub use crypto::{hybrid_decrypt, hybrid_encrypt, AesCounterMode, OAEP_OVERHEAD, SYMMETRIC_KEY_LEN};
pub use flow_control::{FlowWindow, WindowAction};
pub use hop::{
    create_onion_skin, kdf_tap, DhKeyPair, HopCrypto, HopKeys, DH_LEN, KDF_LEN, KEY_HANDLE_LEN,
    ONION_SKIN_LEN, REPLY_LEN,
};
pub use relay::{ServerDescriptor, FINGERPRINT_LEN};
pub use stream::{parse_resolved, ResolvedAnswer, TorStream, END_REASON_DONE};
