//! Routable relay descriptors
//!
//! The minimal view of a relay that circuit extension needs. Directory
//! fetching and path selection live outside this crate and hand these in.

use crate::error::{Result, TorError};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of a relay identity fingerprint (SHA-1 of the identity key)
pub const FINGERPRINT_LEN: usize = 20;

/// A relay usable as a circuit hop
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    /// Relay nickname
    pub nickname: String,

    /// IPv4 address of the OR port
    pub address: Ipv4Addr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Onion key the handshake is encrypted to
    pub onion_key: RsaPublicKey,

    /// Identity fingerprint
    pub fingerprint: [u8; FINGERPRINT_LEN],
}

impl ServerDescriptor {
    pub fn new(
        nickname: impl Into<String>,
        address: Ipv4Addr,
        or_port: u16,
        onion_key: RsaPublicKey,
        fingerprint: [u8; FINGERPRINT_LEN],
    ) -> Self {
        Self {
            nickname: nickname.into(),
            address,
            or_port,
            onion_key,
            fingerprint,
        }
    }

    /// Build a descriptor from the textual forms found in server descriptors:
    /// a PKCS#1 PEM onion key and a hex fingerprint (spaces allowed).
    pub fn from_descriptor_fields(
        nickname: &str,
        address: Ipv4Addr,
        or_port: u16,
        onion_key_pem: &str,
        fingerprint_hex: &str,
    ) -> Result<Self> {
        let onion_key = RsaPublicKey::from_pkcs1_pem(onion_key_pem.trim())
            .map_err(|e| TorError::Crypto(format!("Bad onion key for {}: {}", nickname, e)))?;

        let compact: String = fingerprint_hex
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let fingerprint: [u8; FINGERPRINT_LEN] = hex::decode(&compact)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                TorError::ProtocolError(format!(
                    "Bad fingerprint for {}: {}",
                    nickname, fingerprint_hex
                ))
            })?;

        Ok(Self::new(nickname, address, or_port, onion_key, fingerprint))
    }

    /// Get the socket address of the OR port
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.or_port)
    }

    /// Upper-case hex fingerprint
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.nickname, self.socket_addr())
    }
}
