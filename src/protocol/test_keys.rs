//! Shared key material for unit tests

use crate::protocol::relay::ServerDescriptor;
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// One 1024-bit onion key, generated once per test binary
pub(crate) fn onion_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate onion key")
    })
}

/// Descriptor for a relay holding [`onion_private_key`]
pub(crate) fn test_descriptor(nickname: &str) -> ServerDescriptor {
    let mut fingerprint = [0u8; 20];
    fingerprint.copy_from_slice(&Sha1::digest(nickname.as_bytes()));
    ServerDescriptor::new(
        nickname,
        Ipv4Addr::new(10, 0, 0, 1),
        9001,
        onion_private_key().to_public_key(),
        fingerprint,
    )
}
