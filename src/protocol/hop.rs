//! Per-hop cryptographic state
//!
//! Each hop of a circuit is set up with the TAP onion-skin handshake:
//!
//! ```text
//! client -> hop:  hybrid(onion_key, sym_key || g^x)          186 bytes
//! hop -> client:  g^y || KH                                  148 bytes
//! K = SHA1(g^xy || 0) || SHA1(g^xy || 1) || ... || SHA1(g^xy || 4)
//! KH = K[0..20]  Df = K[20..40]  Db = K[40..60]  Kf = K[60..76]  Kb = K[76..92]
//! ```
//!
//! After the handshake the hop owns two independent AES-CTR keystreams and
//! two running SHA-1 digests. Every payload pushed through advances that
//! state, so cells must be processed exactly once and in wire order.

use crate::error::{Result, TorError};
use crate::protocol::crypto::{hybrid_encrypt, AesCounterMode, SYMMETRIC_KEY_LEN};
use crate::protocol::relay::ServerDescriptor;
use rand::{CryptoRng, RngCore};
use rsa::BigUint;
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::OnceLock;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a DH public value or shared secret
pub const DH_LEN: usize = 128;

/// Length of the key handle proving the peer derived the same secret
pub const KEY_HANDLE_LEN: usize = 20;

/// Bytes of key material derived from the shared secret
pub const KDF_LEN: usize = 100;

/// CREATE / EXTEND onion skin length for a 1024-bit onion key
pub const ONION_SKIN_LEN: usize = 186;

/// CREATED / EXTENDED reply length: g^y || KH
pub const REPLY_LEN: usize = DH_LEN + KEY_HANDLE_LEN;

/// Oakley group 2 (RFC 2409), generator 2
const DH_PRIME: [u8; DH_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

fn dh_prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| BigUint::from_bytes_be(&DH_PRIME))
}

fn dh_generator() -> BigUint {
    BigUint::from_bytes_be(&[2])
}

/// Left-pad a big-endian integer to `DH_LEN` bytes
fn to_fixed_be(value: &BigUint) -> [u8; DH_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_LEN];
    let start = DH_LEN.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(DH_LEN)..]);
    out
}

/// An ephemeral Diffie-Hellman key pair over the 1024-bit Oakley group
pub struct DhKeyPair {
    private: Zeroizing<[u8; DH_LEN]>,
    public: [u8; DH_LEN],
}

impl DhKeyPair {
    /// Draw a 1023-bit private exponent and compute g^x
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private = Zeroizing::new([0u8; DH_LEN]);
        rng.fill_bytes(&mut private[..]);
        private[0] &= 0x7f;
        private[DH_LEN - 1] |= 0x01;

        let x = BigUint::from_bytes_be(&private[..]);
        let public = to_fixed_be(&dh_generator().modpow(&x, dh_prime()));
        Self { private, public }
    }

    /// g^x as 128 big-endian bytes
    pub fn public_bytes(&self) -> &[u8; DH_LEN] {
        &self.public
    }

    /// Compute (g^y)^x, rejecting degenerate peer values
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; DH_LEN]>> {
        if peer_public.len() != DH_LEN {
            return Err(TorError::Crypto(format!(
                "DH public value must be {} bytes, got {}",
                DH_LEN,
                peer_public.len()
            )));
        }

        let p = dh_prime();
        let y = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from_bytes_be(&[1]);
        if y <= one || y >= p - &one {
            return Err(TorError::Crypto("Degenerate DH public value".into()));
        }

        let x = BigUint::from_bytes_be(&self.private[..]);
        Ok(Zeroizing::new(to_fixed_be(&y.modpow(&x, p))))
    }
}

/// Expand a shared secret: K = SHA1(s || 0) || ... || SHA1(s || 4)
pub fn kdf_tap(secret: &[u8]) -> Zeroizing<[u8; KDF_LEN]> {
    let mut out = Zeroizing::new([0u8; KDF_LEN]);
    for (i, chunk) in out.chunks_mut(20).enumerate() {
        let block = Sha1::new()
            .chain_update(secret)
            .chain_update([i as u8])
            .finalize();
        chunk.copy_from_slice(&block[..chunk.len()]);
    }
    out
}

/// Key material for one hop, split out of the KDF output
///
/// SECURITY: zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Proof that both sides computed the same secret
    pub key_handle: [u8; KEY_HANDLE_LEN],
    /// Forward digest seed
    pub forward_digest: [u8; 20],
    /// Backward digest seed
    pub backward_digest: [u8; 20],
    /// Forward AES key
    pub forward_key: [u8; SYMMETRIC_KEY_LEN],
    /// Backward AES key
    pub backward_key: [u8; SYMMETRIC_KEY_LEN],
}

impl HopKeys {
    pub fn from_kdf(k: &[u8; KDF_LEN]) -> Self {
        let mut keys = Self {
            key_handle: [0; KEY_HANDLE_LEN],
            forward_digest: [0; 20],
            backward_digest: [0; 20],
            forward_key: [0; SYMMETRIC_KEY_LEN],
            backward_key: [0; SYMMETRIC_KEY_LEN],
        };
        keys.key_handle.copy_from_slice(&k[0..20]);
        keys.forward_digest.copy_from_slice(&k[20..40]);
        keys.backward_digest.copy_from_slice(&k[40..60]);
        keys.forward_key.copy_from_slice(&k[60..76]);
        keys.backward_key.copy_from_slice(&k[76..92]);
        keys
    }
}

/// Build the onion skin for `server`: returns the ephemeral key pair to
/// finish the handshake with, and the 186-byte CREATE / EXTEND payload.
pub fn create_onion_skin<R: RngCore + CryptoRng>(
    rng: &mut R,
    server: &ServerDescriptor,
) -> Result<(DhKeyPair, Vec<u8>)> {
    let dh = DhKeyPair::generate(rng);
    let mut sym_key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    rng.fill_bytes(&mut sym_key[..]);

    let skin = hybrid_encrypt(rng, &sym_key, dh.public_bytes(), &server.onion_key)?;
    if skin.len() != ONION_SKIN_LEN {
        log::warn!(
            "Onion skin for {} is {} bytes (onion key is not 1024-bit)",
            server.nickname,
            skin.len()
        );
    }
    Ok((dh, skin))
}

/// Cryptographic state of one established hop
pub struct HopCrypto {
    server: ServerDescriptor,
    forward_cipher: AesCounterMode,
    backward_cipher: AesCounterMode,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    /// Finish the handshake with `server` from its CREATED / EXTENDED reply
    pub fn new(server: ServerDescriptor, reply: &[u8], dh: &DhKeyPair) -> Result<Self> {
        if reply.len() < REPLY_LEN {
            return Err(TorError::ProtocolError(format!(
                "Handshake reply is {} bytes, need {}",
                reply.len(),
                REPLY_LEN
            )));
        }

        let secret = dh.shared_secret(&reply[..DH_LEN])?;
        let k = kdf_tap(&secret[..]);

        if !bool::from(k[..KEY_HANDLE_LEN].ct_eq(&reply[DH_LEN..REPLY_LEN])) {
            log::warn!("Key handle mismatch from {}", server.nickname);
            return Err(TorError::HandshakeVerificationFailed);
        }

        log::trace!("KH for {}: {:02x?}..", server.nickname, &k[..4]);
        Ok(Self::from_key_material(server, &k))
    }

    /// Initialise ciphers and digests from already agreed key material
    pub fn from_key_material(server: ServerDescriptor, k: &[u8; KDF_LEN]) -> Self {
        let keys = HopKeys::from_kdf(k);

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        Self {
            server,
            forward_cipher: AesCounterMode::new(true, &keys.forward_key),
            backward_cipher: AesCounterMode::new(true, &keys.backward_key),
            forward_digest,
            backward_digest,
        }
    }

    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    /// Add this hop's layer to an outbound payload
    pub fn encrypt_through_this_hop(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Remove this hop's layer from an inbound payload
    pub fn decrypt_through_this_hop(&mut self, payload: &mut [u8]) {
        self.backward_cipher.apply_keystream(payload);
    }

    /// Commit an outbound payload (digest field zeroed) to the running
    /// forward digest and return its first 4 bytes
    pub fn forward_digest(&mut self, payload: &[u8]) -> [u8; 4] {
        self.forward_digest.update(payload);
        truncated(&self.forward_digest)
    }

    /// Commit an inbound payload (digest field zeroed) to the running
    /// backward digest and return its first 4 bytes
    pub fn backward_digest(&mut self, payload: &[u8]) -> [u8; 4] {
        self.backward_digest.update(payload);
        truncated(&self.backward_digest)
    }

    /// Check an inbound payload against `expected`, committing it to the
    /// backward digest only when it matches
    pub fn check_backward_digest(&mut self, payload: &[u8], expected: &[u8; 4]) -> bool {
        let mut trial = self.backward_digest.clone();
        trial.update(payload);
        let matched = bool::from(truncated(&trial).ct_eq(expected));
        if matched {
            self.backward_digest = trial;
        }
        matched
    }
}

fn truncated(digest: &Sha1) -> [u8; 4] {
    let full = digest.clone().finalize();
    [full[0], full[1], full[2], full[3]]
}

impl fmt::Debug for HopCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopCrypto")
            .field("server", &self.server.nickname)
            .finish_non_exhaustive()
    }
}
