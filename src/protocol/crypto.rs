//! Symmetric primitives for circuit communication
//!
//! - AES-128 in counter mode, zero initial counter, big-endian increment
//!   across the whole 16-byte block
//! - The hybrid RSA-OAEP + AES-CTR envelope carrying onion skins
//!
//! Security: plaintext envelope buffers are zeroized after use.

use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use rand::{CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroizing;

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// AES-128 key length
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// Bytes OAEP with SHA-1 adds to every RSA block
pub const OAEP_OVERHEAD: usize = 42;

/// AES-128 counter-mode keystream generator
///
/// Encryption and decryption are the same operation; `encrypt_mode` only
/// documents the caller's intent. The keystream is continuous across calls,
/// so processing `a` then `b` equals processing `a || b`.
pub struct AesCounterMode {
    cipher: Aes128Ctr,
}

impl AesCounterMode {
    /// Create a keystream starting at counter zero
    pub fn new(encrypt_mode: bool, key: &[u8; SYMMETRIC_KEY_LEN]) -> Self {
        if !encrypt_mode {
            log::warn!("AES counter mode created for decryption; keystream is identical to encryption");
        }
        let iv = [0u8; 16];
        Self {
            cipher: Aes128Ctr::new(key.into(), (&iv).into()),
        }
    }

    /// XOR `data` with the next bytes of keystream, in place
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    /// XOR `input` with the next bytes of keystream into a new buffer
    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        self.apply_keystream(&mut out);
        out
    }

    /// Next single keystream byte
    pub fn next_byte(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.apply_keystream(&mut b);
        b[0]
    }
}

/// Encrypt `sym_key || body` to `onion_key`.
///
/// The first `k - 42` bytes (k = modulus size) go into one RSA-OAEP block;
/// the remainder is AES-CTR encrypted under `sym_key`.
pub fn hybrid_encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    sym_key: &[u8; SYMMETRIC_KEY_LEN],
    body: &[u8],
    onion_key: &RsaPublicKey,
) -> Result<Vec<u8>> {
    let k = onion_key.size();
    let rsa_plain_len = k
        .checked_sub(OAEP_OVERHEAD)
        .ok_or_else(|| TorError::Crypto(format!("Onion key of {} bytes is too small", k)))?;

    let mut plain = Zeroizing::new(Vec::with_capacity(SYMMETRIC_KEY_LEN + body.len()));
    plain.extend_from_slice(sym_key);
    plain.extend_from_slice(body);

    if plain.len() < rsa_plain_len {
        return Err(TorError::Crypto(format!(
            "Hybrid body of {} bytes is below the {} byte minimum",
            body.len(),
            rsa_plain_len - SYMMETRIC_KEY_LEN
        )));
    }

    let mut out = onion_key.encrypt(rng, Oaep::new::<Sha1>(), &plain[..rsa_plain_len])?;
    let mut tail = plain[rsa_plain_len..].to_vec();
    AesCounterMode::new(true, sym_key).apply_keystream(&mut tail);
    out.extend_from_slice(&tail);
    Ok(out)
}

/// Decrypt a hybrid envelope, returning `(sym_key, body)`
pub fn hybrid_decrypt(
    blob: &[u8],
    private_key: &RsaPrivateKey,
) -> Result<([u8; SYMMETRIC_KEY_LEN], Vec<u8>)> {
    let k = private_key.size();
    if blob.len() < k {
        return Err(TorError::Crypto(format!(
            "Hybrid ciphertext of {} bytes is shorter than one {} byte RSA block",
            blob.len(),
            k
        )));
    }

    let head = Zeroizing::new(private_key.decrypt(Oaep::new::<Sha1>(), &blob[..k])?);
    if head.len() < k.saturating_sub(OAEP_OVERHEAD) || head.len() < SYMMETRIC_KEY_LEN {
        return Err(TorError::Crypto(format!(
            "Hybrid RSA block decrypted to only {} bytes",
            head.len()
        )));
    }

    let mut sym_key = [0u8; SYMMETRIC_KEY_LEN];
    sym_key.copy_from_slice(&head[..SYMMETRIC_KEY_LEN]);

    let mut body = head[SYMMETRIC_KEY_LEN..].to_vec();
    let mut tail = blob[k..].to_vec();
    AesCounterMode::new(false, &sym_key).apply_keystream(&mut tail);
    body.extend_from_slice(&tail);
    Ok((sym_key, body))
}
