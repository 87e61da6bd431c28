//! NIP-44 v2 payload encryption.
//!
//! ChaCha20-Poly1305 with HKDF key derivation and an outer HMAC-SHA256 over
//! the versioned payload. The conversation key comes from an x-only ECDH
//! between one party's secret key and the other's public key, so either side
//! derives the same key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{Parity, Scalar, Secp256k1};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const HKDF_SALT: &[u8] = b"nip44-v2";
// version(1) + nonce(32) + padded ciphertext(>= 32 + 2 + 16) + hmac(32)
const MIN_PAYLOAD_LEN: usize = 115;
// The length prefix is two bytes; anything outside these bounds cannot
// survive the round trip.
const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric keys for one message, expanded from the conversation key and
/// the per-message nonce.
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

/// Derive the shared conversation key for a (secret, public) pair.
///
/// ECDH on the x coordinate only. The point `k*P` and `(-k)*P` share an x
/// coordinate, so lifting the x-only public key to its even-parity point
/// gives both parties the same result.
pub(crate) fn conversation_key(secret: &SecretKey, public: &PublicKey) -> Result<[u8; 32]> {
    let secp = Secp256k1::new();
    let scalar = Scalar::from_be_bytes(secret.secret_bytes())
        .map_err(|_| Error::Decryption("secret key out of range".into()))?;
    let point = secp256k1::PublicKey::from_x_only_public_key(*public.xonly(), Parity::Even);
    let shared = point
        .mul_tweak(&secp, &scalar)
        .map_err(|e| Error::Decryption(format!("ecdh failed: {e}")))?;
    let mut shared_x = [0u8; 32];
    shared_x.copy_from_slice(&shared.serialize()[1..33]);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(HKDF_SALT), &shared_x);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

fn message_keys(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|_| Error::Decryption("bad conversation key".into()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|_| Error::Decryption("hkdf expand failed".into()))?;
    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    Ok(keys)
}

fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = (unpadded_len as u32).next_power_of_two();
    let chunk = (next_power / 8).max(32) as usize;
    unpadded_len.div_ceil(chunk) * chunk
}

fn pad_plaintext(plaintext: &[u8]) -> Result<Vec<u8>> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(Error::Decryption(format!(
            "plaintext length {len} outside 1..=65535"
        )));
    }
    let padded_len = calc_padded_len(len);
    // 2-byte big-endian length prefix, zero padding to the bucket size.
    let mut result = Vec::with_capacity(2 + padded_len);
    result.push((len >> 8) as u8);
    result.push(len as u8);
    result.extend_from_slice(plaintext);
    result.resize(2 + padded_len, 0);
    Ok(result)
}

fn unpad_plaintext(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        return Err(Error::Decryption("padded plaintext too short".into()));
    }
    let len = ((padded[0] as usize) << 8) | (padded[1] as usize);
    if len < MIN_PLAINTEXT_LEN || len > padded.len() - 2 {
        return Err(Error::Decryption("invalid padding length".into()));
    }
    Ok(padded[2..2 + len].to_vec())
}

fn hmac_tag(hmac_key: &[u8; 32], nonce: &[u8; 32], ciphertext: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key)
        .map_err(|_| Error::Decryption("bad hmac key".into()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

/// Encrypt `plaintext` under the conversation key, returning the
/// base64-encoded versioned payload.
pub(crate) fn encrypt(plaintext: &[u8], conversation_key: &[u8; 32]) -> Result<String> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, conversation_key, &nonce)
}

fn encrypt_with_nonce(
    plaintext: &[u8],
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
) -> Result<String> {
    let padded = pad_plaintext(plaintext)?;
    let keys = message_keys(conversation_key, nonce)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&keys.chacha_key)
        .map_err(|_| Error::Decryption("bad cipher key".into()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&keys.chacha_nonce), padded.as_ref())
        .map_err(|_| Error::Decryption("encryption failed".into()))?;
    let tag = hmac_tag(&keys.hmac_key, nonce, &ciphertext)?;

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64-encoded payload with the conversation key.
pub(crate) fn decrypt(payload_b64: &str, conversation_key: &[u8; 32]) -> Result<Vec<u8>> {
    let payload = BASE64
        .decode(payload_b64)
        .map_err(|_| Error::Decryption("payload is not valid base64".into()))?;
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(Error::Decryption("payload too short".into()));
    }
    if payload[0] != VERSION {
        return Err(Error::Decryption(format!(
            "unsupported payload version {}",
            payload[0]
        )));
    }
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&payload[1..33]);
    let ciphertext = &payload[33..payload.len() - 32];
    let expected_tag = &payload[payload.len() - 32..];

    let keys = message_keys(conversation_key, &nonce)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.hmac_key)
        .map_err(|_| Error::Decryption("bad hmac key".into()))?;
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(expected_tag)
        .map_err(|_| Error::Decryption("payload authentication failed".into()))?;

    let cipher = ChaCha20Poly1305::new_from_slice(&keys.chacha_key)
        .map_err(|_| Error::Decryption("bad cipher key".into()))?;
    let padded = cipher
        .decrypt(Nonce::from_slice(&keys.chacha_nonce), ciphertext)
        .map_err(|_| Error::Decryption("decryption failed".into()))?;
    unpad_plaintext(&padded)
}
