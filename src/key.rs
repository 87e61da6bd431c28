//! Key material: secret keys, x-only public keys, and signing key pairs.
//!
//! Keys parse from raw hex or from NIP-19 bech32 entities (`npub...` /
//! `nsec...`). Equality is by byte value.

use std::fmt;

use bech32::{Bech32, Hrp};
use secp256k1::{Keypair, Secp256k1, XOnlyPublicKey};

use crate::error::{Error, Result};

const HRP_PUBLIC_KEY: &str = "npub";
const HRP_SECRET_KEY: &str = "nsec";

/// X-only public key identifying an event author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(XOnlyPublicKey);

impl PublicKey {
    /// Parse from hex or an `npub` bech32 string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(HRP_PUBLIC_KEY) {
            Self::from_slice(&decode_bech32(HRP_PUBLIC_KEY, s)?)
        } else {
            Self::from_hex(s)
        }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_slice(&hex::decode(s)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(XOnlyPublicKey::from_slice(bytes)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.serialize())
    }

    pub fn to_bech32(&self) -> Result<String> {
        encode_bech32(HRP_PUBLIC_KEY, &self.0.serialize())
    }

    pub(crate) fn xonly(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Secret key for signing and key agreement.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(secp256k1::SecretKey);

impl SecretKey {
    /// Parse from hex or an `nsec` bech32 string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(HRP_SECRET_KEY) {
            Self::from_slice(&decode_bech32(HRP_SECRET_KEY, s)?)
        } else {
            Self::from_hex(s)
        }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_slice(&hex::decode(s)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(secp256k1::SecretKey::from_slice(bytes)?))
    }

    pub fn generate() -> Self {
        Self(secp256k1::SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn to_secret_hex(&self) -> String {
        hex::encode(self.0.secret_bytes())
    }

    pub fn to_bech32(&self) -> Result<String> {
        encode_bech32(HRP_SECRET_KEY, &self.0.secret_bytes())
    }

    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        write!(f, "SecretKey(..)")
    }
}

/// Secret/public key pair used for signing and unwrapping.
#[derive(Clone)]
pub struct Keys {
    secret_key: SecretKey,
    public_key: PublicKey,
    keypair: Keypair,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key.0);
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            secret_key,
            public_key: PublicKey(xonly),
            keypair,
        }
    }

    /// Fresh random keys.
    pub fn generate() -> Self {
        Self::new(SecretKey::generate())
    }

    /// Parse from a hex or `nsec` secret key string.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self::new(SecretKey::parse(s)?))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn encode_bech32(hrp: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| Error::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Error::Bech32(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, s: &str) -> Result<Vec<u8>> {
    let (hrp, data) = bech32::decode(s).map_err(|e| Error::Bech32(e.to_string()))?;
    if hrp.as_str() != expected_hrp {
        return Err(Error::Bech32(format!(
            "expected `{expected_hrp}` prefix, got `{}`",
            hrp.as_str()
        )));
    }
    Ok(data)
}
