//! Error types shared across the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the client.
///
/// Transport failures are retried internally and only reach the caller once
/// the retry budget is exhausted. Per-event problems (validation, decryption)
/// never terminate a subscription or fetch.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure after internal retries were exhausted.
    #[error("connection: {0}")]
    Connection(String),
    /// Fetch deadline elapsed with no relay responding and nothing collected.
    #[error("fetch timed out with no responding relay")]
    Timeout,
    /// Malformed filter, rejected at the subscribe/fetch call site.
    #[error("invalid filter: {0}")]
    Filter(String),
    /// Gift-wrap or seal layer could not be decrypted or parsed.
    #[error("decryption failed: {0}")]
    Decryption(String),
    /// Event id or signature does not check out.
    #[error("invalid event: {0}")]
    Validation(String),
    /// Relay sent a frame that is not a recognized protocol message.
    #[error("malformed relay message: {0}")]
    Message(String),
    /// The requested relay is not part of the pool.
    #[error("relay not found: {0}")]
    RelayNotFound(String),
    /// The operation needs signing keys but the client has none.
    #[error("signer required for this operation")]
    SignerRequired,
    /// Bech32 entity could not be decoded.
    #[error("invalid bech32: {0}")]
    Bech32(String),
    #[error("invalid key: {0}")]
    Key(#[from] secp256k1::Error),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
