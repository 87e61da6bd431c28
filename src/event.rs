//! Nostr event model: signed events, unsigned rumors, and result collections.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::key::{Keys, PublicKey};

/// Well-known event kind numbers used by this crate.
pub mod kind {
    /// Profile metadata (NIP-01).
    pub const METADATA: u32 = 0;
    /// Plain text note (NIP-01).
    pub const TEXT_NOTE: u32 = 1;
    /// Seal carrying an encrypted rumor (NIP-59).
    pub const SEAL: u32 = 13;
    /// Private direct message rumor (NIP-17).
    pub const PRIVATE_DIRECT_MESSAGE: u32 = 14;
    /// Gift wrap envelope (NIP-59).
    pub const GIFT_WRAP: u32 = 1059;
}

/// Current Unix timestamp in seconds.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved. For
/// example, a `["t", "news"]` tag from the protocol is represented as
/// `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

/// Signed, immutable Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "deadbeef...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"]],
///   "content": "hello",
///   "sig": "cafe..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical field array).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `1059`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `p` (recipient) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Check that the id matches the canonical hash and that the Schnorr
    /// signature verifies against the author key.
    pub fn verify(&self) -> Result<()> {
        let hash = canonical_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(hash) != self.id {
            return Err(Error::Validation("id does not match event fields".into()));
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)
            .map_err(|e| Error::Validation(format!("bad signature encoding: {e}")))?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)
            .map_err(|e| Error::Validation(format!("bad pubkey: {e}")))?;
        let secp = Secp256k1::verification_only();
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| Error::Validation(e.to_string()))?;
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| Error::Validation(format!("signature check failed: {e}")))
    }

    /// Author as a typed key.
    pub fn author(&self) -> Result<PublicKey> {
        PublicKey::from_hex(&self.pubkey)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Event without a signature ("rumor"), produced by unwrapping gift wraps
/// and used as the innermost layer when sending private messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Build a rumor with its id computed from the other fields.
    pub fn new(
        author: &PublicKey,
        created_at: u64,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        let pubkey = author.to_hex();
        let content = content.into();
        let id = canonical_hash(&pubkey, created_at, kind, &tags, &content)
            .map(hex::encode)
            .unwrap_or_default();
        Self {
            id,
            pubkey,
            kind,
            created_at,
            tags,
            content,
        }
    }

    /// Sign with `keys`, recomputing the id so the result stays internally
    /// consistent even when fields were edited after construction.
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let pubkey = keys.public_key().to_hex();
        let hash = canonical_hash(&pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let sig = sign_hash(&hash, keys.keypair())?;
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Nostr event hash: SHA-256 over the canonical `[0, pubkey, created_at,
/// kind, tags, content]` array.
pub(crate) fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

fn sign_hash(hash: &[u8; 32], keypair: &Keypair) -> Result<String> {
    let secp = Secp256k1::new();
    let msg = Message::from_digest_slice(hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
    Ok(hex::encode(sig.as_ref()))
}

/// Deduplicated collection of events returned by fetch queries.
///
/// Order after sorting is reverse-chronological by `created_at`, ties broken
/// by id.
#[derive(Debug, Clone, Default)]
pub struct Events {
    inner: Vec<Event>,
    ids: HashSet<String>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, ignoring duplicates by id. Returns whether the event
    /// was actually added.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.ids.insert(event.id.clone()) {
            self.inner.push(event);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Newest event, once sorted.
    pub fn first(&self) -> Option<&Event> {
        self.inner.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.inner.iter()
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.inner.clone()
    }

    /// Sort reverse-chronologically and apply an optional result limit.
    pub(crate) fn into_sorted(mut self, limit: Option<usize>) -> Self {
        self.inner
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            self.inner.truncate(limit);
            self.ids = self.inner.iter().map(|e| e.id.clone()).collect();
        }
        self
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: 1,
            created_at,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn canonical_hash_matches_reference() {
        let pubkey = "00".repeat(32);
        let expected: [u8; 32] = {
            let obj = serde_json::json!([0, pubkey, 1, 1, Vec::<Tag>::new(), ""]);
            Sha256::digest(serde_json::to_vec(&obj).unwrap()).into()
        };
        assert_eq!(canonical_hash(&pubkey, 1, 1, &[], "").unwrap(), expected);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = Keys::generate();
        let ev = UnsignedEvent::new(
            &keys.public_key(),
            1700000000,
            kind::TEXT_NOTE,
            vec![Tag(vec!["t".into(), "news".into()])],
            "hello",
        )
        .sign(&keys)
        .unwrap();
        ev.verify().unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let keys = Keys::generate();
        let mut ev = UnsignedEvent::new(&keys.public_key(), 1, kind::TEXT_NOTE, vec![], "hello")
            .sign(&keys)
            .unwrap();
        ev.content = "tampered".into();
        assert!(matches!(ev.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let keys = Keys::generate();
        let mut ev = UnsignedEvent::new(&keys.public_key(), 1, kind::TEXT_NOTE, vec![], "hi")
            .sign(&keys)
            .unwrap();
        ev.sig = "00".repeat(64);
        assert!(ev.verify().is_err());
    }

    #[test]
    fn unsigned_event_id_is_stable() {
        let keys = Keys::generate();
        let a = UnsignedEvent::new(&keys.public_key(), 5, kind::PRIVATE_DIRECT_MESSAGE, vec![], "x");
        let b = UnsignedEvent::new(&keys.public_key(), 5, kind::PRIVATE_DIRECT_MESSAGE, vec![], "x");
        assert_eq!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn events_dedup_by_id() {
        let mut events = Events::new();
        assert!(events.insert(sample("aa11", 1)));
        assert!(!events.insert(sample("aa11", 1)));
        assert_eq!(events.len(), 1);
        assert!(events.contains_id("aa11"));
    }

    #[test]
    fn events_sorted_newest_first_ties_by_id() {
        let mut events = Events::new();
        events.insert(sample("bb22", 1));
        events.insert(sample("cc33", 2));
        events.insert(sample("aa11", 2));
        let sorted = events.into_sorted(None);
        let ids: Vec<&str> = sorted.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["aa11", "cc33", "bb22"]);
    }

    #[test]
    fn events_limit_truncates_after_sort() {
        let mut events = Events::new();
        events.insert(sample("aa11", 1));
        events.insert(sample("bb22", 3));
        events.insert(sample("cc33", 2));
        let sorted = events.into_sorted(Some(2));
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted.first().unwrap().id, "bb22");
        assert!(!sorted.contains_id("aa11"));
    }
}
