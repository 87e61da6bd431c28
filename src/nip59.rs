//! NIP-59 gift wraps: sealed, wrapped rumors for private messages.
//!
//! Layering, outermost first:
//!
//! 1. wrap — kind 1059 event signed by a one-off ephemeral key, `p`-tagged
//!    to the receiver; content is the NIP-44 encryption of the seal.
//! 2. seal — kind 13 event signed by the real sender; content is the NIP-44
//!    encryption of the rumor.
//! 3. rumor — the unsigned payload event (kind 14 for direct messages).
//!
//! Seal and wrap timestamps are backdated by a random amount of up to two
//! days so relay metadata does not reveal when the message was sent. Rumor
//! timestamps are advisory and left for the caller to judge.

use rand::Rng;

use crate::error::{Error, Result};
use crate::event::{kind, unix_time, Event, Tag, UnsignedEvent};
use crate::key::{Keys, PublicKey};
use crate::nip44;

/// Upper bound on random timestamp backdating (two days).
const BACKDATE_RANGE: u64 = 2 * 24 * 60 * 60;

/// Result of unwrapping a gift wrap addressed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedGift {
    /// Author of the seal, i.e. the real sender.
    pub sender: PublicKey,
    /// The decrypted inner event. Unsigned; authenticity comes from the
    /// seal signature, not the rumor itself.
    pub rumor: UnsignedEvent,
}

impl UnwrappedGift {
    /// Unwrap a kind-1059 gift wrap with the receiver's keys.
    ///
    /// Every failure mode is reported as `Error::Decryption`: wrong kind,
    /// an outer or inner layer that does not decrypt or parse, a seal with
    /// a bad signature, or a rumor whose author differs from the seal's.
    pub fn from_gift_wrap(keys: &Keys, gift_wrap: &Event) -> Result<Self> {
        if gift_wrap.kind != kind::GIFT_WRAP {
            return Err(Error::Decryption(format!(
                "expected kind {}, got {}",
                kind::GIFT_WRAP,
                gift_wrap.kind
            )));
        }
        // Outer layer is keyed by the wrap's ephemeral author.
        let ephemeral = PublicKey::from_hex(&gift_wrap.pubkey)
            .map_err(|e| Error::Decryption(format!("bad wrap pubkey: {e}")))?;
        let outer_key = nip44::conversation_key(keys.secret_key(), &ephemeral)?;
        let seal_json = nip44::decrypt(&gift_wrap.content, &outer_key)?;
        let seal: Event = serde_json::from_slice(&seal_json)
            .map_err(|e| Error::Decryption(format!("seal is not an event: {e}")))?;

        if seal.kind != kind::SEAL {
            return Err(Error::Decryption(format!(
                "expected seal kind {}, got {}",
                kind::SEAL,
                seal.kind
            )));
        }
        seal.verify()
            .map_err(|e| Error::Decryption(format!("seal rejected: {e}")))?;

        // Inner layer is keyed by the seal author, the real sender.
        let sender = PublicKey::from_hex(&seal.pubkey)
            .map_err(|e| Error::Decryption(format!("bad seal pubkey: {e}")))?;
        let inner_key = nip44::conversation_key(keys.secret_key(), &sender)?;
        let rumor_json = nip44::decrypt(&seal.content, &inner_key)?;
        let rumor: UnsignedEvent = serde_json::from_slice(&rumor_json)
            .map_err(|e| Error::Decryption(format!("rumor is not an event: {e}")))?;

        if rumor.pubkey != seal.pubkey {
            return Err(Error::Decryption(
                "rumor author differs from seal author".into(),
            ));
        }
        Ok(Self { sender, rumor })
    }
}

/// Seal and wrap `rumor` for `receiver`.
pub fn gift_wrap(sender: &Keys, receiver: &PublicKey, rumor: &UnsignedEvent) -> Result<Event> {
    let seal_key = nip44::conversation_key(sender.secret_key(), receiver)?;
    let seal = UnsignedEvent::new(
        &sender.public_key(),
        backdated_now(),
        kind::SEAL,
        vec![],
        nip44::encrypt(rumor.as_json().as_bytes(), &seal_key)?,
    )
    .sign(sender)?;

    let ephemeral = Keys::generate();
    let wrap_key = nip44::conversation_key(ephemeral.secret_key(), receiver)?;
    UnsignedEvent::new(
        &ephemeral.public_key(),
        backdated_now(),
        kind::GIFT_WRAP,
        vec![Tag(vec!["p".into(), receiver.to_hex()])],
        nip44::encrypt(seal.as_json().as_bytes(), &wrap_key)?,
    )
    .sign(&ephemeral)
}

fn backdated_now() -> u64 {
    let now = unix_time();
    now.saturating_sub(rand::thread_rng().gen_range(0..BACKDATE_RANGE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm_rumor(sender: &Keys, receiver: &PublicKey, text: &str) -> UnsignedEvent {
        UnsignedEvent::new(
            &sender.public_key(),
            unix_time(),
            kind::PRIVATE_DIRECT_MESSAGE,
            vec![Tag(vec!["p".into(), receiver.to_hex()])],
            text,
        )
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = dm_rumor(&alice, &bob.public_key(), "see you at 9");
        let wrap = gift_wrap(&alice, &bob.public_key(), &rumor).unwrap();

        assert_eq!(wrap.kind, kind::GIFT_WRAP);
        // The wrap is signed by an ephemeral key, never the sender.
        assert_ne!(wrap.pubkey, alice.public_key().to_hex());
        wrap.verify().unwrap();

        let unwrapped = UnwrappedGift::from_gift_wrap(&bob, &wrap).unwrap();
        assert_eq!(unwrapped.sender, alice.public_key());
        assert_eq!(unwrapped.rumor, rumor);
    }

    #[test]
    fn wrap_is_p_tagged_and_backdated() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = dm_rumor(&alice, &bob.public_key(), "hi");
        let wrap = gift_wrap(&alice, &bob.public_key(), &rumor).unwrap();
        assert!(wrap
            .tags
            .iter()
            .any(|t| t.0 == vec!["p".to_string(), bob.public_key().to_hex()]));
        assert!(wrap.created_at <= unix_time());
        assert!(wrap.created_at + BACKDATE_RANGE + 60 >= unix_time());
    }

    #[test]
    fn wrong_recipient_cannot_unwrap() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let rumor = dm_rumor(&alice, &bob.public_key(), "for bob only");
        let wrap = gift_wrap(&alice, &bob.public_key(), &rumor).unwrap();
        assert!(matches!(
            UnwrappedGift::from_gift_wrap(&eve, &wrap),
            Err(Error::Decryption(_))
        ));
    }

    #[test]
    fn non_gift_wrap_kind_rejected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let note = UnsignedEvent::new(&alice.public_key(), unix_time(), kind::TEXT_NOTE, vec![], "x")
            .sign(&alice)
            .unwrap();
        assert!(matches!(
            UnwrappedGift::from_gift_wrap(&bob, &note),
            Err(Error::Decryption(_))
        ));
    }

    #[test]
    fn garbage_content_rejected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let rumor = dm_rumor(&alice, &bob.public_key(), "hi");
        let mut wrap = gift_wrap(&alice, &bob.public_key(), &rumor).unwrap();
        wrap.content = "AAAA".into();
        assert!(matches!(
            UnwrappedGift::from_gift_wrap(&bob, &wrap),
            Err(Error::Decryption(_))
        ));
    }
}
