//! Local mute list consulted before events are delivered.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::key::PublicKey;

/// Set of muted authors, shared between the client and the caller.
///
/// Clones share state. Mutations take effect for every delivery that starts
/// after the call returns; events already handed to the caller are not
/// recalled.
#[derive(Debug, Clone, Default)]
pub struct MuteList {
    muted: Arc<RwLock<HashSet<String>>>,
}

impl MuteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_public_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let mut muted = self.muted.write().expect("mute list lock poisoned");
        muted.extend(keys.into_iter().map(|pk| pk.to_hex()));
    }

    pub fn remove_public_keys<I>(&self, keys: I)
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let mut muted = self.muted.write().expect("mute list lock poisoned");
        for pk in keys {
            muted.remove(&pk.to_hex());
        }
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.is_muted_hex(&key.to_hex())
    }

    pub fn len(&self) -> usize {
        self.muted.read().expect("mute list lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_muted_hex(&self, pubkey: &str) -> bool {
        self.muted
            .read()
            .expect("mute list lock poisoned")
            .contains(pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Keys;

    #[test]
    fn add_remove_contains() {
        let mute = MuteList::new();
        let pk = Keys::generate().public_key();
        assert!(!mute.contains(&pk));
        mute.add_public_keys([pk]);
        assert!(mute.contains(&pk));
        assert!(mute.is_muted_hex(&pk.to_hex()));
        mute.remove_public_keys([pk]);
        assert!(!mute.contains(&pk));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mute = MuteList::new();
        mute.remove_public_keys([Keys::generate().public_key()]);
        assert!(mute.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let mute = MuteList::new();
        let handle = mute.clone();
        let pk = Keys::generate().public_key();
        handle.add_public_keys([pk]);
        assert!(mute.contains(&pk));
        assert_eq!(mute.len(), 1);
    }
}
