//! High-level client over the relay pool.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use url::Url;

use crate::error::{Error, Result};
use crate::event::{kind, unix_time, Event, Events, Tag, UnsignedEvent};
use crate::filter::Filter;
use crate::key::{Keys, PublicKey};
use crate::message::SubscriptionId;
use crate::mute::MuteList;
use crate::nip59::{self, UnwrappedGift};
use crate::pool::{Notification, RelayPool};
use crate::relay::{RelayOptions, RelayStatus};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) verify_events: bool,
    pub(crate) relay: RelayOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            verify_events: true,
            relay: RelayOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify id and signature of every inbound event before delivery
    /// (default true). Invalid events are logged and dropped.
    pub fn verify_events(mut self, verify: bool) -> Self {
        self.verify_events = verify;
        self
    }

    /// Transport options applied to every relay added to the pool.
    pub fn relay(mut self, relay: RelayOptions) -> Self {
        self.relay = relay;
        self
    }
}

/// Callback interface for [`Client::handle_notifications`].
///
/// Invocations are sequential within one `handle_notifications` loop; a
/// handler is never re-entered. Returning `true` ends the loop.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Called once per deduplicated event that passed mute and filter
    /// checks.
    async fn handle_event(
        &self,
        relay_url: &Url,
        subscription_id: &SubscriptionId,
        event: &Event,
    ) -> bool;

    /// Called for non-event relay messages (OK, NOTICE, CLOSED, EOSE).
    async fn handle_message(
        &self,
        _relay_url: &Url,
        _message: &crate::message::RelayMessage,
    ) -> bool {
        false
    }
}

/// Multi-relay Nostr client.
///
/// Cloning is cheap; clones share the pool, the mute list, and the
/// subscription registry.
#[derive(Clone)]
pub struct Client {
    pool: RelayPool,
    keys: Option<Keys>,
}

impl Default for Client {
    /// Read-only client without signing keys.
    fn default() -> Self {
        Self::with_opts(None, ClientOptions::default())
    }
}

impl Client {
    pub fn new(keys: Keys) -> Self {
        Self::with_opts(Some(keys), ClientOptions::default())
    }

    pub fn with_opts(keys: Option<Keys>, opts: ClientOptions) -> Self {
        let pool = RelayPool::new(opts.relay.clone(), opts.verify_events, MuteList::new());
        Self { pool, keys }
    }

    /// Mute list handle. Muted authors are dropped before delivery.
    pub fn filtering(&self) -> MuteList {
        self.pool.mute().clone()
    }

    /// Add a relay endpoint. Returns false when the url was already added.
    pub fn add_relay(&self, url: &str) -> Result<bool> {
        let url = Url::parse(url)?;
        Ok(self.pool.add_relay(url))
    }

    /// Connect every relay in the pool.
    pub fn connect(&self) {
        self.pool.connect();
    }

    /// Disconnect every relay and end `handle_notifications` loops.
    pub fn disconnect(&self) {
        self.pool.disconnect();
    }

    /// Urls currently in the pool.
    pub fn relays(&self) -> Vec<Url> {
        self.pool.relays().iter().map(|r| r.url().clone()).collect()
    }

    pub fn relay_status(&self, url: &str) -> Result<RelayStatus> {
        let url = Url::parse(url)?;
        Ok(self.pool.relay(&url)?.status())
    }

    /// Open a live subscription across the pool.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<SubscriptionId> {
        self.pool.subscribe(filters)
    }

    /// Close a subscription. Idempotent.
    pub fn unsubscribe(&self, id: &SubscriptionId) {
        self.pool.unsubscribe(id);
    }

    /// Fetch stored events matching `filters`, waiting at most `timeout`.
    ///
    /// Returns once every usable relay reported end-of-stored-events or the
    /// deadline fires, whichever comes first; partial results are returned.
    /// `Error::Timeout` only when nothing was collected and no relay
    /// responded at all.
    pub async fn fetch_events(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Events> {
        self.pool.fetch_events(filters, timeout, false).await
    }

    /// Like [`Client::fetch_events`] but ignoring the mute list, for
    /// inspecting what muted authors publish.
    pub async fn fetch_events_unfiltered(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Result<Events> {
        self.pool.fetch_events(filters, timeout, true).await
    }

    /// Raw notification stream; most callers want
    /// [`Client::handle_notifications`] instead.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.pool.notifications()
    }

    /// Drive `handler` with pool notifications until it returns `true`,
    /// the pool is disconnected, or the notification channel closes.
    ///
    /// Events whose subscription has been closed in the meantime are
    /// skipped, so unsubscribing stops delivery deterministically.
    pub async fn handle_notifications<H>(&self, handler: H) -> Result<()>
    where
        H: NotificationHandler,
    {
        let mut notifications = self.pool.notifications();
        loop {
            match notifications.recv().await {
                Ok(Notification::Event {
                    relay_url,
                    subscription_id,
                    event,
                }) => {
                    if !self.pool.has_subscription(&subscription_id) {
                        continue;
                    }
                    if handler
                        .handle_event(&relay_url, &subscription_id, &event)
                        .await
                    {
                        break;
                    }
                }
                Ok(Notification::Message { relay_url, message }) => {
                    if handler.handle_message(&relay_url, &message).await {
                        break;
                    }
                }
                Ok(Notification::RelayStatus { .. }) => {}
                Ok(Notification::Shutdown) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification receiver lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    /// Publish a signed event to every relay.
    pub fn send_event(&self, event: Event) -> Result<()> {
        self.pool.send_event(event)
    }

    /// Build and publish a signed event from `unsigned`.
    pub fn send_event_builder(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let keys = self.keys()?;
        let event = unsigned.sign(keys)?;
        self.pool.send_event(event.clone())?;
        Ok(event)
    }

    /// Send a private direct message: a kind-14 rumor, gift wrapped for
    /// `receiver` and published to every relay. `reply_to` threads the
    /// message under an earlier event id.
    pub fn send_private_msg(
        &self,
        receiver: &PublicKey,
        message: impl Into<String>,
        reply_to: Option<&str>,
    ) -> Result<Event> {
        let keys = self.keys()?;
        let mut tags = vec![Tag(vec!["p".into(), receiver.to_hex()])];
        if let Some(reply) = reply_to {
            tags.push(Tag(vec!["e".into(), reply.into()]));
        }
        let rumor = UnsignedEvent::new(
            &keys.public_key(),
            unix_time(),
            kind::PRIVATE_DIRECT_MESSAGE,
            tags,
            message,
        );
        let wrap = nip59::gift_wrap(keys, receiver, &rumor)?;
        self.pool.send_event(wrap.clone())?;
        Ok(wrap)
    }

    /// Unwrap a kind-1059 gift wrap addressed to this client's keys.
    pub fn unwrap_gift_wrap(&self, gift_wrap: &Event) -> Result<UnwrappedGift> {
        UnwrappedGift::from_gift_wrap(self.keys()?, gift_wrap)
    }

    fn keys(&self) -> Result<&Keys> {
        self.keys.as_ref().ok_or(Error::SignerRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_relay_rejects_bad_url_and_duplicates() {
        let client = Client::default();
        assert!(client.add_relay("not a url").is_err());
        assert!(client.add_relay("ws://localhost:48700").unwrap());
        assert!(!client.add_relay("ws://localhost:48700").unwrap());
        assert_eq!(client.relays().len(), 1);
    }

    #[tokio::test]
    async fn relay_status_unknown_url() {
        let client = Client::default();
        assert!(matches!(
            client.relay_status("ws://localhost:48701"),
            Err(Error::RelayNotFound(_))
        ));
    }

    #[tokio::test]
    async fn signer_required_without_keys() {
        let client = Client::default();
        let receiver = Keys::generate().public_key();
        assert!(matches!(
            client.send_private_msg(&receiver, "hi", None),
            Err(Error::SignerRequired)
        ));
    }

    #[tokio::test]
    async fn filtering_handle_is_shared() {
        let client = Client::default();
        let pk = Keys::generate().public_key();
        client.filtering().add_public_keys([pk]);
        assert!(client.filtering().contains(&pk));
    }

    #[tokio::test]
    async fn oversize_private_msg_rejected_at_send() {
        let alice = Client::new(Keys::generate());
        let receiver = Keys::generate().public_key();
        let body = "x".repeat(70_000);
        assert!(matches!(
            alice.send_private_msg(&receiver, body, None),
            Err(Error::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn private_msg_round_trip_without_network() {
        let alice = Client::new(Keys::generate());
        let bob_keys = Keys::generate();
        let bob = Client::new(bob_keys.clone());
        let wrap = alice
            .send_private_msg(&bob_keys.public_key(), "lunch?", Some("aa11"))
            .unwrap();
        assert_eq!(wrap.kind, kind::GIFT_WRAP);
        let unwrapped = bob.unwrap_gift_wrap(&wrap).unwrap();
        assert_eq!(unwrapped.rumor.kind, kind::PRIVATE_DIRECT_MESSAGE);
        assert_eq!(unwrapped.rumor.content, "lunch?");
        assert!(unwrapped
            .rumor
            .tags
            .iter()
            .any(|t| t.0 == vec!["e".to_string(), "aa11".to_string()]));
    }
}
