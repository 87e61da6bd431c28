//! Relay pool: fanout, subscription registry, and the delivery pipeline.
//!
//! All relay actors feed one mpsc channel consumed by a single dispatcher
//! task, so per-relay ordering is preserved and the delivery pipeline runs
//! in one place: verify, mute check, filter match, dedup, deliver. Live
//! subscriptions deliver through a broadcast channel; fetches deliver into
//! a per-query collector.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::event::{Event, Events};
use crate::filter::{self, Filter};
use crate::message::{ClientMessage, RelayMessage, SubscriptionId};
use crate::mute::MuteList;
use crate::relay::{Relay, RelayOptions, RelayStatus};

/// Broadcast capacity; slow consumers see `Lagged` past this.
const NOTIFICATION_CAPACITY: usize = 1024;

/// Input to the dispatcher from relay actors.
#[derive(Debug)]
pub(crate) enum PoolInput {
    Message {
        relay_url: Url,
        message: RelayMessage,
    },
    Status {
        relay_url: Url,
        status: RelayStatus,
    },
}

/// Pool-level notification delivered to `notifications()` receivers.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Deduplicated event that passed mute and filter checks.
    Event {
        relay_url: Url,
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    /// Non-event relay message (OK, NOTICE, CLOSED, EOSE).
    Message {
        relay_url: Url,
        message: RelayMessage,
    },
    /// Relay connectivity change.
    RelayStatus {
        relay_url: Url,
        status: RelayStatus,
    },
    /// The pool was disconnected; notification loops should end.
    Shutdown,
}

/// Collector signal for one in-flight fetch.
#[derive(Debug)]
pub(crate) enum FetchSignal {
    Event(Box<Event>),
    Eose(Url),
}

enum Delivery {
    Live,
    Fetch(UnboundedSender<FetchSignal>),
}

struct SubState {
    filters: Vec<Filter>,
    /// Event ids already delivered for this subscription.
    seen: HashSet<String>,
    bypass_mute: bool,
    delivery: Delivery,
}

/// Active subscriptions, shared with every relay actor for replay.
#[derive(Default)]
pub(crate) struct Registry {
    subs: HashMap<SubscriptionId, SubState>,
}

impl Registry {
    /// REQ messages to reissue on a fresh transport.
    pub(crate) fn replay_messages(&self) -> Vec<ClientMessage> {
        self.subs
            .iter()
            .map(|(id, state)| ClientMessage::Req {
                subscription_id: id.clone(),
                filters: state.filters.clone(),
            })
            .collect()
    }
}

/// Multi-relay pool with a shared subscription registry.
///
/// Clones share state.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    relay_opts: RelayOptions,
    verify_events: bool,
    relays: RwLock<HashMap<Url, Relay>>,
    registry: Arc<Mutex<Registry>>,
    mute: MuteList,
    notif_tx: broadcast::Sender<Notification>,
    pool_tx: UnboundedSender<PoolInput>,
    /// Whether `connect()` has been called; relays added later auto-connect.
    connected: AtomicBool,
}

impl RelayPool {
    pub fn new(relay_opts: RelayOptions, verify_events: bool, mute: MuteList) -> Self {
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (notif_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let registry = Arc::new(Mutex::new(Registry::default()));

        tokio::spawn(dispatch(
            pool_rx,
            Arc::clone(&registry),
            mute.clone(),
            notif_tx.clone(),
            verify_events,
        ));

        Self {
            inner: Arc::new(PoolInner {
                relay_opts,
                verify_events,
                relays: RwLock::new(HashMap::new()),
                registry,
                mute,
                notif_tx,
                pool_tx,
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn mute(&self) -> &MuteList {
        &self.inner.mute
    }

    /// Add a relay endpoint. Returns false when the url is already present.
    /// Connects immediately if the pool is connected.
    pub fn add_relay(&self, url: Url) -> bool {
        let mut relays = self.inner.relays.write().expect("relay map lock poisoned");
        if relays.contains_key(&url) {
            return false;
        }
        let relay = Relay::spawn(
            url.clone(),
            self.inner.relay_opts.clone(),
            Arc::clone(&self.inner.registry),
            self.inner.pool_tx.clone(),
        );
        if self.inner.connected.load(Ordering::SeqCst) {
            relay.connect();
        }
        relays.insert(url, relay);
        true
    }

    pub fn relay(&self, url: &Url) -> Result<Relay> {
        self.inner
            .relays
            .read()
            .expect("relay map lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| Error::RelayNotFound(url.to_string()))
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.inner
            .relays
            .read()
            .expect("relay map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Connect every relay. Relays added afterwards connect on add.
    pub fn connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        for relay in self.relays() {
            relay.connect();
        }
    }

    /// Disconnect every relay and tell notification loops to stop.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        for relay in self.relays() {
            relay.disconnect();
        }
        let _ = self.inner.notif_tx.send(Notification::Shutdown);
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notif_tx.subscribe()
    }

    pub fn has_subscription(&self, id: &SubscriptionId) -> bool {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .subs
            .contains_key(id)
    }

    /// Open a live subscription across every relay.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<SubscriptionId> {
        filter::validate_filters(&filters)?;
        let id = SubscriptionId::generate();
        self.register(id.clone(), filters.clone(), false, Delivery::Live);
        self.send_to_all(ClientMessage::Req {
            subscription_id: id.clone(),
            filters,
        });
        Ok(id)
    }

    /// Tear down a subscription. Idempotent.
    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let removed = {
            let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry.subs.remove(id).is_some()
        };
        if removed {
            self.send_to_all(ClientMessage::Close(id.clone()));
        }
    }

    /// One-shot query: collect matches until every usable relay reports
    /// EOSE or the deadline fires, then return what was gathered.
    pub async fn fetch_events(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
        bypass_mute: bool,
    ) -> Result<Events> {
        filter::validate_filters(&filters)?;

        // Failed relays never answer; do not wait on them.
        let relays: Vec<Relay> = self
            .relays()
            .into_iter()
            .filter(|r| r.status().is_usable())
            .collect();
        if relays.is_empty() {
            return Err(Error::Connection("pool has no usable relays".into()));
        }

        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::generate();
        self.register(
            id.clone(),
            filters.clone(),
            bypass_mute,
            Delivery::Fetch(fetch_tx),
        );
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: filters.clone(),
        };
        let mut remaining: HashSet<Url> = HashSet::new();
        for relay in &relays {
            if relay.send(req.clone()).is_ok() {
                remaining.insert(relay.url().clone());
            }
        }

        let deadline = Instant::now() + timeout;
        let mut events = Events::new();
        let mut responded = false;
        while !remaining.is_empty() {
            let signal = tokio::time::timeout_at(deadline, fetch_rx.recv()).await;
            match signal {
                Ok(Some(FetchSignal::Event(event))) => {
                    responded = true;
                    events.insert(*event);
                }
                Ok(Some(FetchSignal::Eose(url))) => {
                    responded = true;
                    remaining.remove(&url);
                }
                // Dispatcher gone; nothing further will arrive.
                Ok(None) => break,
                Err(_) => {
                    debug!(subscription = %id, "fetch deadline reached");
                    break;
                }
            }
        }
        self.unsubscribe(&id);

        if events.is_empty() && !responded {
            return Err(Error::Timeout);
        }
        Ok(events.into_sorted(filter::request_limit(&filters)))
    }

    /// Publish an event to every relay.
    pub fn send_event(&self, event: Event) -> Result<()> {
        if self.inner.verify_events {
            event.verify()?;
        }
        self.send_to_all(ClientMessage::Event(Box::new(event)));
        Ok(())
    }

    fn register(
        &self,
        id: SubscriptionId,
        filters: Vec<Filter>,
        bypass_mute: bool,
        delivery: Delivery,
    ) {
        let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
        registry.subs.insert(
            id,
            SubState {
                filters,
                seen: HashSet::new(),
                bypass_mute,
                delivery,
            },
        );
    }

    /// Queue `message` on every usable relay. Failed relays are excluded
    /// until manually reconnected; they would only accumulate the message
    /// in a queue nobody drains. Membership is snapshotted first so
    /// concurrent `add_relay` cannot disturb the iteration.
    fn send_to_all(&self, message: ClientMessage) {
        for relay in self.relays() {
            if !relay.status().is_usable() {
                continue;
            }
            if let Err(e) = relay.send(message.clone()) {
                warn!(relay = %relay.url(), error = %e, "send failed");
            }
        }
    }
}

/// Single consumer of all relay traffic; runs the delivery pipeline.
async fn dispatch(
    mut rx: UnboundedReceiver<PoolInput>,
    registry: Arc<Mutex<Registry>>,
    mute: MuteList,
    notif_tx: broadcast::Sender<Notification>,
    verify_events: bool,
) {
    while let Some(input) = rx.recv().await {
        match input {
            PoolInput::Message { relay_url, message } => match message {
                RelayMessage::Event {
                    subscription_id,
                    event,
                } => {
                    if verify_events {
                        if let Err(e) = event.verify() {
                            warn!(relay = %relay_url, id = %event.id, error = %e, "dropping invalid event");
                            continue;
                        }
                    }
                    deliver(
                        &registry,
                        &mute,
                        &notif_tx,
                        relay_url,
                        subscription_id,
                        event,
                    );
                }
                RelayMessage::EndOfStoredEvents(ref subscription_id) => {
                    {
                        let registry = registry.lock().expect("registry lock poisoned");
                        if let Some(SubState {
                            delivery: Delivery::Fetch(tx),
                            ..
                        }) = registry.subs.get(subscription_id)
                        {
                            let _ = tx.send(FetchSignal::Eose(relay_url.clone()));
                        }
                    }
                    let _ = notif_tx.send(Notification::Message { relay_url, message });
                }
                other => {
                    let _ = notif_tx.send(Notification::Message {
                        relay_url,
                        message: other,
                    });
                }
            },
            PoolInput::Status { relay_url, status } => {
                let _ = notif_tx.send(Notification::RelayStatus { relay_url, status });
            }
        }
    }
}

/// Mute check, filter match, dedup, then hand off to the subscription's
/// delivery channel.
fn deliver(
    registry: &Mutex<Registry>,
    mute: &MuteList,
    notif_tx: &broadcast::Sender<Notification>,
    relay_url: Url,
    subscription_id: SubscriptionId,
    event: Box<Event>,
) {
    let mut registry = registry.lock().expect("registry lock poisoned");
    let Some(sub) = registry.subs.get_mut(&subscription_id) else {
        // Late traffic for a closed subscription.
        return;
    };
    if !sub.bypass_mute && mute.is_muted_hex(&event.pubkey) {
        return;
    }
    if !filter::match_any(&sub.filters, &event) {
        debug!(relay = %relay_url, id = %event.id, "event outside subscription filters");
        return;
    }
    if !sub.seen.insert(event.id.clone()) {
        return;
    }
    match &sub.delivery {
        Delivery::Live => {
            let _ = notif_tx.send(Notification::Event {
                relay_url,
                subscription_id,
                event,
            });
        }
        Delivery::Fetch(tx) => {
            let _ = tx.send(FetchSignal::Event(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kind, UnsignedEvent};
    use crate::key::Keys;

    fn pool() -> RelayPool {
        RelayPool::new(RelayOptions::default(), true, MuteList::new())
    }

    fn signed(keys: &Keys, content: &str) -> Event {
        UnsignedEvent::new(&keys.public_key(), 100, kind::TEXT_NOTE, vec![], content)
            .sign(keys)
            .unwrap()
    }

    fn inject(pool: &RelayPool, sub: &SubscriptionId, event: Event) {
        pool.inner
            .pool_tx
            .send(PoolInput::Message {
                relay_url: Url::parse("ws://relay.test").unwrap(),
                message: RelayMessage::Event {
                    subscription_id: sub.clone(),
                    event: Box::new(event),
                },
            })
            .unwrap();
    }

    #[tokio::test]
    async fn pipeline_delivers_matching_event_once() {
        let pool = pool();
        let keys = Keys::generate();
        let sub = pool.subscribe(vec![Filter::new().kind(kind::TEXT_NOTE)]).unwrap();
        let mut notifications = pool.notifications();

        let event = signed(&keys, "hello");
        inject(&pool, &sub, event.clone());
        inject(&pool, &sub, event.clone());

        match notifications.recv().await.unwrap() {
            Notification::Event {
                subscription_id,
                event: delivered,
                ..
            } => {
                assert_eq!(subscription_id, sub);
                assert_eq!(*delivered, event);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        // The duplicate must not surface.
        let second = tokio::time::timeout(Duration::from_millis(50), notifications.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn pipeline_drops_muted_author() {
        let pool = pool();
        let keys = Keys::generate();
        pool.mute().add_public_keys([keys.public_key()]);
        let sub = pool.subscribe(vec![Filter::new().kind(kind::TEXT_NOTE)]).unwrap();
        let mut notifications = pool.notifications();

        inject(&pool, &sub, signed(&keys, "muted"));
        let got = tokio::time::timeout(Duration::from_millis(50), notifications.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn pipeline_drops_filter_mismatch_and_invalid() {
        let pool = pool();
        let keys = Keys::generate();
        let sub = pool.subscribe(vec![Filter::new().kind(kind::METADATA)]).unwrap();
        let mut notifications = pool.notifications();

        // Kind mismatch.
        inject(&pool, &sub, signed(&keys, "wrong kind"));
        // Bad signature.
        let mut forged = signed(&keys, "forged");
        forged.sig = "00".repeat(64);
        inject(&pool, &sub, forged);

        let got = tokio::time::timeout(Duration::from_millis(50), notifications.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let pool = pool();
        let keys = Keys::generate();
        let sub = pool.subscribe(vec![Filter::new().kind(kind::TEXT_NOTE)]).unwrap();
        assert!(pool.has_subscription(&sub));
        pool.unsubscribe(&sub);
        pool.unsubscribe(&sub);
        assert!(!pool.has_subscription(&sub));

        let mut notifications = pool.notifications();
        inject(&pool, &sub, signed(&keys, "late"));
        let got = tokio::time::timeout(Duration::from_millis(50), notifications.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn registry_replays_active_subscriptions() {
        let pool = pool();
        let filters = vec![Filter::new().kind(kind::TEXT_NOTE)];
        let sub = pool.subscribe(filters.clone()).unwrap();

        let registry = pool.inner.registry.lock().unwrap();
        let replay = registry.replay_messages();
        assert_eq!(replay.len(), 1);
        match &replay[0] {
            ClientMessage::Req {
                subscription_id,
                filters: replayed,
            } => {
                assert_eq!(subscription_id, &sub);
                assert_eq!(replayed, &filters);
            }
            other => panic!("unexpected replay message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_filters() {
        let pool = pool();
        assert!(matches!(pool.subscribe(vec![]), Err(Error::Filter(_))));
        assert!(pool
            .subscribe(vec![Filter::new().since(10).until(5)])
            .is_err());
    }

    #[tokio::test]
    async fn fetch_with_empty_pool_fails_fast() {
        let pool = pool();
        let err = pool
            .fetch_events(
                vec![Filter::new().kind(kind::TEXT_NOTE)],
                Duration::from_secs(5),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn eose_reaches_fetch_and_broadcast() {
        let pool = pool();
        let mut notifications = pool.notifications();
        let url = Url::parse("ws://relay.test").unwrap();
        pool.inner
            .pool_tx
            .send(PoolInput::Message {
                relay_url: url.clone(),
                message: RelayMessage::EndOfStoredEvents(SubscriptionId::new("nobody")),
            })
            .unwrap();
        match notifications.recv().await.unwrap() {
            Notification::Message { relay_url, message } => {
                assert_eq!(relay_url, url);
                assert!(matches!(message, RelayMessage::EndOfStoredEvents(_)));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }
}
