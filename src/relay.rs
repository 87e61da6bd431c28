//! Relay connection actor.
//!
//! Each relay endpoint gets one task that owns the WebSocket. The handle
//! side queues outbound messages on an unbounded channel; the actor drains
//! it once a transport is up, so sends issued while disconnected flush on
//! connect. Transport loss triggers a jittered exponential-backoff reconnect
//! loop bounded by `RelayOptions::max_retries`; exhaustion parks the actor
//! in the `Failed` state until `connect()` is called again.
//!
//! The transport is plaintext WebSocket: use `ws://` urls. TLS is not
//! terminated here, so `wss://` endpoints must be reached through a local
//! TLS-terminating proxy or the SOCKS5 option (e.g. Tor, which carries its
//! own encryption to the hidden service).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::message::{ClientMessage, RelayMessage, SubscriptionId};
use crate::pool::{PoolInput, Registry};

/// Connection state of a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// No transport and no attempt in progress.
    Disconnected,
    /// First transport attempt for this connect call.
    Connecting,
    /// Transport is up.
    Connected,
    /// Transport was lost; the backoff loop is retrying.
    Reconnecting,
    /// Retry budget exhausted; excluded from fanout until reconnected.
    Failed,
}

impl RelayStatus {
    /// Whether the relay takes part in fanout and fetch accounting.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Per-relay transport options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub(crate) reconnect: bool,
    pub(crate) max_retries: u32,
    pub(crate) retry_min: Duration,
    pub(crate) retry_max: Duration,
    pub(crate) proxy: Option<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_retries: 8,
            retry_min: Duration::from_secs(5),
            retry_max: Duration::from_secs(120),
            proxy: None,
        }
    }
}

impl RelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry after transport loss (default true).
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Consecutive failed attempts tolerated before the relay is marked
    /// `Failed`.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First backoff delay; doubles per attempt up to `retry_max`.
    pub fn retry_min(mut self, retry_min: Duration) -> Self {
        self.retry_min = retry_min;
        self
    }

    pub fn retry_max(mut self, retry_max: Duration) -> Self {
        self.retry_max = retry_max;
        self
    }

    /// SOCKS5 proxy address, e.g. `127.0.0.1:9050` for Tor.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// Handle to one relay actor. Clones share the actor.
#[derive(Debug, Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

#[derive(Debug)]
struct RelayInner {
    url: Url,
    tx: UnboundedSender<ClientMessage>,
    status_rx: watch::Receiver<RelayStatus>,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
}

impl Relay {
    /// Spawn the actor task for `url`. The actor starts parked in
    /// `Disconnected` until `connect()`.
    pub(crate) fn spawn(
        url: Url,
        opts: RelayOptions,
        registry: Arc<std::sync::Mutex<Registry>>,
        pool_tx: UnboundedSender<PoolInput>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RelayStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        let actor = RelayActor {
            url: url.clone(),
            opts,
            rx,
            status_tx,
            shutdown_rx,
            registry,
            pool_tx,
            wake: Arc::clone(&wake),
        };
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(RelayInner {
                url,
                tx,
                status_rx,
                wake,
                shutdown_tx,
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.inner.status_rx.borrow()
    }

    /// Ask the actor to establish (or re-establish) the transport. Also the
    /// way out of the `Failed` state.
    pub(crate) fn connect(&self) {
        self.inner.shutdown_tx.send_replace(false);
        self.inner.wake.notify_one();
    }

    /// Release the transport. Idempotent; queued messages stay queued for a
    /// later `connect()`.
    pub(crate) fn disconnect(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Queue a message for delivery. Flushes immediately when connected.
    pub(crate) fn send(&self, message: ClientMessage) -> Result<()> {
        self.inner
            .tx
            .send(message)
            .map_err(|_| Error::Connection(format!("relay task for {} is gone", self.inner.url)))
    }
}

struct RelayActor {
    url: Url,
    opts: RelayOptions,
    rx: UnboundedReceiver<ClientMessage>,
    status_tx: watch::Sender<RelayStatus>,
    shutdown_rx: watch::Receiver<bool>,
    registry: Arc<std::sync::Mutex<Registry>>,
    pool_tx: UnboundedSender<PoolInput>,
    wake: Arc<Notify>,
}

impl RelayActor {
    async fn run(mut self) {
        loop {
            // Parked until connect() is requested.
            self.wake.notified().await;
            if self.pool_tx.is_closed() {
                return;
            }
            self.session_loop().await;
        }
    }

    /// Connect, serve, and retry until shutdown or retry exhaustion.
    async fn session_loop(&mut self) {
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown_rx.borrow() {
                self.set_status(RelayStatus::Disconnected);
                return;
            }
            self.set_status(if attempts == 0 {
                RelayStatus::Connecting
            } else {
                RelayStatus::Reconnecting
            });

            match connect_ws(&self.url, self.opts.proxy.as_deref()).await {
                Ok(ws) => {
                    debug!(relay = %self.url, "connected");
                    attempts = 0;
                    self.set_status(RelayStatus::Connected);
                    match self.serve(ws).await {
                        SessionEnd::Shutdown => {
                            self.set_status(RelayStatus::Disconnected);
                            return;
                        }
                        SessionEnd::Dropped => {
                            warn!(relay = %self.url, "connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %self.url, error = %e, "connect failed");
                }
            }

            if !self.opts.reconnect {
                self.set_status(RelayStatus::Disconnected);
                return;
            }
            attempts += 1;
            if attempts > self.opts.max_retries {
                warn!(relay = %self.url, attempts, "retries exhausted");
                self.set_status(RelayStatus::Failed);
                return;
            }
            let delay = backoff_delay(&self.opts, attempts);
            debug!(relay = %self.url, attempt = attempts, ?delay, "retrying");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {}
            }
        }
    }

    /// Serve one live transport until it drops or shutdown is requested.
    async fn serve(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Active subscriptions survive reconnects: replay them before
        // touching the outbound queue.
        let replay = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.replay_messages()
        };
        let mut replayed: HashSet<SubscriptionId> = HashSet::new();
        for msg in replay {
            if let ClientMessage::Req {
                ref subscription_id,
                ..
            } = msg
            {
                replayed.insert(subscription_id.clone());
            }
            if sink.send(Message::Text(msg.to_json())).await.is_err() {
                return SessionEnd::Dropped;
            }
        }

        loop {
            tokio::select! {
                outbound = self.rx.recv() => {
                    let Some(msg) = outbound else {
                        // Pool dropped; treat as shutdown.
                        return SessionEnd::Shutdown;
                    };
                    // A REQ queued while disconnected is already covered by
                    // the replay of the same subscription id.
                    if let ClientMessage::Req { ref subscription_id, .. } = msg {
                        if replayed.remove(subscription_id) {
                            continue;
                        }
                    }
                    if sink.send(Message::Text(msg.to_json())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(txt))) => self.handle_frame(&txt),
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %self.url, error = %e, "read failed");
                            return SessionEnd::Dropped;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(message) => {
                let _ = self.pool_tx.send(PoolInput::Message {
                    relay_url: self.url.clone(),
                    message,
                });
            }
            Err(e) => {
                debug!(relay = %self.url, error = %e, "dropping malformed frame");
            }
        }
    }

    fn set_status(&self, status: RelayStatus) {
        self.status_tx.send_replace(status);
        let _ = self.pool_tx.send(PoolInput::Status {
            relay_url: self.url.clone(),
            status,
        });
    }
}

enum SessionEnd {
    /// Explicit disconnect; do not retry.
    Shutdown,
    /// Transport loss; eligible for retry.
    Dropped,
}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Exponential backoff with jitter: half the capped delay is fixed, the
/// other half uniformly random, so a pool of relays does not thunder back
/// in step.
fn backoff_delay(opts: &RelayOptions, attempt: u32) -> Duration {
    let exp = opts
        .retry_min
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(opts.retry_max);
    let half = capped / 2;
    half + rand::thread_rng().gen_range(Duration::ZERO..=half)
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    url: &Url,
    proxy: Option<&str>,
) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Connection(format!("{url}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Connection(format!("{url}: missing port")))?;
    let req = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Connection(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = proxy {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Connection(e.to_string()))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Connection(e.to_string()))?,
        )
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let opts = RelayOptions::new()
            .retry_min(Duration::from_secs(4))
            .retry_max(Duration::from_secs(16));
        for (attempt, capped) in [(1u32, 4u64), (2, 8), (3, 16), (4, 16), (10, 16)] {
            let delay = backoff_delay(&opts, attempt);
            assert!(delay >= Duration::from_secs(capped / 2), "attempt {attempt}");
            assert!(delay <= Duration::from_secs(capped), "attempt {attempt}");
        }
    }

    #[test]
    fn options_defaults() {
        let opts = RelayOptions::default();
        assert!(opts.reconnect);
        assert_eq!(opts.retry_min, Duration::from_secs(5));
        assert_eq!(opts.retry_max, Duration::from_secs(120));
        assert!(opts.proxy.is_none());
    }

    #[test]
    fn failed_is_not_usable() {
        assert!(RelayStatus::Connected.is_usable());
        assert!(RelayStatus::Disconnected.is_usable());
        assert!(!RelayStatus::Failed.is_usable());
    }

    #[tokio::test]
    async fn connect_ws_unreachable_host_errors() {
        let url = Url::parse("ws://127.0.0.1:1").unwrap();
        assert!(connect_ws(&url, None).await.is_err());
    }

    #[tokio::test]
    async fn connect_ws_missing_host_errors() {
        let url = Url::parse("unix:/tmp/sock").unwrap();
        assert!(connect_ws(&url, None).await.is_err());
    }
}
