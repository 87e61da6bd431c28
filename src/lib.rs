//! Multi-relay Nostr client.
//!
//! `poolstr` maintains a pool of relay WebSocket connections, multiplexes
//! logical subscriptions across them with cross-relay deduplication, drops
//! events from locally muted authors before delivery, and unwraps NIP-59
//! gift-wrapped private messages.
//!
//! The transport speaks plaintext WebSocket (`ws://`); see the notes on
//! [`RelayOptions`] and its SOCKS5 proxy support for reaching TLS or onion
//! endpoints.
//!
//! ```no_run
//! use std::time::Duration;
//! use poolstr::{Client, Filter, Keys};
//!
//! # async fn run() -> poolstr::Result<()> {
//! let client = Client::new(Keys::generate());
//! client.add_relay("ws://relay.example.net")?;
//! client.add_relay("ws://mirror.example.net:8080")?;
//! client.connect();
//!
//! let notes = client
//!     .fetch_events(
//!         vec![Filter::new().kind(poolstr::kind::TEXT_NOTE).limit(10)],
//!         Duration::from_secs(10),
//!     )
//!     .await?;
//! for note in notes.iter() {
//!     println!("{}: {}", note.pubkey, note.content);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod event;
mod filter;
mod key;
mod message;
mod mute;
mod nip44;
mod nip59;
mod pool;
mod relay;

pub use client::{Client, ClientOptions, NotificationHandler};
pub use error::{Error, Result};
pub use event::{kind, unix_time, Event, Events, Tag, UnsignedEvent};
pub use filter::Filter;
pub use key::{Keys, PublicKey, SecretKey};
pub use message::{ClientMessage, RelayMessage, SubscriptionId};
pub use mute::MuteList;
pub use nip59::{gift_wrap, UnwrappedGift};
pub use pool::{Notification, RelayPool};
pub use relay::{Relay, RelayOptions, RelayStatus};
