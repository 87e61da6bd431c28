//! Typed NIP-01 wire messages.
//!
//! Relays and clients exchange JSON arrays whose first element names the
//! verb: `["REQ", <sub id>, <filter>...]`, `["EVENT", <sub id>, <event>]`,
//! `["EOSE", <sub id>]` and so on. Frames with an unknown verb or the wrong
//! shape parse to `Error::Message` and are dropped by the transport.

use std::fmt;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;

/// Identifier for one logical subscription, reused as the relay-local
/// subscription id on every relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Event(Box<Event>),
    Close(SubscriptionId),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id.as_str())];
                arr.extend(filters.iter().map(Filter::to_value));
                Value::Array(arr)
            }
            Self::Event(event) => json!(["EVENT", event]),
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id.as_str()]),
        };
        value.to_string()
    }
}

/// Message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    /// Stored events for the subscription are exhausted; what follows is live.
    EndOfStoredEvents(SubscriptionId),
    /// Publish acknowledgement for an EVENT we sent.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    /// The relay closed a subscription on its side.
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::Message("frame is not a JSON array".into()))?;
        let verb = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Message("frame has no verb".into()))?;
        match verb {
            "EVENT" => {
                let sub = str_at(arr, 1, "EVENT")?;
                let event = arr
                    .get(2)
                    .ok_or_else(|| Error::Message("EVENT frame missing event".into()))?;
                let event: Event = serde_json::from_value(event.clone())
                    .map_err(|e| Error::Message(format!("bad event in EVENT frame: {e}")))?;
                Ok(Self::Event {
                    subscription_id: SubscriptionId::new(sub),
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents(SubscriptionId::new(str_at(
                arr, 1, "EOSE",
            )?))),
            "OK" => {
                let event_id = str_at(arr, 1, "OK")?.to_string();
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::Message("OK frame missing flag".into()))?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "NOTICE" => Ok(Self::Notice(str_at(arr, 1, "NOTICE")?.to_string())),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: SubscriptionId::new(str_at(arr, 1, "CLOSED")?),
                message: arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(Error::Message(format!("unknown verb `{other}`"))),
        }
    }
}

fn str_at<'a>(arr: &'a [Value], idx: usize, verb: &str) -> Result<&'a str> {
    arr.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Message(format!("{verb} frame missing string at {idx}")))
}
