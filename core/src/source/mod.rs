pub mod adapter;
pub mod memory;
pub mod pulsar;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, SubscriptionMode};
use crate::errors::BoxError;

pub use adapter::SourceAdapter;

pub const METADATA_TOPIC: &str = "topic";
/// Event time in Unix nanoseconds. Absent when the broker did not set one.
pub const METADATA_CREATED_AT: &str = "createdAt";

/// An opaque handle used to acknowledge a delivered message.
/// Only the broker binding that produced it knows how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position(Vec<u8>);

impl Position {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Position {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A message received from the broker, normalized for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    position: Position,
    metadata: BTreeMap<String, String>,
    key: Vec<u8>,
    payload: Vec<u8>,
}

impl Record {
    pub(crate) fn from_message<M: BrokerMessage>(message: &M) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_TOPIC.to_string(), message.topic().to_string());
        if let Some(nanos) = message.event_time().and_then(|t| t.timestamp_nanos_opt()) {
            metadata.insert(METADATA_CREATED_AT.to_string(), nanos.to_string());
        }

        Self {
            position: Position(message.serialized_id()),
            metadata,
            key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            payload: message.payload().to_vec(),
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn topic(&self) -> Option<&str> {
        self.metadata.get(METADATA_TOPIC).map(String::as_str)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let nanos: i64 = self.metadata.get(METADATA_CREATED_AT)?.parse().ok()?;
        Some(DateTime::from_timestamp_nanos(nanos))
    }

    /// Message key; empty when the message carried none.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Lifecycle state of a [`SourceAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    Configured,
    Open,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Unconfigured => "unconfigured",
            State::Configured => "configured",
            State::Open => "open",
            State::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Entry point of a broker binding: builds clients from validated settings.
#[allow(async_fn_in_trait)]
pub trait Broker {
    type Client: BrokerClient;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Client, BoxError>;
}

#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    type Consumer: BrokerConsumer;

    async fn subscribe(
        &mut self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
    ) -> Result<Self::Consumer, BoxError>;

    async fn close(self) -> Result<(), BoxError>;
}

/// A subscribed consumer. Acknowledgment takes `&mut self`, so a binding
/// never sees two acks in flight on the same consumer.
#[allow(async_fn_in_trait)]
pub trait BrokerConsumer {
    type Message: BrokerMessage;
    type MessageId;

    /// Waits for the next message. `None` means the stream has ended and no
    /// further message will arrive on this consumer. Dropping the returned
    /// future must not lose a message.
    async fn receive(&mut self) -> Result<Option<Self::Message>, BoxError>;

    fn deserialize_id(&self, bytes: &[u8]) -> Result<Self::MessageId, BoxError>;

    async fn ack_id(&mut self, id: Self::MessageId) -> Result<(), BoxError>;

    async fn unsubscribe(&mut self) -> Result<(), BoxError>;

    async fn close(self) -> Result<(), BoxError>;
}

pub trait BrokerMessage {
    fn topic(&self) -> &str;

    /// Producer-assigned event time, `None` when unset.
    fn event_time(&self) -> Option<DateTime<Utc>>;

    fn serialized_id(&self) -> Vec<u8>;

    fn key(&self) -> Option<&[u8]>;

    fn payload(&self) -> &[u8];
}
