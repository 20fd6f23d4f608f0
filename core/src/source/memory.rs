//! An in-process broker.
//!
//! Topics are append-only logs and subscriptions are named cursors over them,
//! so a subscription outlives the consumers attached to it. Fault controls
//! let hosts exercise the failure paths of a [`SourceAdapter`](super::SourceAdapter)
//! without a running broker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::config::{ConnectionConfig, SubscriptionMode};
use crate::errors::BoxError;
use crate::source::{Broker, BrokerClient, BrokerConsumer, BrokerMessage};

const ID_MAGIC: &[u8; 4] = b"mem1";

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    event_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SubscriptionState {
    mode: SubscriptionMode,
    cursor: usize,
    consumers: usize,
    unacked: HashSet<u64>,
    acked: usize,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    streams_closed: bool,
    next_id: u64,
    topics: HashMap<String, Vec<StoredMessage>>,
    subscriptions: HashMap<(String, String), SubscriptionState>,
    invalidated: HashSet<u64>,
    open_clients: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_subscribe: false,
            fail_unsubscribe: false,
            streams_closed: false,
            next_id: 1,
            topics: HashMap::new(),
            subscriptions: HashMap::new(),
            invalidated: HashSet::new(),
            open_clients: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    published: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheap to clone; clones share the same topics and subscriptions.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to `topic` and wakes waiting consumers.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        event_time: Option<DateTime<Utc>>,
    ) -> u64 {
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(StoredMessage {
                    id,
                    key: key.map(<[u8]>::to_vec),
                    payload: payload.to_vec(),
                    event_time,
                });
            id
        };
        self.shared.published.notify_waiters();
        id
    }

    /// When unreachable, every connection attempt is refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.shared.lock().fail_subscribe = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.shared.lock().fail_unsubscribe = fail;
    }

    /// Ends the message stream of every consumer, as when the broker drops
    /// the consumer for good. Waiting receives return immediately.
    pub fn close_streams(&self) {
        self.shared.lock().streams_closed = true;
        self.shared.published.notify_waiters();
    }

    /// Makes every delivered-but-unacknowledged message of the subscription
    /// unacknowledgeable, as after a broker-side redelivery.
    pub fn invalidate_unacked(&self, topic: &str, subscription: &str) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state
            .subscriptions
            .get(&(topic.to_string(), subscription.to_string()))
            .map(|s| s.unacked.iter().copied().collect())
            .unwrap_or_default();
        state.invalidated.extend(ids);
    }

    pub fn acknowledged(&self, topic: &str, subscription: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .get(&(topic.to_string(), subscription.to_string()))
            .map_or(0, |s| s.acked)
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.shared
            .lock()
            .subscriptions
            .contains_key(&(topic.to_string(), subscription.to_string()))
    }

    pub fn open_clients(&self) -> usize {
        self.shared.lock().open_clients
    }
}

impl Broker for MemoryBroker {
    type Client = MemoryClient;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MemoryClient, BoxError> {
        let mut state = self.shared.lock();
        if !state.reachable {
            let url = config.urls().first().map(|u| u.to_string()).unwrap_or_default();
            return Err(format!("connection refused: {url}").into());
        }
        state.open_clients += 1;
        Ok(MemoryClient {
            shared: Arc::clone(&self.shared),
        })
    }
}

#[derive(Debug)]
pub struct MemoryClient {
    shared: Arc<Shared>,
}

impl BrokerClient for MemoryClient {
    type Consumer = MemoryConsumer;

    async fn subscribe(
        &mut self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
    ) -> Result<MemoryConsumer, BoxError> {
        let mut state = self.shared.lock();
        if state.fail_subscribe {
            return Err(format!("subscribe to {topic} rejected").into());
        }

        let key = (topic.to_string(), subscription.to_string());
        let sub = state
            .subscriptions
            .entry(key.clone())
            .or_insert_with(|| SubscriptionState {
                mode,
                cursor: 0,
                consumers: 0,
                unacked: HashSet::new(),
                acked: 0,
            });

        if sub.mode != mode {
            return Err(format!(
                "subscription {subscription} exists with mode {:?}",
                sub.mode
            )
            .into());
        }
        if sub.mode == SubscriptionMode::Exclusive && sub.consumers > 0 {
            return Err(format!("exclusive subscription {subscription} is busy").into());
        }
        sub.consumers += 1;

        Ok(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            key,
        })
    }

    async fn close(self) -> Result<(), BoxError> {
        let mut state = self.shared.lock();
        state.open_clients = state.open_clients.saturating_sub(1);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    key: (String, String),
}

impl MemoryConsumer {
    fn try_next(&self) -> Result<Option<MemoryMessage>, BoxError> {
        let mut state = self.shared.lock();
        let state = &mut *state;
        let sub = state
            .subscriptions
            .get_mut(&self.key)
            .ok_or("subscription no longer exists")?;
        let Some(stored) = state
            .topics
            .get(&self.key.0)
            .and_then(|log| log.get(sub.cursor))
        else {
            return Ok(None);
        };

        sub.cursor += 1;
        sub.unacked.insert(stored.id);
        Ok(Some(MemoryMessage {
            topic: self.key.0.clone(),
            id: stored.id,
            key: stored.key.clone(),
            payload: stored.payload.clone(),
            event_time: stored.event_time,
        }))
    }
}

impl BrokerConsumer for MemoryConsumer {
    type Message = MemoryMessage;
    type MessageId = u64;

    async fn receive(&mut self) -> Result<Option<MemoryMessage>, BoxError> {
        loop {
            // Registered before checking so a publish in between is not missed.
            let published = self.shared.published.notified();
            if self.shared.lock().streams_closed {
                return Ok(None);
            }
            if let Some(message) = self.try_next()? {
                return Ok(Some(message));
            }
            published.await;
        }
    }

    fn deserialize_id(&self, bytes: &[u8]) -> Result<u64, BoxError> {
        match bytes.split_first_chunk::<4>() {
            Some((magic, rest)) if magic == ID_MAGIC => {
                let id: [u8; 8] = rest
                    .try_into()
                    .map_err(|_| format!("expected 8 id bytes, got {}", rest.len()))?;
                Ok(u64::from_be_bytes(id))
            }
            _ => Err("not an in-memory message id".into()),
        }
    }

    async fn ack_id(&mut self, id: u64) -> Result<(), BoxError> {
        let mut state = self.shared.lock();
        if state.invalidated.contains(&id) {
            return Err(format!("message id {id} is no longer valid").into());
        }
        let sub = state
            .subscriptions
            .get_mut(&self.key)
            .ok_or("subscription no longer exists")?;
        if sub.unacked.remove(&id) {
            sub.acked += 1;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), BoxError> {
        let mut state = self.shared.lock();
        if state.fail_unsubscribe {
            return Err(format!("unsubscribe from {} rejected", self.key.0).into());
        }
        state.subscriptions.remove(&self.key);
        Ok(())
    }

    async fn close(self) -> Result<(), BoxError> {
        let mut state = self.shared.lock();
        if let Some(sub) = state.subscriptions.get_mut(&self.key) {
            sub.consumers = sub.consumers.saturating_sub(1);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryMessage {
    topic: String,
    id: u64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    event_time: Option<DateTime<Utc>>,
}

impl BrokerMessage for MemoryMessage {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn event_time(&self) -> Option<DateTime<Utc>> {
        self.event_time
    }

    fn serialized_id(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(ID_MAGIC);
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}
