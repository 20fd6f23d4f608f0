use ::pulsar::consumer::Message;
use ::pulsar::message::proto::MessageIdData;
use ::pulsar::{
    ConnectionRetryOptions, Consumer, OperationRetryOptions, Pulsar, SubType, TokioExecutor,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, SubscriptionMode};
use crate::errors::BoxError;
use crate::source::{Broker, BrokerClient, BrokerConsumer, BrokerMessage};

const POSITION_VERSION: u8 = 1;

/// Apache Pulsar binding running on the tokio executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulsarBroker;

impl Broker for PulsarBroker {
    type Client = PulsarClient;

    /// Tries the configured service URLs in order and keeps the first that connects.
    async fn connect(&self, config: &ConnectionConfig) -> Result<PulsarClient, BoxError> {
        let mut last_error: Option<BoxError> = None;

        for url in config.urls() {
            let connection_options = ConnectionRetryOptions {
                connection_timeout: config.connection_timeout(),
                ..Default::default()
            };
            let operation_options = OperationRetryOptions {
                operation_timeout: config.operation_timeout(),
                ..Default::default()
            };

            let built = Pulsar::builder(url.as_str(), TokioExecutor)
                .with_connection_retry_options(connection_options)
                .with_operation_retry_options(operation_options)
                .build()
                .await;

            match built {
                Ok(pulsar) => {
                    info!("Connected to Pulsar at {}", url);
                    return Ok(PulsarClient { pulsar });
                }
                Err(e) => {
                    warn!("Could not connect to Pulsar at {}: {}", url, e);
                    last_error = Some(Box::new(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "no broker URL configured".into()))
    }
}

pub struct PulsarClient {
    pulsar: Pulsar<TokioExecutor>,
}

impl BrokerClient for PulsarClient {
    type Consumer = PulsarConsumer;

    async fn subscribe(
        &mut self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
    ) -> Result<PulsarConsumer, BoxError> {
        let consumer: Consumer<Vec<u8>, TokioExecutor> = self
            .pulsar
            .consumer()
            .with_topic(topic)
            .with_subscription(subscription)
            .with_subscription_type(sub_type(mode))
            .build()
            .await?;

        Ok(PulsarConsumer {
            consumer,
            unsubscribed: false,
        })
    }

    async fn close(self) -> Result<(), BoxError> {
        // Connections are shut down when the last handle is dropped.
        drop(self.pulsar);
        Ok(())
    }
}

fn sub_type(mode: SubscriptionMode) -> SubType {
    match mode {
        SubscriptionMode::Exclusive => SubType::Exclusive,
        SubscriptionMode::Shared => SubType::Shared,
        SubscriptionMode::Failover => SubType::Failover,
        SubscriptionMode::KeyShared => SubType::KeyShared,
    }
}

pub struct PulsarConsumer {
    consumer: Consumer<Vec<u8>, TokioExecutor>,
    unsubscribed: bool,
}

impl BrokerConsumer for PulsarConsumer {
    type Message = PulsarMessage;
    type MessageId = PulsarPosition;

    async fn receive(&mut self) -> Result<Option<PulsarMessage>, BoxError> {
        let message = self.consumer.try_next().await?;
        Ok(message.map(|message| PulsarMessage { message }))
    }

    fn deserialize_id(&self, bytes: &[u8]) -> Result<PulsarPosition, BoxError> {
        PulsarPosition::from_bytes(bytes)
            .map_err(|reason| format!("malformed pulsar position: {reason}").into())
    }

    /// Queues the ack on the consumer engine and returns without waiting for a
    /// broker receipt. An error here means the engine is gone; an ack lost on
    /// the wire is not reported and the message is redelivered later.
    async fn ack_id(&mut self, id: PulsarPosition) -> Result<(), BoxError> {
        debug!("Acknowledging {}:{} on {}", id.ledger_id, id.entry_id, id.topic);
        self.consumer.ack_with_id(&id.topic, id.message_id()).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), BoxError> {
        self.consumer.unsubscribe().await?;
        self.unsubscribed = true;
        Ok(())
    }

    async fn close(mut self) -> Result<(), BoxError> {
        // the broker already dropped the consumer along with the subscription
        if self.unsubscribed {
            return Ok(());
        }
        self.consumer.close().await?;
        Ok(())
    }
}

pub struct PulsarMessage {
    message: Message<Vec<u8>>,
}

impl BrokerMessage for PulsarMessage {
    fn topic(&self) -> &str {
        &self.message.topic
    }

    fn event_time(&self) -> Option<DateTime<Utc>> {
        self.message
            .payload
            .metadata
            .event_time
            .filter(|&millis| millis > 0)
            .and_then(|millis| i64::try_from(millis).ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    fn serialized_id(&self) -> Vec<u8> {
        PulsarPosition::new(&self.message.topic, self.message.message_id()).to_bytes()
    }

    fn key(&self) -> Option<&[u8]> {
        self.message
            .payload
            .metadata
            .partition_key
            .as_deref()
            .map(str::as_bytes)
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload.data
    }
}

/// Serializable form of a Pulsar message id. The topic is kept so the ack
/// reaches the right partition of a partitioned topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulsarPosition {
    topic: String,
    ledger_id: u64,
    entry_id: u64,
    partition: i32,
    batch_index: i32,
}

impl PulsarPosition {
    fn new(topic: &str, id: &MessageIdData) -> Self {
        Self {
            topic: topic.to_string(),
            ledger_id: id.ledger_id,
            entry_id: id.entry_id,
            partition: id.partition.unwrap_or(-1),
            batch_index: id.batch_index.unwrap_or(-1),
        }
    }

    fn message_id(&self) -> MessageIdData {
        MessageIdData {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: (self.partition >= 0).then_some(self.partition),
            batch_index: (self.batch_index >= 0).then_some(self.batch_index),
            ..Default::default()
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        // version + topic length + topic + ledger + entry + partition + batch index
        let mut bytes = Vec::with_capacity(29 + self.topic.len());
        bytes.push(POSITION_VERSION);
        bytes.extend_from_slice(&(self.topic.len() as u32).to_le_bytes());
        bytes.extend_from_slice(self.topic.as_bytes());
        bytes.extend_from_slice(&self.ledger_id.to_le_bytes());
        bytes.extend_from_slice(&self.entry_id.to_le_bytes());
        bytes.extend_from_slice(&self.partition.to_le_bytes());
        bytes.extend_from_slice(&self.batch_index.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        let (&version, rest) = bytes.split_first().ok_or("empty")?;
        if version != POSITION_VERSION {
            return Err("unknown version");
        }

        let (topic_len, rest) = rest.split_first_chunk::<4>().ok_or("truncated")?;
        let topic_len = u32::from_le_bytes(*topic_len) as usize;
        if rest.len() != topic_len + 24 {
            return Err("unexpected length");
        }
        let (topic, rest) = rest.split_at(topic_len);
        let topic = std::str::from_utf8(topic).map_err(|_| "topic is not UTF-8")?;

        let (ledger_id, rest) = rest.split_first_chunk::<8>().ok_or("truncated")?;
        let (entry_id, rest) = rest.split_first_chunk::<8>().ok_or("truncated")?;
        let (partition, rest) = rest.split_first_chunk::<4>().ok_or("truncated")?;
        let (batch_index, _) = rest.split_first_chunk::<4>().ok_or("truncated")?;

        Ok(Self {
            topic: topic.to_string(),
            ledger_id: u64::from_le_bytes(*ledger_id),
            entry_id: u64::from_le_bytes(*entry_id),
            partition: i32::from_le_bytes(*partition),
            batch_index: i32::from_le_bytes(*batch_index),
        })
    }
}
