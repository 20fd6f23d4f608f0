use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, ConnectionConfig, RawParams};
use crate::errors::{BoxError, Result, SourceError};
use crate::source::{Broker, BrokerClient, BrokerConsumer, Position, Record, State};
use crate::telemetry::SourceMetrics;

type ConsumerOf<B> = <<B as Broker>::Client as BrokerClient>::Consumer;

/// Drives one subscription through configure -> open -> read/ack -> teardown.
///
/// The adapter exclusively owns the broker client and consumer. It assumes a
/// single sequential caller; every operation takes `&mut self`.
pub struct SourceAdapter<B: Broker> {
    broker: B,
    state: State,
    config: Option<ConnectionConfig>,
    client: Option<B::Client>,
    consumer: Option<ConsumerOf<B>>,
    metrics: SourceMetrics,
}

impl<B: Broker> SourceAdapter<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            state: State::Unconfigured,
            config: None,
            client: None,
            consumer: None,
            metrics: SourceMetrics::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    pub fn metrics(&self) -> &SourceMetrics {
        &self.metrics
    }

    /// Validates `params` and stores the result. May be called again to
    /// replace the configuration until the source is opened.
    pub fn configure(&mut self, params: &RawParams) -> Result<()> {
        if !matches!(self.state, State::Unconfigured | State::Configured) {
            return Err(self.invalid_state("configure"));
        }

        let config = ConnectionConfig::parse(&config::with_defaults(params))?;
        debug!(
            "Configured source for topic {} subscription {} ({:?})",
            config.topic(),
            config.subscription_name(),
            config.subscription_mode()
        );

        self.config = Some(config);
        self.state = State::Configured;
        Ok(())
    }

    /// Connects to the broker and subscribes.
    ///
    /// `resume` is not used to seek the subscription: where delivery starts is
    /// decided by the broker-side cursor of the named subscription.
    pub async fn open(&mut self, resume: Option<&Position>) -> Result<()> {
        if self.state != State::Configured {
            return Err(self.invalid_state("open"));
        }
        let Some(config) = self.config.as_ref() else {
            return Err(self.invalid_state("open"));
        };

        if resume.is_some() {
            warn!(
                "Ignoring resume position; subscription {} continues from its broker-side cursor",
                config.subscription_name()
            );
        }

        let mut client = self
            .broker
            .connect(config)
            .await
            .map_err(|source| SourceError::Connection { source })?;

        let consumer = match client
            .subscribe(
                config.topic(),
                config.subscription_name(),
                config.subscription_mode(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(source) => {
                if let Err(e) = client.close().await {
                    warn!("Failed to close client after subscribe failure: {}", e);
                }
                return Err(SourceError::Subscription {
                    topic: config.topic().to_string(),
                    source,
                });
            }
        };

        info!(
            "Subscribed to topic {} as {}",
            config.topic(),
            config.subscription_name()
        );

        self.client = Some(client);
        self.consumer = Some(consumer);
        self.state = State::Open;
        Ok(())
    }

    /// Blocks until the next message arrives or `cancel` fires.
    /// The message is not acknowledged; call [`SourceAdapter::ack`] with its position.
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<Record> {
        let consumer = self.consumer_mut("read")?;

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            received = consumer.receive() => received,
        };

        match received {
            Ok(Some(message)) => {
                let record = Record::from_message(&message);
                self.metrics.record_read(record.payload().len());
                debug!(
                    "Received message from {} ({} bytes)",
                    record.topic().unwrap_or_default(),
                    record.payload().len()
                );
                Ok(record)
            }
            Ok(None) => {
                warn!("Message stream of the subscription has ended");
                Err(SourceError::StreamClosed)
            }
            Err(source) => {
                self.metrics.receive_errors += 1;
                Err(SourceError::Receive { source })
            }
        }
    }

    pub async fn ack(&mut self, position: &Position) -> Result<()> {
        let consumer = self.consumer_mut("ack")?;

        let id = consumer
            .deserialize_id(position.as_bytes())
            .map_err(|source| SourceError::InvalidPosition { source })?;

        match consumer.ack_id(id).await {
            Ok(()) => {
                self.metrics.acks += 1;
                Ok(())
            }
            Err(source) => {
                self.metrics.ack_failures += 1;
                warn!("Failed to acknowledge message: {}", source);
                Err(SourceError::Ack { source })
            }
        }
    }

    /// Unsubscribes and releases the consumer and client. Safe to call in any
    /// state and any number of times. Cleanup continues past failures; the
    /// first one is reported.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut first_error: Option<BoxError> = None;

        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.unsubscribe().await {
                warn!("Failed to unsubscribe: {}", e);
                first_error.get_or_insert(e);
            }
            if let Err(e) = consumer.close().await {
                warn!("Failed to close consumer: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!("Failed to close client: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if self.state != State::Closed {
            info!("Source closed (was {})", self.state);
        }
        self.state = State::Closed;

        match first_error {
            Some(source) => Err(SourceError::Teardown { source }),
            None => Ok(()),
        }
    }

    fn consumer_mut(&mut self, operation: &'static str) -> Result<&mut ConsumerOf<B>> {
        let state = self.state;
        match self.consumer.as_mut() {
            Some(consumer) if state == State::Open => Ok(consumer),
            _ => Err(SourceError::InvalidState { operation, state }),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> SourceError {
        SourceError::InvalidState {
            operation,
            state: self.state,
        }
    }
}
