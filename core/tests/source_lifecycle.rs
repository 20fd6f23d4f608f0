use std::error::Error as _;
use std::time::Duration;

use chrono::DateTime;
use source_core::config::RawParams;
use source_core::source::memory::MemoryBroker;
use source_core::{ConfigError, Position, SourceAdapter, SourceError, State};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "persistent://public/default/orders";
const SUBSCRIPTION: &str = "orders-sub";

fn params() -> RawParams {
    [
        ("url", "pulsar://localhost:6650"),
        ("topic", TOPIC),
        ("subscriptionName", SUBSCRIPTION),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

async fn open_source(broker: &MemoryBroker) -> SourceAdapter<MemoryBroker> {
    let mut source = SourceAdapter::new(broker.clone());
    source.configure(&params()).expect("Failed to configure");
    source.open(None).await.expect("Failed to open");
    source
}

#[tokio::test]
async fn test_read_then_ack() {
    let broker = MemoryBroker::new();
    let event_time = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    broker.publish(
        TOPIC,
        Some(b"order-1".as_slice()),
        b"{\"total\":10}",
        Some(event_time),
    );

    let mut source = open_source(&broker).await;
    let record = source.read(&CancellationToken::new()).await.unwrap();

    assert_eq!(record.topic(), Some(TOPIC));
    assert_eq!(record.created_at(), Some(event_time));
    assert_eq!(record.key(), b"order-1");
    assert_eq!(record.payload(), b"{\"total\":10}");
    assert_eq!(broker.acknowledged(TOPIC, SUBSCRIPTION), 0);

    source.ack(record.position()).await.unwrap();
    assert_eq!(broker.acknowledged(TOPIC, SUBSCRIPTION), 1);
    assert_eq!(source.metrics().acks, 1);
    assert_eq!(source.metrics().in_flight(), 0);
}

#[tokio::test]
async fn test_every_read_position_acks() {
    let broker = MemoryBroker::new();
    for i in 0..5 {
        broker.publish(TOPIC, None, format!("message-{i}").as_bytes(), None);
    }

    let mut source = open_source(&broker).await;
    let cancel = CancellationToken::new();
    let mut positions = Vec::new();
    for i in 0..5 {
        let record = source.read(&cancel).await.unwrap();
        assert_eq!(record.payload(), format!("message-{i}").as_bytes());
        assert!(record.key().is_empty());
        assert!(record.created_at().is_none());
        positions.push(record.position().clone());
    }

    // acks may arrive out of order
    for position in positions.iter().rev() {
        source.ack(position).await.unwrap();
    }
    assert_eq!(broker.acknowledged(TOPIC, SUBSCRIPTION), 5);
    assert_eq!(source.metrics().records_read, 5);
}

#[tokio::test]
async fn test_configure_failure_keeps_state() {
    let mut source = SourceAdapter::new(MemoryBroker::new());
    let mut raw = params();
    raw.remove("subscriptionName");

    let err = source.configure(&raw).unwrap_err();
    assert!(matches!(
        err,
        SourceError::Config(ConfigError::MissingField {
            field: "subscriptionName"
        })
    ));
    assert_eq!(source.state(), State::Unconfigured);
    assert!(source.config().is_none());

    source.configure(&params()).unwrap();
    raw = params();
    raw.insert("subscriptionType".to_string(), "roundrobin".to_string());
    assert!(source.configure(&raw).is_err());
    assert_eq!(source.state(), State::Configured);
    assert_eq!(source.config().unwrap().topic(), TOPIC);
}

#[tokio::test]
async fn test_configure_can_be_replaced_before_open() {
    let mut source = SourceAdapter::new(MemoryBroker::new());
    source.configure(&params()).unwrap();

    let mut raw = params();
    raw.insert("topic".to_string(), "other".to_string());
    source.configure(&raw).unwrap();
    assert_eq!(source.config().unwrap().topic(), "other");
}

#[tokio::test]
async fn test_open_unreachable_broker_stays_configured() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    let mut source = SourceAdapter::new(broker.clone());
    source.configure(&params()).unwrap();
    let err = source.open(None).await.unwrap_err();

    assert!(matches!(err, SourceError::Connection { .. }));
    assert!(err.is_retryable());
    assert_eq!(source.state(), State::Configured);
    assert_eq!(broker.open_clients(), 0);

    broker.set_reachable(true);
    source.open(None).await.expect("Open should succeed once reachable");
    assert_eq!(source.state(), State::Open);
}

#[tokio::test]
async fn test_subscribe_failure_releases_client() {
    let broker = MemoryBroker::new();
    broker.fail_subscribe(true);

    let mut source = SourceAdapter::new(broker.clone());
    source.configure(&params()).unwrap();
    let err = source.open(None).await.unwrap_err();

    match err {
        SourceError::Subscription { topic, .. } => assert_eq!(topic, TOPIC),
        other => panic!("expected subscription error, got {other:?}"),
    }
    assert_eq!(source.state(), State::Configured);
    assert_eq!(broker.open_clients(), 0);
    source.teardown().await.unwrap();
}

#[tokio::test]
async fn test_open_ignores_resume_position() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, None, b"first", None);
    broker.publish(TOPIC, None, b"second", None);

    let mut source = SourceAdapter::new(broker.clone());
    source.configure(&params()).unwrap();
    let resume = Position::from(vec![0xde, 0xad]);
    source.open(Some(&resume)).await.unwrap();

    let record = source.read(&CancellationToken::new()).await.unwrap();
    assert_eq!(record.payload(), b"first");
}

#[tokio::test]
async fn test_operations_require_open() {
    let mut source = SourceAdapter::new(MemoryBroker::new());
    let cancel = CancellationToken::new();

    let err = source.open(None).await.unwrap_err();
    assert!(matches!(
        err,
        SourceError::InvalidState {
            operation: "open",
            state: State::Unconfigured
        }
    ));

    source.configure(&params()).unwrap();
    assert!(matches!(
        source.read(&cancel).await,
        Err(SourceError::InvalidState {
            operation: "read",
            ..
        })
    ));
    assert!(matches!(
        source.ack(&Position::from(vec![1])).await,
        Err(SourceError::InvalidState { operation: "ack", .. })
    ));
}

#[tokio::test]
async fn test_read_with_cancelled_token() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, None, b"pending", None);
    let mut source = open_source(&broker).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = source.read(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(source.metrics().records_read, 0);

    // the pending message was not consumed by the cancelled read
    let record = source.read(&CancellationToken::new()).await.unwrap();
    assert_eq!(record.payload(), b"pending");
}

#[tokio::test]
async fn test_read_blocks_until_cancelled() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), source.read(&cancel))
        .await
        .expect("read should return promptly after cancellation");
    assert!(matches!(result, Err(SourceError::Cancelled)));
}

#[tokio::test]
async fn test_read_wakes_on_publish() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.publish(TOPIC, None, b"late", None);
    });

    let record = tokio::time::timeout(
        Duration::from_secs(5),
        source.read(&CancellationToken::new()),
    )
    .await
    .expect("read should wake on publish")
    .unwrap();
    assert_eq!(record.payload(), b"late");
}

#[tokio::test]
async fn test_ack_invalidated_message_surfaces_broker_error() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, None, b"payload", None);
    let mut source = open_source(&broker).await;

    let record = source.read(&CancellationToken::new()).await.unwrap();
    broker.invalidate_unacked(TOPIC, SUBSCRIPTION);

    let err = source.ack(record.position()).await.unwrap_err();
    assert!(matches!(err, SourceError::Ack { .. }));
    assert!(err.is_retryable());
    assert!(err.source().unwrap().to_string().contains("no longer valid"));
    assert_eq!(source.metrics().ack_failures, 1);
    assert_eq!(broker.acknowledged(TOPIC, SUBSCRIPTION), 0);
}

#[tokio::test]
async fn test_ack_foreign_position() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;

    let err = source
        .ack(&Position::from(b"offset:42".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::InvalidPosition { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_teardown_without_open() {
    let mut source = SourceAdapter::new(MemoryBroker::new());
    source.teardown().await.unwrap();
    assert_eq!(source.state(), State::Closed);

    let mut source = SourceAdapter::new(MemoryBroker::new());
    source.configure(&params()).unwrap();
    source.teardown().await.unwrap();
    assert_eq!(source.state(), State::Closed);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;
    assert!(broker.has_subscription(TOPIC, SUBSCRIPTION));
    assert_eq!(broker.open_clients(), 1);

    source.teardown().await.unwrap();
    assert!(!broker.has_subscription(TOPIC, SUBSCRIPTION));
    assert_eq!(broker.open_clients(), 0);

    source.teardown().await.unwrap();
    assert_eq!(broker.open_clients(), 0);
    assert_eq!(source.state(), State::Closed);
}

#[tokio::test]
async fn test_teardown_releases_client_after_unsubscribe_failure() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;
    broker.fail_unsubscribe(true);

    let err = source.teardown().await.unwrap_err();
    assert!(matches!(err, SourceError::Teardown { .. }));
    assert_eq!(broker.open_clients(), 0);
    assert_eq!(source.state(), State::Closed);

    source.teardown().await.unwrap();
}

#[tokio::test]
async fn test_closed_source_rejects_operations() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;
    source.teardown().await.unwrap();

    assert!(matches!(
        source.configure(&params()),
        Err(SourceError::InvalidState {
            state: State::Closed,
            ..
        })
    ));
    assert!(matches!(
        source.read(&CancellationToken::new()).await,
        Err(SourceError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_subscription_cursor_survives_reopen() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, None, b"first", None);
    broker.publish(TOPIC, None, b"second", None);

    // a second adapter on the same shared subscription continues where the first stopped
    let mut raw = params();
    raw.insert("subscriptionType".to_string(), "shared".to_string());

    let mut first = SourceAdapter::new(broker.clone());
    first.configure(&raw).unwrap();
    first.open(None).await.unwrap();
    let record = first.read(&CancellationToken::new()).await.unwrap();
    first.ack(record.position()).await.unwrap();

    let mut second = SourceAdapter::new(broker.clone());
    second.configure(&raw).unwrap();
    second.open(None).await.unwrap();
    let record = second.read(&CancellationToken::new()).await.unwrap();
    assert_eq!(record.payload(), b"second");
}

#[tokio::test]
async fn test_read_after_stream_closed_is_fatal() {
    let broker = MemoryBroker::new();
    let mut source = open_source(&broker).await;
    broker.close_streams();

    let err = source.read(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SourceError::StreamClosed));
    assert!(!err.is_retryable());
    assert_eq!(source.state(), State::Open);

    source.teardown().await.unwrap();
    assert_eq!(broker.open_clients(), 0);
}
