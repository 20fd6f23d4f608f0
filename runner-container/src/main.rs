use std::time::Duration;

use anyhow::{Context, Result};
use source_core::config::load_params;
use source_core::errors::SourceError;
use source_core::telemetry::init_tracing;
use source_core::{new_source, specification};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// This is the entry point for running the source as a long-running container
/// process (EKS, ECS, etc.). It plays the role of the pipeline host.
///
/// What it does at a high-level:
///     Load parameters from the file given as first argument, or from SOURCE_PARAMS.
///     Main loop runs until a shutdown signal is received:
///         - read the next record from the subscription
///         - acknowledge it once it has been emitted
///     Tear the source down on the way out.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let spec = specification();
    info!("Starting {} source {}", spec.name, spec.version);

    let path = std::env::args().nth(1);
    let params = load_params(path.as_deref()).context("Failed to load source parameters")?;

    let mut source = new_source();
    source.configure(&params)?;
    source.open(None).await.context("Failed to open source")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let outcome = loop {
        let record = match source.read(&shutdown).await {
            Ok(record) => record,
            Err(SourceError::Cancelled) => break Ok(()),
            Err(e) if e.is_retryable() => {
                warn!("A transient error occurred, will retry: {:?}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
            Err(e) => break Err(e),
        };

        info!(
            "record topic={} key_len={} payload_len={} metadata={}",
            record.topic().unwrap_or_default(),
            record.key().len(),
            record.payload().len(),
            serde_json::to_string(record.metadata()).unwrap_or_default()
        );

        if let Err(e) = source.ack(record.position()).await {
            // unacked records are redelivered by the broker
            warn!("Failed to acknowledge record: {:?}", e);
        }
    };

    info!(
        "Processed {} records ({} acknowledged)",
        source.metrics().records_read,
        source.metrics().acks
    );

    if let Err(e) = source.teardown().await {
        error!("Teardown did not complete cleanly: {:?}", e);
    }

    outcome.map_err(anyhow::Error::from)
}
