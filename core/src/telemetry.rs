use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "source_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMetrics {
    pub records_read: usize,
    pub bytes_read: u64,
    pub receive_errors: usize,
    pub acks: usize,
    pub ack_failures: usize,
}

impl SourceMetrics {
    pub(crate) fn record_read(&mut self, payload_len: usize) {
        self.records_read += 1;
        self.bytes_read += payload_len as u64;
    }

    /// Records delivered but not yet acknowledged, as seen by this adapter.
    pub fn in_flight(&self) -> usize {
        self.records_read.saturating_sub(self.acks)
    }
}
