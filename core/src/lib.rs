pub mod config;
pub mod connector;
pub mod errors;
pub mod source;
pub mod telemetry;

pub use config::{ConnectionConfig, RawParams, SubscriptionMode};
pub use connector::{new_source, specification};
pub use errors::{ConfigError, SourceError};
pub use source::{Position, Record, SourceAdapter, State};
