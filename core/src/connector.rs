use serde::Serialize;

use crate::source::SourceAdapter;
use crate::source::pulsar::PulsarBroker;

/// Descriptor the host shows for this plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Specification {
    pub name: &'static str,
    pub summary: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub author: &'static str,
}

pub fn specification() -> Specification {
    Specification {
        name: "pulsar",
        summary: "An Apache Pulsar source plugin.",
        description: "Subscribes to an Apache Pulsar topic and emits each message as a record, \
                      acknowledging it once the host confirms the record's position.",
        version: env!("CARGO_PKG_VERSION"),
        author: "Ali Hamidi",
    }
}

/// A fresh, unconfigured Pulsar source.
pub fn new_source() -> SourceAdapter<PulsarBroker> {
    SourceAdapter::new(PulsarBroker)
}
