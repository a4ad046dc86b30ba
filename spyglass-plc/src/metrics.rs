//! Prometheus counters for the mirror.

use prometheus::{IntCounter, Registry};

pub struct Metrics {
    pub pages_fetched: IntCounter,
    pub ops_ingested: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pages_fetched = IntCounter::new(
            "plc_mirror_pages_fetched_total",
            "Export pages fetched from the directory.",
        )?;
        let ops_ingested =
            IntCounter::new("plc_mirror_ops_ingested_total", "Operations written to the store.")?;

        registry.register(Box::new(pages_fetched.clone()))?;
        registry.register(Box::new(ops_ingested.clone()))?;

        Ok(Self { pages_fetched, ops_ingested })
    }
}
