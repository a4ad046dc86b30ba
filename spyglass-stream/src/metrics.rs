//! Prometheus counters for the consumer, registered against an explicit
//! registry owned by `main`.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub struct Metrics {
    pub frames_received: IntCounterVec,
    pub events_written: IntCounter,
    pub records_written: IntCounter,
    pub write_failures: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let frames_received = IntCounterVec::new(
            Opts::new("spyglass_frames_received_total", "Frames received from the relay."),
            &["kind"],
        )?;
        let events_written =
            IntCounter::new("spyglass_events_written_total", "Event rows written to the store.")?;
        let records_written =
            IntCounter::new("spyglass_records_written_total", "Record rows written to the store.")?;
        let write_failures =
            IntCounter::new("spyglass_write_failures_total", "Store writes that failed.")?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(events_written.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;

        Ok(Self { frames_received, events_written, records_written, write_failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).expect("first registration succeeds");
        metrics.frames_received.with_label_values(&["commit"]).inc();
        assert!(Metrics::new(&registry).is_err(), "double registration should fail");
    }
}
