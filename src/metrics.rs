//! Prometheus counters for the message pipeline.

use crate::core::worker::PipelineEvent;
use crate::error::{CourierError, CourierResult};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Pipeline counters, incremented by the workers.
#[derive(Clone)]
pub struct CourierMetrics {
    registry: Registry,
    messages_received: IntCounter,
    messages_failed: IntCounter,
    messages_aborted: IntCounter,
    messages_acknowledged: IntCounter,
    results_postprocessed: IntCounter,
}

impl CourierMetrics {
    /// Create the counters and register them in `registry`.
    pub fn new(registry: &Registry) -> CourierResult<Self> {
        let metrics = Self {
            registry: registry.clone(),
            messages_received: counter(
                "courier_messages_received_total",
                "Messages taken from the work queue",
            )?,
            messages_failed: counter(
                "courier_messages_failed_total",
                "Messages whose preprocessing or processing failed",
            )?,
            messages_aborted: counter(
                "courier_messages_aborted_total",
                "Messages whose processing was aborted",
            )?,
            messages_acknowledged: counter(
                "courier_messages_acknowledged_total",
                "Messages acknowledged",
            )?,
            results_postprocessed: counter(
                "courier_results_postprocessed_total",
                "Results that completed postprocessing",
            )?,
        };

        for collector in [
            &metrics.messages_received,
            &metrics.messages_failed,
            &metrics.messages_aborted,
            &metrics.messages_acknowledged,
            &metrics.results_postprocessed,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| CourierError::config(format!("failed to register metric: {e}")))?;
        }

        Ok(metrics)
    }

    /// Count a pipeline event.
    pub fn record(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Received => self.messages_received.inc(),
            PipelineEvent::Failed => self.messages_failed.inc(),
            PipelineEvent::Aborted => self.messages_aborted.inc(),
            PipelineEvent::Acknowledged => self.messages_acknowledged.inc(),
            PipelineEvent::Postprocessed => self.results_postprocessed.inc(),
        }
    }

    /// Get metrics as Prometheus format
    pub fn render(&self) -> CourierResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| CourierError::config(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| CourierError::config(format!("metrics are not valid UTF-8: {e}")))
    }
}

fn counter(name: &str, help: &str) -> CourierResult<IntCounter> {
    IntCounter::new(name, help)
        .map_err(|e| CourierError::config(format!("invalid metric {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let registry = Registry::new();
        let metrics = CourierMetrics::new(&registry).unwrap();
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::Acknowledged);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("courier_messages_received_total 2"));
        assert!(rendered.contains("courier_messages_acknowledged_total 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        CourierMetrics::new(&registry).unwrap();
        assert!(CourierMetrics::new(&registry).is_err());
    }
}
