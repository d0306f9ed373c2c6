//! Agent metrics
//!
//! Counters live in a registry owned by [`Metrics`] and are handed to the
//! components that record them; `main` serves the registry in the
//! Prometheus text format.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "smart_drive_agent";

/// Prometheus counters for the agent
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Block uevents received, by action
    pub uevents: IntCounterVec,
    /// Drive matcher outcomes
    pub matches: IntCounterVec,
    /// Device initializations, by result
    pub init_devices: IntCounterVec,
    /// Controller events delivered, by controller and event type
    pub controller_events: IntCounterVec,
    /// Failed handler invocations, by controller
    pub handler_failures: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| Error::Internal(format!("failed to register {}: {}", name, e)))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            uevents: counter(&registry, "uevents_total", "Block device uevents received", &["action"])?,
            matches: counter(&registry, "drive_matches_total", "Drive matcher outcomes", &["result"])?,
            init_devices: counter(
                &registry,
                "init_devices_total",
                "Device initializations by result",
                &["result"],
            )?,
            controller_events: counter(
                &registry,
                "controller_events_total",
                "Events delivered to handlers",
                &["controller", "event"],
            )?,
            handler_failures: counter(
                &registry,
                "handler_failures_total",
                "Failed handler invocations",
                &["controller"],
            )?,
            registry,
        })
    }

    /// Text exposition of every metric, with its content type
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.uevents.with_label_values(&["add"]).inc();
        metrics.matches.with_label_values(&["no-match"]).inc_by(2);

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("smart_drive_agent_uevents_total{action=\"add\"} 1"));
        assert!(body.contains("smart_drive_agent_drive_matches_total{result=\"no-match\"} 2"));
    }
}
