//! OpenTelemetry metrics export.
//!
//! Exports are off unless an OTLP endpoint is configured, either as
//! `otel_exporter_otlp_endpoint` in the settings or through the standard
//! `OTEL_EXPORTER_OTLP_ENDPOINT` variable. All `record_*` helpers are no-ops
//! while exports are off.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<ExecMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Installed probes by entry point, read by the `active_probes` gauge.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Counter names carry no `_total` suffix; Prometheus adds it.
pub struct ExecMetrics {
    pub exec_events: Counter<u64>,
    pub dropped_events: Counter<u64>,
}

impl ExecMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            exec_events: meter
                .u64_counter("exec_events")
                .with_description("Number of process executions observed")
                .with_unit("events")
                .build(),
            dropped_events: meter
                .u64_counter("dropped_events")
                .with_description("Exec events dropped because the ring was full")
                .with_unit("events")
                .build(),
        }
    }
}

/// Settings value first, then `OTEL_EXPORTER_OTLP_ENDPOINT`. A bare
/// `host:port` gets an `http://` scheme.
fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = match configured {
        Some(ep) if !ep.is_empty() => ep.to_string(),
        _ => std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?,
    };
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Sets up the OTLP/gRPC metrics pipeline. Must run inside the tokio runtime.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let Some(endpoint) = get_otlp_endpoint(configured_endpoint) else {
        info!("No OTLP endpoint configured. Metrics export disabled.");
        return Ok(());
    };

    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "execmon"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("execmon");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of installed exec probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (entry, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("entry_point", entry.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(ExecMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized");
    Ok(())
}

pub fn metrics() -> Option<&'static ExecMetrics> {
    METRICS.get()
}

pub fn record_exec_event() {
    if let Some(m) = metrics() {
        m.exec_events.add(1, &[]);
    }
}

pub fn record_dropped_events(count: u64) {
    if let Some(m) = metrics() {
        m.dropped_events.add(count, &[]);
    }
}

pub fn record_active_probe(entry_point: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(entry_point.to_string(), count);
    }
}

pub fn active_probe_count(entry_point: &str) -> Option<u64> {
    active_probes_map().read().ok()?.get(entry_point).copied()
}

/// Flushes pending metrics and shuts the provider down.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn endpoint_absent() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint(None).is_none());
        assert!(get_otlp_endpoint(Some("")).is_none());
    }

    #[test]
    #[serial]
    fn endpoint_from_env_gets_scheme() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317") };
        assert_eq!(
            get_otlp_endpoint(None),
            Some("http://collector:4317".to_string())
        );
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn configured_endpoint_wins() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://env:4317") };
        assert_eq!(
            get_otlp_endpoint(Some("https://configured:4317")),
            Some("https://configured:4317".to_string())
        );
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    fn recording_without_exporter_is_a_no_op() {
        record_exec_event();
        record_dropped_events(3);
        record_active_probe("kprobe:telemetry_test", 1);
        assert_eq!(active_probe_count("kprobe:telemetry_test"), Some(1));
    }
}
