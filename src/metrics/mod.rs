use opentelemetry::{
    global,
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
};
use prometheus::{default_registry, Encoder, TextEncoder};

use std::sync::Mutex;

use crate::errors::{Error, Result};

static INITIALIZED: Mutex<bool> = Mutex::new(false);

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Instruments created before this call are no-ops, so call it
/// before starting any [`crate::task::Task`]. Calling it again is a
/// no-op.
pub fn initialize_metrics() -> Result<()> {
    let mut initialized = crate::lock!(INITIALIZED);
    if *initialized {
        return Ok(());
    }
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("groupflow")
        .build()
        .map_err(|err| Error::Telemetry(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| Error::Telemetry(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    *initialized = true;
    Ok(())
}

/// Everything in the default registry, in the Prometheus text format.
pub fn render() -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| Error::Telemetry(err.to_string()))?;
    String::from_utf8(buf).map_err(|err| Error::Telemetry(err.to_string()))
}

#[test]
fn exported_metrics_are_namespaced() {
    initialize_metrics().unwrap();
    initialize_metrics().unwrap();
    let meter = global::meter("groupflow");
    let counter = meter.u64_counter("render_test_count").init();
    counter.add(3, &[]);
    let text = render().unwrap();
    assert!(text.contains("groupflow_render_test_count"), "{text}");
}
