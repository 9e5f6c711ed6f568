use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use super::TracerBuilder;
use crate::errors::Error;
use crate::errors::Result;

/// Send traces to the opentelemetry collector:
/// https://opentelemetry.io/docs/collector/
///
/// Only supports GRPC protocol, so make sure to enable
/// it on your OTEL configuration.
#[derive(Debug, Clone)]
pub struct OtlpTracingConfig {
    /// Service name, identifies this worker.
    pub service_name: String,
    /// Optional collector's URL, defaults to `grpc:://127.0.0.1:4317`
    pub url: Option<String>,
    /// Sampling ratio:
    ///   samplig_ratio >= 1 - all traces are sampled
    ///   samplig_ratio <= 0 - most traces are not sampled
    pub sampling_ratio: f64,
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            sampling_ratio: 1.0,
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer> {
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();

        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| Error::Telemetry(format!("error installing tracer: {err}")))
    }
}
