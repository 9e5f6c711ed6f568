use opentelemetry::{
    runtime::Tokio,
    sdk::trace::{config, Sampler, Tracer},
};

use super::TracerBuilder;
use crate::errors::{Error, Result};

/// Configure tracing to send traces to a Jaeger instance.
///
/// The endpoint can be configured with the parameter passed to this config,
/// or with two environment variables:
///
///   OTEL_EXPORTER_JAEGER_AGENT_HOST="127.0.0.1"
///   OTEL_EXPORTER_JAEGER_AGENT_PORT="6831"
///
/// By default the endpoint is set to "127.0.0.1:6831".
///
/// If the environment variables are set, the endpoint is changed to that.
///
/// If `endpoint` is set, it takes precedence over env vars.
#[derive(Debug, Clone)]
pub struct JaegerConfig {
    /// Service name, identifies this worker.
    pub service_name: String,
    /// Optional Jaeger's URL
    pub endpoint: Option<String>,
    /// Sampling ratio:
    ///   samplig_ratio >= 1 - all traces are sampled
    ///   samplig_ratio <= 0 - most traces are not sampled
    pub sampling_ratio: Option<f64>,
}

impl TracerBuilder for JaegerConfig {
    fn build(&self) -> Result<Tracer> {
        opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        let mut tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_trace_config(config().with_sampler(Sampler::TraceIdRatioBased(
                self.sampling_ratio.unwrap_or(1.0),
            )))
            .with_service_name(self.service_name.clone());

        // Overwrite the endpoint if needed
        if let Some(endpoint) = self.endpoint.as_ref() {
            tracer = tracer.with_endpoint(endpoint);
        }

        tracer
            .install_batch(Tokio)
            .map_err(|err| Error::Telemetry(format!("error installing jaeger tracer: {err}")))
    }
}
