//! Internal code for tracing/logging.
//!
//! This module is used to configure both tracing and logging.
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Tracing can be configured by the user, by default it is disabled.
//!
//! Each tracing backend has to implement the `TracerBuilder` trait, which
//! requires a `build` function returning the backend's tracer.
use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, Layer, Registry};

use crate::errors::{Error, Result};

pub mod jaeger_tracing;
pub mod otlp_tracing;

pub use jaeger_tracing::JaegerConfig;
pub use otlp_tracing::OtlpTracingConfig;

/// Where traces emitted by groupflow go.
#[derive(Debug, Clone)]
pub enum TracingConfig {
    Otlp(OtlpTracingConfig),
    Jaeger(JaegerConfig),
}

impl TracingConfig {
    fn builder(&self) -> &dyn TracerBuilder {
        match self {
            Self::Otlp(conf) => conf,
            Self::Jaeger(conf) => conf,
        }
    }
}

/// Trait that all the tracing config should implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> Result<Tracer>;
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct itself.
pub struct GroupflowTracer {
    rt: tokio::runtime::Runtime,
}

fn get_log_level(level: Option<&str>) -> Result<LevelFilter> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(Error::Config(format!("wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

impl GroupflowTracer {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .thread_name("groupflow-tracing")
            .enable_all()
            .build()?;
        Ok(Self { rt })
    }

    /// Call this with a [`TracingConfig`] to configure tracing.
    /// Returns a guard that you have to keep in scope for the
    /// whole execution of the code you want to trace.
    pub fn setup(
        &self,
        conf: Option<TracingConfig>,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>> {
        let guard = self.rt.enter();

        let log_level = get_log_level(log_level)?;

        // We need an async block to properly initialize the tracing runtime.
        let initializer = async move {
            // Prepare the log layer
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                // Show source file
                .with_file(true)
                // Display source code line numbers
                .with_line_number(true)
                // Display the thread ID an event was recorded on
                .with_thread_ids(true)
                .with_filter(Targets::new().with_target("groupflow", log_level));

            // If the conf was not none, setup the global subscriber with both log and
            // telemetry layer, otherwise just setup logging.
            if let Some(conf) = conf {
                let tracer = conf.builder().build()?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    // Send all traces from groupflow
                    .with_filter(Targets::new().with_target("groupflow", LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            } else {
                set_global_subscriber(Registry::default().with(logs));
            };
            Ok::<(), Error>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| Error::Telemetry(err.to_string()))??;
        Ok(guard)
    }
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // when several workers share a process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(get_log_level(Some("loud")), Err(Error::Config(_))));
}
