//! Running a worker with its telemetry attached.
//!
//! [`run`] is what an embedding process calls: it sets up metrics and
//! logging, starts the [`Task`], serves the introspection API when
//! `GROUPFLOW_API_ENABLED` is set, and tears everything down once the
//! caller is done with the worker.

use std::sync::Arc;

use crate::common::WorkerId;
use crate::config::EngineConfig;
use crate::dag::VertexFactory;
use crate::errors::Result;
use crate::metrics::initialize_metrics;
use crate::recovery::MasterClient;
use crate::task::Task;
use crate::tracing::GroupflowTracer;
use crate::tracing::TracingConfig;
use crate::webserver::start_server_runtime;

/// Process level settings that are not part of [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Where to send traces. `None` only logs to stdout.
    pub tracing: Option<TracingConfig>,
    /// Log level for stdout, defaults to "error".
    pub log_level: Option<String>,
}

/// Start a worker, hand it to `body` and close it when `body` returns.
///
/// The tracer and the API server live exactly as long as the worker.
pub fn run<R>(
    worker: WorkerId,
    config: EngineConfig,
    factory: VertexFactory,
    master: Option<Arc<dyn MasterClient>>,
    options: RunOptions,
    body: impl FnOnce(&Arc<Task>) -> R,
) -> Result<R> {
    initialize_metrics()?;
    let tracer = GroupflowTracer::new()?;
    let _guard = tracer.setup(options.tracing, options.log_level.as_deref())?;

    tracing::info!("Running worker {worker}");
    let task = Task::new(worker, config, factory, master)?;
    let server_rt = start_server_runtime(task.clone())?;

    let res = body(&task);

    if let Some(rt) = server_rt {
        rt.shutdown_background();
    }
    task.close();
    tracing::info!("Worker {} stopped", task.worker_id());
    Ok(res)
}
