use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::runtime::Runtime;

use crate::errors::{Error, Result};
use crate::metrics;
use crate::task::Task;

struct State {
    task: Arc<Task>,
}

/// Serve the introspection API for `task` until the runtime stops.
pub async fn run_webserver(task: Arc<Task>, port: u16) -> Result<()> {
    let shared_state = Arc::new(State { task });

    let app = Router::new()
        .route("/dataflow", get(get_dataflow))
        .route("/allocation", get(get_allocation))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting groupflow API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::Internal(format!("unable to run API server at port {port}: {err}")))
}

/// Start the API on its own runtime if `GROUPFLOW_API_ENABLED` is
/// set. Keep the returned runtime alive as long as the server should
/// run.
pub fn start_server_runtime(task: Arc<Task>) -> Result<Option<Runtime>> {
    if !api_enabled(std::env::var("GROUPFLOW_API_ENABLED").ok()) {
        return Ok(None);
    }
    let port = api_port(std::env::var("GROUPFLOW_API_PORT").ok())?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("groupflow-webserver")
        .worker_threads(2)
        .enable_all()
        .build()?;
    rt.spawn(async move {
        if let Err(err) = run_webserver(task, port).await {
            tracing::error!("{err}");
        }
    });
    Ok(Some(rt))
}

fn api_enabled(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::to_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}

fn api_port(raw: Option<String>) -> Result<u16> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("unable to parse GROUPFLOW_API_PORT={raw}"))),
        None => Ok(3030),
    }
}

async fn get_dataflow(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    Json(state.task.describe())
}

async fn get_allocation(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    let scheduler = state.task.scheduler();
    Json(json!({
        "worker": state.task.worker_id().to_string(),
        "load": scheduler.load(),
        "isolated": scheduler.isolated_count(),
        "processors": scheduler.summary(),
    }))
}

async fn get_metrics() -> Response {
    match metrics::render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::task::Submission;
    use crate::testing::*;

    fn state() -> Extension<Arc<State>> {
        let (factory, _feeds, _outputs) = factory();
        let config = EngineConfig {
            num_processors: 1,
            rebalance_period_ms: 0,
            isolation_period_ms: 0,
            ..Default::default()
        };
        let task = Task::new("w".into(), config, factory, None).unwrap();
        assert!(
            task.create(Submission {
                query_id: "q".into(),
                tenant_id: "t".into(),
                group_id: None,
                dag: linear("f", &[1], "out"),
                jar_paths: vec![],
            })
            .success
        );
        Extension(Arc::new(State { task }))
    }

    #[tokio::test]
    async fn dataflow_lists_groups() {
        let state = state();
        let body = state.task.describe();
        assert!(body.get("t").is_some(), "{body}");
        let resp = get_dataflow(state).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn allocation_reports_every_processor() {
        let state = state();
        let summaries = state.task.scheduler().summary();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].groups.len(), 1);
        let resp = get_allocation(state).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_render() {
        let resp = get_metrics().await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn env_flags_parse() {
        assert!(!api_enabled(None));
        assert!(api_enabled(Some("TRUE".into())));
        assert!(!api_enabled(Some("0".into())));
        assert_eq!(api_port(None).unwrap(), 3030);
        assert_eq!(api_port(Some("8080".into())).unwrap(), 8080);
        assert!(matches!(api_port(Some("x".into())), Err(Error::Config(_))));
    }
}
