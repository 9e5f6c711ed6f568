use std::panic::Location;
use std::time::Duration;

use crate::common::{GroupId, QueryId, TenantId, WorkerId};

/// Everything that can go wrong inside the engine.
///
/// Submission-level problems are turned into a
/// [`crate::task::SubmissionResult`] at the edge of the engine; the
/// rest are logged by whichever sweep or thread hit them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid query dag: {0}")]
    InvalidDag(String),
    #[error("unknown operator kind `{0}`")]
    UnknownOperator(String),
    #[error("unknown connector kind `{0}`")]
    UnknownConnector(String),
    #[error("query {0} already exists")]
    DuplicateQuery(QueryId),
    #[error("query {0} not found")]
    QueryNotFound(QueryId),
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("group {group} belongs to tenant {owner}")]
    ForeignGroup { group: GroupId, owner: TenantId },
    #[error("operator failed: {0}")]
    Operator(String),
    #[error("connector failed: {0}")]
    Connector(String),
    #[error("processor limit of {0} reached")]
    ProcessorLimit(usize),
    #[error("remote call to worker {worker} failed: {reason}")]
    Remote { worker: WorkerId, reason: String },
    #[error("no worker accepted the recovery request")]
    NoRecoveryTarget,
    #[error("not enough capacity to place {} group(s)", .0.len())]
    InsufficientCapacity(Vec<GroupId>),
    #[error("recovery was interrupted")]
    RecoveryInterrupted,
    #[error("recovery did not finish within {0:?}")]
    RecoveryTimeout(Duration),
    #[error("state (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Use this function to create an internal error with location
/// tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> Error {
    let caller = Location::caller();
    Error::Internal(prepend_caller(caller, msg))
}

/// Shared bookkeeping was found corrupted.
///
/// There is no way to continue safely, so log the message on the
/// current thread and bring it down.
#[track_caller]
pub(crate) fn invariant_violation(msg: &str) -> ! {
    let caller = Location::caller();
    let msg = prepend_tname(prepend_caller(caller, msg));
    tracing::error!("invariant violated: {msg}");
    panic!("invariant violated: {msg}");
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn tracked_err_includes_location() {
    let err = tracked_err("boom");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("boom"));
}

#[test]
fn prepend_tname_prefixes_each_line() {
    let out = std::thread::Builder::new()
        .name("worker-7".to_owned())
        .spawn(|| prepend_tname("a\nb".to_owned()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<worker-7> a\n<worker-7> b\n");
}
