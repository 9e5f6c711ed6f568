//! Identifiers shared across the engine.

use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// Unique ID of a submitted query.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub String);

/// Unique ID of a group.
///
/// Groups are the unit of scheduling, checkpointing and recovery, so
/// this is what most of the engine keys off of.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

/// The tenant (application) owning one or more groups.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// A worker node as known by the master.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

/// An event processor inside one worker.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId(pub usize);

/// A physical vertex inside a group's execution DAGs.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub u64);

/// An execution DAG inside a group.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DagId(pub u64);

macro_rules! display_inner {
    ($($t:ty),*) => {
        $(
            impl Display for $t {
                fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
                    write!(fmt, "{}", self.0)
                }
            }
        )*
    };
}

display_inner!(QueryId, GroupId, TenantId, WorkerId, ProcessorId, VertexId, DagId);

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[test]
fn ids_serialize_as_newtypes() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &GroupId("g1".to_owned()),
        &[
            Token::NewtypeStruct { name: "GroupId" },
            Token::Str("g1"),
        ],
    );
    assert_tokens(
        &VertexId(3),
        &[Token::NewtypeStruct { name: "VertexId" }, Token::U64(3)],
    );
}

#[test]
fn ids_display_inner_value() {
    assert_eq!(QueryId::from("q-1").to_string(), "q-1");
    assert_eq!(ProcessorId(4).to_string(), "4");
}
