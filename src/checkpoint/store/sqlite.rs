//! SQLite-backed checkpoints.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::CheckpointStore;
use crate::checkpoint::GroupCheckpoint;
use crate::common::GroupId;
use crate::errors::Error;
use crate::errors::Result;
use crate::lock;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE tenants ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             tenant_id TEXT NOT NULL PRIMARY KEY \
             ) STRICT",
        ),
        // The record is the JSON form of a `GroupCheckpoint`;
        // the other columns are for looking around with the
        // sqlite shell.
        M::up(
            "CREATE TABLE checkpoints ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             group_id TEXT NOT NULL PRIMARY KEY, \
             tenant_id TEXT NOT NULL REFERENCES tenants (tenant_id) ON DELETE CASCADE, \
             checkpointed_at TEXT NOT NULL, \
             query_count INTEGER NOT NULL CHECK (query_count >= 0), \
             record TEXT NOT NULL \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &GroupCheckpoint) -> Result<()> {
        let record = serde_json::to_string(checkpoint)?;
        let mut conn = lock!(self.conn);
        let txn = conn.transaction()?;
        tracing::trace!("Writing checkpoint of group {}", checkpoint.group_id);
        txn.execute(
            "INSERT INTO tenants (tenant_id) VALUES (?1) \
             ON CONFLICT (tenant_id) DO NOTHING",
            (&checkpoint.tenant_id.0,),
        )?;
        txn.execute(
            "INSERT INTO checkpoints (group_id, tenant_id, checkpointed_at, query_count, record) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (group_id) DO UPDATE \
             SET tenant_id = EXCLUDED.tenant_id, \
             checkpointed_at = EXCLUDED.checkpointed_at, \
             query_count = EXCLUDED.query_count, \
             record = EXCLUDED.record",
            (
                &checkpoint.group_id.0,
                &checkpoint.tenant_id.0,
                checkpoint.created_at.to_rfc3339(),
                checkpoint.queries.len() as i64,
                record,
            ),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn load(&self, group: &GroupId) -> Result<Option<GroupCheckpoint>> {
        let conn = lock!(self.conn);
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM checkpoints WHERE group_id = ?1",
                (&group.0,),
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|record| serde_json::from_str(&record).map_err(Error::from))
            .transpose()
    }

    fn delete(&self, group: &GroupId) -> Result<bool> {
        let conn = lock!(self.conn);
        let deleted = conn.execute("DELETE FROM checkpoints WHERE group_id = ?1", (&group.0,))?;
        Ok(deleted > 0)
    }

    fn groups(&self) -> Result<Vec<GroupId>> {
        let conn = lock!(self.conn);
        let mut stmt = conn.prepare("SELECT group_id FROM checkpoints ORDER BY group_id")?;
        let groups = stmt
            .query_map((), |row| Ok(GroupId(row.get(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::QueryCheckpoint;
    use crate::common::QueryId;
    use crate::dag::ConfigVertexId;
    use crate::operators::OperatorState;
    use crate::operators::StateBytes;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(group: &str, ts: u64) -> GroupCheckpoint {
        let mut states = BTreeMap::new();
        states.insert(
            ConfigVertexId(1),
            vec![OperatorState {
                index: 0,
                timestamp: ts,
                state: StateBytes::ser(&json!({ "seen": ts })).unwrap(),
            }],
        );
        let mut queries = BTreeMap::new();
        queries.insert(
            QueryId::from("q"),
            QueryCheckpoint {
                dag: crate::testing::linear("f", &[1], "out"),
                states,
            },
        );
        GroupCheckpoint {
            group_id: group.into(),
            tenant_id: "t".into(),
            min_timestamp: ts,
            load: 0.25,
            created_at: chrono::Utc::now(),
            queries,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.sqlite3");
        let saved = record("g", 7);
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&saved).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load(&"g".into()).unwrap(), Some(saved));
        assert_eq!(store.groups().unwrap(), vec![GroupId::from("g")]);
    }

    #[test]
    fn newer_checkpoint_replaces_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("db")).unwrap();
        store.save(&record("g", 1)).unwrap();
        store.save(&record("g", 2)).unwrap();
        assert_eq!(store.load(&"g".into()).unwrap().unwrap().min_timestamp, 2);
        assert_eq!(store.groups().unwrap().len(), 1);
    }

    #[test]
    fn delete_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("db")).unwrap();
        store.save(&record("g", 1)).unwrap();
        assert!(store.delete(&"g".into()).unwrap());
        assert!(!store.delete(&"g".into()).unwrap());
        assert_eq!(store.load(&"g".into()).unwrap(), None);
    }
}
