//! SQLite-backed operation log.
//!
//! Persists the four tables the sync server needs: `documents`,
//! `operations`, `snapshots` and `client_sessions`. JSON columns hold the
//! serde representation of states, clocks and operations. The
//! `UNIQUE(document_id, site_id, counter)` constraint on `operations` is the
//! physical guarantee that a replayed operation is stored once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::path::Path;
use tracing::debug;

use super::{AppendOutcome, OperationLog, Snapshot};
use crate::crdt::{DocumentState, Operation, VectorClock};
use crate::error::{CrdtError, Result};
use crate::session::ClientSession;

/// SQLite-backed operation log.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex`; document actors write through it
/// from blocking tasks.
pub struct SqliteLog {
    conn: Mutex<Connection>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| CrdtError::InvalidOperation(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteLog {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// Create an in-memory database for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            -- applied = total of vector_clock; the row never moves backwards
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                crdt_state TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                applied INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- seq preserves arrival order, which is a valid causal order
            CREATE TABLE IF NOT EXISTS operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                counter INTEGER NOT NULL,
                operation_type TEXT NOT NULL,
                operation_data TEXT NOT NULL,
                UNIQUE(document_id, site_id, counter)
            );

            CREATE INDEX IF NOT EXISTS idx_operations_doc_seq
                ON operations(document_id, seq);

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                operation_count INTEGER NOT NULL,
                crdt_state TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_doc_count
                ON snapshots(document_id, operation_count);

            CREATE TABLE IF NOT EXISTS client_sessions (
                document_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                connected INTEGER NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (document_id, site_id)
            );
            "#,
        )?;
        Ok(())
    }
}

impl OperationLog for SqliteLog {
    fn append(&self, document_id: &str, op: &Operation) -> Result<AppendOutcome> {
        let data = serde_json::to_string(op)?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO operations (document_id, site_id, counter, operation_type, operation_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                document_id,
                op.site_id(),
                op.counter() as i64,
                op.op_type().as_str(),
                data
            ],
        );
        match inserted {
            Ok(_) => Ok(AppendOutcome::Appended),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                debug!("{}", CrdtError::ReplayConflict(op.id().clone()));
                Ok(AppendOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn operations_after(&self, document_id: &str, clock: &VectorClock) -> Result<Vec<Operation>> {
        // The clock is passed as its JSON object and read with json_each, so
        // covered rows never leave SQLite
        let clock = serde_json::to_string(clock)?;
        let rows: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT o.operation_data FROM operations o
                 WHERE o.document_id = ?1
                   AND o.counter > COALESCE(
                       (SELECT c.value FROM json_each(?2) c WHERE c.key = o.site_id), 0)
                 ORDER BY o.seq ASC",
            )?;
            let rows = stmt
                .query_map(params![document_id, clock], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.iter()
            .map(|data| Ok(serde_json::from_str(data)?))
            .collect()
    }

    fn operation_count(&self, document_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let state = serde_json::to_string(&snapshot.crdt_state)?;
        let clock = serde_json::to_string(&snapshot.vector_clock)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshots (document_id, operation_count, crdt_state, vector_clock, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.document_id,
                snapshot.operation_count as i64,
                state,
                clock,
                snapshot.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn latest_snapshot(
        &self,
        document_id: &str,
        max_operation_count: Option<u64>,
    ) -> Result<Option<Snapshot>> {
        let max = max_operation_count.map(|n| n as i64).unwrap_or(i64::MAX);
        let row: Option<(i64, String, String, String)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT operation_count, crdt_state, vector_clock, created_at FROM snapshots
                 WHERE document_id = ?1 AND operation_count <= ?2
                 ORDER BY operation_count DESC, id DESC LIMIT 1",
                params![document_id, max],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
        };

        row.map(|(count, state, clock, created_at)| {
            Ok(Snapshot {
                document_id: document_id.to_string(),
                operation_count: count as u64,
                crdt_state: serde_json::from_str(&state)?,
                vector_clock: serde_json::from_str(&clock)?,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    fn save_document(&self, document_id: &str, state: &DocumentState) -> Result<()> {
        let crdt_state = serde_json::to_string(state)?;
        let clock = serde_json::to_string(&state.vector_clock)?;
        let applied = state.vector_clock.total() as i64;
        let conn = self.conn.lock();
        let written = conn.execute(
            "INSERT INTO documents (id, crdt_state, vector_clock, applied, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                crdt_state = excluded.crdt_state,
                vector_clock = excluded.vector_clock,
                applied = excluded.applied,
                updated_at = excluded.updated_at
             WHERE excluded.applied >= documents.applied",
            params![document_id, crdt_state, clock, applied, Utc::now().to_rfc3339()],
        )?;
        if written == 0 {
            debug!("Kept newer stored state of {}", document_id);
        }
        Ok(())
    }

    fn load_document(&self, document_id: &str) -> Result<Option<DocumentState>> {
        let raw: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT crdt_state FROM documents WHERE id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()?
        };
        raw.map(|state| Ok(serde_json::from_str(&state)?)).transpose()
    }

    fn list_documents(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM documents
             UNION SELECT DISTINCT document_id FROM operations
             ORDER BY 1",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn save_session(&self, session: &ClientSession) -> Result<()> {
        let clock = serde_json::to_string(&session.vector_clock)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO client_sessions (document_id, site_id, vector_clock, connected, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(document_id, site_id) DO UPDATE SET
                vector_clock = excluded.vector_clock,
                connected = excluded.connected,
                last_seen = excluded.last_seen",
            params![
                session.document_id,
                session.site_id,
                clock,
                session.connected,
                session.last_seen.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn load_sessions(&self, document_id: &str) -> Result<Vec<ClientSession>> {
        let rows: Vec<(String, String, bool, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT site_id, vector_clock, connected, last_seen FROM client_sessions
                 WHERE document_id = ?1 ORDER BY site_id",
            )?;
            let rows = stmt
                .query_map(params![document_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(site_id, clock, connected, last_seen)| {
                Ok(ClientSession {
                    site_id,
                    document_id: document_id.to_string(),
                    vector_clock: serde_json::from_str(&clock)?,
                    connected,
                    last_seen: parse_time(&last_seen)?,
                })
            })
            .collect()
    }

    fn delete_session(&self, document_id: &str, site_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM client_sessions WHERE document_id = ?1 AND site_id = ?2",
            params![document_id, site_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Document, NodeId};

    #[test]
    fn test_unique_constraint_reports_duplicate() {
        let log = SqliteLog::in_memory().unwrap();
        let op = Operation::insert(NodeId::new("a", 1), None, 'x');

        assert_eq!(log.append("doc", &op).unwrap(), AppendOutcome::Appended);
        assert_eq!(log.append("doc", &op).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.operation_count("doc").unwrap(), 1);
    }

    #[test]
    fn test_operations_come_back_in_arrival_order() {
        let log = SqliteLog::in_memory().unwrap();
        let ops = vec![
            Operation::insert(NodeId::new("b", 1), None, 'b'),
            Operation::insert(NodeId::new("a", 1), Some(NodeId::new("b", 1)), 'a'),
            Operation::delete(NodeId::new("b", 2), NodeId::new("a", 1)),
        ];
        for op in &ops {
            log.append("doc", op).unwrap();
        }

        assert_eq!(log.operations_after("doc", &VectorClock::new()).unwrap(), ops);

        let mut clock = VectorClock::new();
        clock.observe("b", 1);
        let rest = log.operations_after("doc", &clock).unwrap();
        assert_eq!(rest, ops[1..].to_vec());
    }

    #[test]
    fn test_latest_snapshot_respects_bound() {
        let log = SqliteLog::in_memory().unwrap();
        let mut doc = Document::new();
        for counter in 1..=3u64 {
            doc.insert('x', None, "a", counter).unwrap();
            let state = doc.state();
            log.save_snapshot(&Snapshot {
                document_id: "doc".into(),
                operation_count: counter * 10,
                vector_clock: state.vector_clock.clone(),
                crdt_state: state,
                created_at: Utc::now(),
            })
            .unwrap();
        }

        let latest = log.latest_snapshot("doc", None).unwrap().unwrap();
        assert_eq!(latest.operation_count, 30);
        let bounded = log.latest_snapshot("doc", Some(25)).unwrap().unwrap();
        assert_eq!(bounded.operation_count, 20);
        assert_eq!(bounded.vector_clock.get("a"), 2);
        assert!(log.latest_snapshot("doc", Some(5)).unwrap().is_none());
    }

    #[test]
    fn test_session_upsert() {
        let log = SqliteLog::in_memory().unwrap();
        let mut session = ClientSession {
            site_id: "a".into(),
            document_id: "doc".into(),
            vector_clock: VectorClock::new(),
            connected: true,
            last_seen: Utc::now(),
        };
        log.save_session(&session).unwrap();
        session.connected = false;
        session.vector_clock.observe("a", 4);
        log.save_session(&session).unwrap();

        let sessions = log.load_sessions("doc").unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].connected);
        assert_eq!(sessions[0].vector_clock.get("a"), 4);

        log.delete_session("doc", "a").unwrap();
        assert!(log.load_sessions("doc").unwrap().is_empty());
    }

    #[test]
    fn test_documents_table() {
        let log = SqliteLog::in_memory().unwrap();
        let mut doc = Document::new();
        doc.insert('h', None, "a", 1).unwrap();
        log.save_document("doc", &doc.state()).unwrap();
        log.save_document("doc", &doc.state()).unwrap();
        log.append("other", &Operation::insert(NodeId::new("a", 1), None, 'x'))
            .unwrap();

        assert_eq!(log.load_document("doc").unwrap(), Some(doc.state()));
        assert_eq!(
            log.list_documents().unwrap(),
            vec!["doc".to_string(), "other".to_string()]
        );
    }

    #[test]
    fn test_stale_document_state_does_not_overwrite_newer() {
        let log = SqliteLog::in_memory().unwrap();
        let mut doc = Document::new();
        let x = doc.insert('x', None, "a", 1).unwrap();
        let older = doc.state();
        doc.insert('y', Some(x), "a", 2).unwrap();
        let newer = doc.state();

        // Blocking writers may finish in either order
        log.save_document("doc", &newer).unwrap();
        log.save_document("doc", &older).unwrap();
        assert_eq!(log.load_document("doc").unwrap(), Some(newer));
    }

    #[test]
    fn test_operations_after_skips_covered_sites() {
        let log = SqliteLog::in_memory().unwrap();
        let mut after = None;
        for counter in 1..=50u64 {
            let id = NodeId::new("a", counter);
            log.append("doc", &Operation::insert(id.clone(), after, 'a'))
                .unwrap();
            after = Some(id);
        }
        log.append("doc", &Operation::insert(NodeId::new("b", 1), None, 'b'))
            .unwrap();

        let mut clock = VectorClock::new();
        clock.observe("a", 48);
        let rest = log.operations_after("doc", &clock).unwrap();
        let ids: Vec<String> = rest.iter().map(|op| op.id().to_string()).collect();
        assert_eq!(ids, vec!["a:49", "a:50", "b:1"]);
    }
}
