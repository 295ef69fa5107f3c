//! SQLite-backed session store.
//!
//! [`SqliteStore`] persists the full data model in a SQLite database,
//! surviving process restarts. Uses [`rusqlite`] for synchronous access,
//! bridged to async via [`tokio::task::spawn_blocking`].
//!
//! # Storage Model
//!
//! One table per entity kind. Entities are stored as JSON rows with the
//! columns needed for ordering and filtering lifted out; steps carry a
//! unique `(session_id, sequence)` index and runs a `(session_id,
//! start_time)` index. WAL journal mode keeps concurrent readers cheap.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::{
    LlmCallLog, LogFilter, RunFilter, Session, SessionStore, StepRange, StoreStats,
    collect_call_ids, validate_new_step,
};
use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::run::Run;
use crate::step::{NewStep, Step, StepRole};
use crate::trace::Trace;

/// SQLite-backed [`SessionStore`].
///
/// Cloneable via `Arc<Mutex<Connection>>`; all handles share one database.
/// Schema is auto-created on construction and all blocking I/O is offloaded
/// to the tokio blocking thread pool, which also serializes appends.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path.as_ref())?)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the database cannot be opened.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if schema creation fails.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id   TEXT PRIMARY KEY,
                session_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS steps (
                session_id TEXT    NOT NULL,
                sequence   INTEGER NOT NULL,
                role       TEXT    NOT NULL,
                step_data  TEXT    NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_steps_session_sequence
            ON steps (session_id, sequence);

            CREATE TABLE IF NOT EXISTS runs (
                run_id     TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                run_data   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_session_start
            ON runs (session_id, start_time);

            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id   TEXT PRIMARY KEY,
                run_id          TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                checkpoint_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS llm_call_logs (
                log_id        TEXT PRIMARY KEY,
                run_id        TEXT NOT NULL,
                session_id    TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                input_tokens  INTEGER,
                output_tokens INTEGER,
                log_data      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS traces (
                trace_id   TEXT PRIMARY KEY,
                trace_data TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| Error::store(format!("connection mutex poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::store(format!("blocking task failed: {e}")))?
    }

    fn session_exists(conn: &Connection, session_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn require_session(conn: &Connection, session_id: &str) -> Result<()> {
        if Self::session_exists(conn, session_id)? {
            Ok(())
        } else {
            Err(Error::not_found("session", session_id))
        }
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        owner: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            owner,
            metadata,
            created_at: chrono::Utc::now(),
        };
        let row = session.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, session_data) VALUES (?1, ?2)",
                params![row.session_id, serde_json::to_string(&row)?],
            )?;
            Ok(())
        })
        .await?;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        let id = session_id.to_owned();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT session_data FROM sessions WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(Error::not_found("session", id)),
            }
        })
        .await
    }

    async fn append_step(&self, session_id: &str, step: NewStep) -> Result<Step> {
        let id = session_id.to_owned();
        self.blocking(move |conn| {
            Self::require_session(conn, &id)?;
            let tx = conn.unchecked_transaction()?;

            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM steps WHERE session_id = ?1",
                params![id],
                |row| row.get(0),
            )?;

            // Tool pairing needs the call ids of earlier assistant steps.
            if step.role == StepRole::Tool {
                let mut stmt = tx.prepare(
                    "SELECT step_data FROM steps \
                     WHERE session_id = ?1 AND role = 'assistant' \
                     ORDER BY sequence ASC",
                )?;
                let assistants = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                let parsed: Vec<Step> = assistants
                    .iter()
                    .map(|json| serde_json::from_str(json))
                    .collect::<std::result::Result<_, _>>()?;
                validate_new_step(&step, &collect_call_ids(parsed.iter()))?;
            } else {
                validate_new_step(&step, &std::collections::HashSet::new())?;
            }

            #[allow(clippy::cast_sign_loss)]
            let step = step.into_step(&id, next as u64);
            tx.execute(
                "INSERT INTO steps (session_id, sequence, role, step_data) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    next,
                    step.role.as_str(),
                    serde_json::to_string(&step)?
                ],
            )?;
            tx.commit()?;
            Ok(step)
        })
        .await
    }

    async fn list_steps(&self, session_id: &str, range: Option<StepRange>) -> Result<Vec<Step>> {
        let id = session_id.to_owned();
        self.blocking(move |conn| {
            Self::require_session(conn, &id)?;
            let (start, end) = range.unwrap_or((1, None));
            #[allow(clippy::cast_possible_wrap)]
            let (start, end) = (start as i64, end.map(|e| e as i64));

            let mut stmt = conn.prepare(
                "SELECT step_data FROM steps \
                 WHERE session_id = ?1 AND sequence >= ?2 \
                   AND (?3 IS NULL OR sequence <= ?3) \
                 ORDER BY sequence ASC",
            )?;
            let rows = stmt
                .query_map(params![id, start, end], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            rows.iter()
                .map(|json| Ok(serde_json::from_str(json)?))
                .collect()
        })
        .await
    }

    async fn get_last_step(&self, session_id: &str) -> Result<Option<Step>> {
        let id = session_id.to_owned();
        self.blocking(move |conn| {
            Self::require_session(conn, &id)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT step_data FROM steps WHERE session_id = ?1 \
                     ORDER BY sequence DESC LIMIT 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn truncate_suffix(&self, session_id: &str, from_sequence: u64) -> Result<u64> {
        let id = session_id.to_owned();
        self.blocking(move |conn| {
            Self::require_session(conn, &id)?;
            #[allow(clippy::cast_possible_wrap)]
            let deleted = conn.execute(
                "DELETE FROM steps WHERE session_id = ?1 AND sequence >= ?2",
                params![id, from_sequence as i64],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let row = run.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, session_id, start_time, run_data) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(run_id) DO UPDATE SET run_data = excluded.run_data",
                params![
                    row.run_id,
                    row.session_id,
                    row.start_time.to_rfc3339(),
                    serde_json::to_string(&row)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let id = run_id.to_owned();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT run_data FROM runs WHERE run_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(Error::not_found("run", id)),
            }
        })
        .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT run_data FROM runs ORDER BY start_time ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            let runs: Vec<Run> = rows
                .iter()
                .map(|json| serde_json::from_str(json))
                .collect::<std::result::Result<_, _>>()?;
            Ok(runs.into_iter().filter(|r| filter.matches(r)).collect())
        })
        .await
    }

    async fn save_llm_call_log(&self, log: &LlmCallLog) -> Result<()> {
        let row = log.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO llm_call_logs \
                 (log_id, run_id, session_id, created_at, input_tokens, output_tokens, log_data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.log_id,
                    row.run_id,
                    row.session_id,
                    row.created_at.to_rfc3339(),
                    row.usage.map(|u| i64::from(u.input_tokens)),
                    row.usage.map(|u| i64::from(u.output_tokens)),
                    serde_json::to_string(&row)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_llm_call_logs(&self, filter: &LogFilter) -> Result<Vec<LlmCallLog>> {
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT log_data FROM llm_call_logs ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            let logs: Vec<LlmCallLog> = rows
                .iter()
                .map(|json| serde_json::from_str(json))
                .collect::<std::result::Result<_, _>>()?;
            Ok(logs.into_iter().filter(|l| filter.matches(l)).collect())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.blocking(|conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                #[allow(clippy::cast_sign_loss)]
                Ok(n as u64)
            };
            let tokens: (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT SUM(input_tokens), SUM(output_tokens) FROM llm_call_logs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            #[allow(clippy::cast_sign_loss)]
            Ok(StoreStats {
                sessions: count("SELECT COUNT(*) FROM sessions")?,
                steps: count("SELECT COUNT(*) FROM steps")?,
                runs: count("SELECT COUNT(*) FROM runs")?,
                checkpoints: count("SELECT COUNT(*) FROM checkpoints")?,
                llm_calls: count("SELECT COUNT(*) FROM llm_call_logs")?,
                total_input_tokens: tokens.0.unwrap_or(0) as u64,
                total_output_tokens: tokens.1.unwrap_or(0) as u64,
            })
        })
        .await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let row = checkpoint.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (checkpoint_id, run_id, created_at, checkpoint_data) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.checkpoint_id,
                    row.run_id,
                    row.created_at.to_rfc3339(),
                    serde_json::to_string(&row)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let id = checkpoint_id.to_owned();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT checkpoint_data FROM checkpoints WHERE checkpoint_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(Error::not_found("checkpoint", id)),
            }
        })
        .await
    }

    async fn list_checkpoints(&self, run_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        let run_id = run_id.map(str::to_owned);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT checkpoint_data FROM checkpoints \
                 WHERE (?1 IS NULL OR run_id = ?1) \
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            rows.iter()
                .map(|json| Ok(serde_json::from_str(json)?))
                .collect()
        })
        .await
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let id = checkpoint_id.to_owned();
        self.blocking(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM checkpoints WHERE checkpoint_id = ?1",
                params![id],
            )?;
            if deleted == 0 {
                Err(Error::not_found("checkpoint", id))
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn save_trace(&self, trace: &Trace) -> Result<()> {
        let row = trace.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO traces (trace_id, trace_data) VALUES (?1, ?2) \
                 ON CONFLICT(trace_id) DO UPDATE SET trace_data = excluded.trace_data",
                params![row.trace_id, serde_json::to_string(&row)?],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Trace> {
        let id = trace_id.to_owned();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT trace_data FROM traces WHERE trace_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(Error::not_found("trace", id)),
            }
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::step::StepToolCall;

    async fn fresh() -> (SqliteStore, String) {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session(None, HashMap::new()).await.unwrap();
        let id = session.session_id.clone();
        (store, id)
    }

    mod construction {
        use super::*;

        #[test]
        fn from_connection_applies_schema() {
            let conn = Connection::open_in_memory().unwrap();
            let store = SqliteStore::from_connection(conn).unwrap();

            let guard = store.conn.lock().unwrap();
            let tables: Vec<String> = guard
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap()
                .query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(std::result::Result::ok)
                .collect();
            for table in ["sessions", "steps", "runs", "checkpoints", "llm_call_logs", "traces"] {
                assert!(tables.contains(&table.to_owned()), "missing table {table}");
            }
        }

        #[tokio::test]
        async fn open_with_temp_file() {
            let dir = std::env::temp_dir().join("agio_test_sqlite");
            std::fs::create_dir_all(&dir).unwrap();
            let db_path = dir.join("test_open.db");

            let store = SqliteStore::open(&db_path).unwrap();
            let session = store.create_session(None, HashMap::new()).await.unwrap();
            assert!(store.get_session(&session.session_id).await.is_ok());

            drop(store);
            let _ = std::fs::remove_file(&db_path);
            let _ = std::fs::remove_dir(&dir);
        }

        #[tokio::test]
        async fn clone_shares_connection() {
            let (store, sid) = fresh().await;
            let cloned = store.clone();
            assert!(Arc::ptr_eq(&store.conn, &cloned.conn));
            assert!(cloned.get_session(&sid).await.is_ok());
        }
    }

    mod steps {
        use super::*;

        #[tokio::test]
        async fn sequences_are_dense_and_unique() {
            let (store, sid) = fresh().await;
            for i in 1..=4_u64 {
                let step = store
                    .append_step(&sid, NewStep::user(format!("u{i}")))
                    .await
                    .unwrap();
                assert_eq!(step.sequence, i);
            }
            let steps = store.list_steps(&sid, None).await.unwrap();
            assert_eq!(
                steps.iter().map(|s| s.sequence).collect::<Vec<_>>(),
                vec![1, 2, 3, 4]
            );
        }

        #[tokio::test]
        async fn tool_steps_survive_the_json_roundtrip() {
            let (store, sid) = fresh().await;
            store
                .append_step(
                    &sid,
                    NewStep::assistant_with_tool_calls(
                        "",
                        vec![StepToolCall::new("c1", "get_weather", r#"{"city":"Tokyo"}"#)],
                    ),
                )
                .await
                .unwrap();
            store
                .append_step(&sid, NewStep::tool("c1", "get_weather", "sunny", false))
                .await
                .unwrap();

            let steps = store.list_steps(&sid, None).await.unwrap();
            assert!(steps[0].has_tool_calls());
            assert_eq!(
                steps[0].tool_calls.as_ref().unwrap()[0].arguments,
                r#"{"city":"Tokyo"}"#
            );
            assert_eq!(steps[1].tool_call_id.as_deref(), Some("c1"));
            assert_eq!(steps[1].tool_name.as_deref(), Some("get_weather"));
        }

        #[tokio::test]
        async fn tool_pairing_is_enforced_across_rows() {
            let (store, sid) = fresh().await;
            let err = store
                .append_step(&sid, NewStep::tool("ghost", "add", "3", false))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Invariant { .. }));
        }

        #[tokio::test]
        async fn truncate_then_append_continues_densely() {
            let (store, sid) = fresh().await;
            for i in 0..5 {
                store
                    .append_step(&sid, NewStep::user(format!("u{i}")))
                    .await
                    .unwrap();
            }
            assert_eq!(store.truncate_suffix(&sid, 4).await.unwrap(), 2);
            let step = store.append_step(&sid, NewStep::user("again")).await.unwrap();
            assert_eq!(step.sequence, 4);
        }

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let store = SqliteStore::in_memory().unwrap();
            assert!(store.list_steps("nope", None).await.unwrap_err().is_not_found());
            assert!(store.get_last_step("nope").await.unwrap_err().is_not_found());
        }
    }

    mod runs_and_stats {
        use super::*;
        use crate::run::RunStatus;
        use crate::store::LlmCallStatus;
        use crate::usage::Usage;

        #[tokio::test]
        async fn run_upsert_freezes_terminal_state() {
            let (store, sid) = fresh().await;
            let mut run = Run::started("r-1", &sid, None, "helper", "q");
            store.save_run(&run).await.unwrap();

            run.finish(
                RunStatus::Cancelled,
                crate::run::TerminationReason::Cancelled,
                crate::run::RunMetrics::default(),
            );
            store.save_run(&run).await.unwrap();

            let fetched = store.get_run("r-1").await.unwrap();
            assert_eq!(fetched.status, RunStatus::Cancelled);
            assert_eq!(store.list_runs(&RunFilter::session(&sid)).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn stats_sum_logged_tokens() {
            let (store, sid) = fresh().await;
            store
                .save_llm_call_log(&LlmCallLog {
                    log_id: "l-1".into(),
                    run_id: "r-1".into(),
                    session_id: sid,
                    model: "mock".into(),
                    message_count: 2,
                    usage: Some(Usage::new(11, 4)),
                    duration_ms: 3,
                    status: LlmCallStatus::Ok,
                    error: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();

            let stats = store.stats().await.unwrap();
            assert_eq!(stats.llm_calls, 1);
            assert_eq!(stats.total_input_tokens, 11);
            assert_eq!(stats.total_output_tokens, 4);
        }
    }

    mod checkpoints_and_traces {
        use super::*;
        use crate::run::RunMetrics;
        use crate::trace::{Span, SpanKind, SpanStatus, Trace};

        #[tokio::test]
        async fn checkpoint_crud() {
            let (store, sid) = fresh().await;
            let checkpoint = Checkpoint {
                checkpoint_id: "cp-1".into(),
                run_id: "r-1".into(),
                session_id: sid,
                at_sequence: 2,
                captured_steps: Vec::new(),
                captured_metrics: RunMetrics::default(),
                agent_config: serde_json::json!({"model": "mock"}),
                user_modifications: None,
                tags: vec!["baseline".into()],
                description: None,
                created_at: chrono::Utc::now(),
            };
            store.save_checkpoint(&checkpoint).await.unwrap();

            assert_eq!(store.get_checkpoint("cp-1").await.unwrap(), checkpoint);
            assert_eq!(store.list_checkpoints(Some("r-1")).await.unwrap().len(), 1);
            assert!(store.list_checkpoints(Some("other")).await.unwrap().is_empty());

            store.delete_checkpoint("cp-1").await.unwrap();
            assert!(store.get_checkpoint("cp-1").await.unwrap_err().is_not_found());
        }

        #[tokio::test]
        async fn trace_roundtrip() {
            let (store, _sid) = fresh().await;
            let trace = Trace {
                trace_id: "r-1".into(),
                root_run_id: "r-1".into(),
                spans: vec![Span {
                    span_id: "sp-1".into(),
                    run_id: "r-1".into(),
                    parent_span_id: None,
                    kind: SpanKind::Agent,
                    name: "helper".into(),
                    start_ms: 0,
                    end_ms: Some(10),
                    status: SpanStatus::Ok,
                    attributes: HashMap::new(),
                }],
            };
            store.save_trace(&trace).await.unwrap();
            assert_eq!(store.get_trace("r-1").await.unwrap(), trace);
        }
    }
}
