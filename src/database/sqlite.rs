//! SQLite-backed [`Store`] implementation.
//!
//! A [`rusqlite::Connection`] wrapped in an `Arc<Mutex<…>>` is held
//! internally, making the store `Send + Sync` while keeping SQLite's
//! single-writer requirement.  The schema is created on open; WAL is
//! enabled for concurrent read performance.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::agent::branches::BranchStep;
use crate::ai::types::Role;
use crate::process::models::{ProcessKind, ProcessStatus, TrackedProcess};

use super::store::{AgentRecord, SessionMetadata, Store, StoreError, StoredMessage};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    name TEXT PRIMARY KEY NOT NULL,
    channel_id INTEGER,
    model TEXT,
    system_prompt TEXT NOT NULL DEFAULT '',
    permissions TEXT NOT NULL DEFAULT 'standard',
    web_search INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    role TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    branch_id INTEGER,
    content TEXT,
    tool_calls TEXT,
    tool_call_id TEXT,
    external_message_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_agent_ts ON messages (agent_name, timestamp);

CREATE TABLE IF NOT EXISTS agent_kv (
    agent_name TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (agent_name, key)
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    agent_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    saved_at TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    file_path TEXT NOT NULL,
    window_start TEXT NOT NULL DEFAULT '',
    window_end TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions (agent_name, saved_at);

CREATE TABLE IF NOT EXISTS processes (
    pid INTEGER PRIMARY KEY NOT NULL,
    command TEXT NOT NULL,
    working_directory TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    kind TEXT NOT NULL,
    spawned_by_branch INTEGER,
    stdout_log TEXT,
    stderr_log TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    exit_code INTEGER,
    callbacks TEXT NOT NULL DEFAULT '[]',
    context TEXT NOT NULL DEFAULT '',
    model_for_hooks TEXT,
    hook_recursion_depth INTEGER NOT NULL DEFAULT 0,
    external_message_id INTEGER
);

CREATE TABLE IF NOT EXISTS branch_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    branch_id INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    description TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS self_edit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    field TEXT NOT NULL,
    old_value TEXT NOT NULL,
    new_value TEXT NOT NULL,
    edited_at TEXT NOT NULL
);
"#;

/// SQLite-backed, thread-safe store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn role_to_str(role: Role) -> &'static str {
    role.as_str()
}

fn role_from_str(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn status_from_str(s: &str) -> ProcessStatus {
    match s {
        "exited" => ProcessStatus::Exited,
        "killed" => ProcessStatus::Killed,
        "lost" => ProcessStatus::Lost,
        _ => ProcessStatus::Running,
    }
}

fn kind_from_str(s: &str) -> ProcessKind {
    match s {
        "background" => ProcessKind::Background,
        _ => ProcessKind::Concurrent,
    }
}

fn kind_to_str(kind: ProcessKind) -> &'static str {
    match kind {
        ProcessKind::Concurrent => "concurrent",
        ProcessKind::Background => "background",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn register_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO agents (name, channel_id, model, system_prompt, permissions, web_search)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                 channel_id = excluded.channel_id,
                 model = excluded.model,
                 system_prompt = excluded.system_prompt,
                 permissions = excluded.permissions,
                 web_search = excluded.web_search",
            params![
                agent.name,
                agent.channel_id,
                agent.model,
                agent.system_prompt,
                agent.permissions,
                agent.web_search_enabled,
            ],
        )?;
        Ok(())
    }

    async fn update_agent_field(
        &self,
        agent_name: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let column = match field {
            "model" => "model",
            "system_prompt" => "system_prompt",
            "permissions" => "permissions",
            "web_search" => "web_search",
            other => {
                return Err(StoreError::Sqlite(
                    rusqlite::Error::InvalidParameterName(other.to_owned()),
                ));
            }
        };
        let sql = format!("UPDATE agents SET {column} = ?1 WHERE name = ?2");
        self.conn().execute(&sql, params![value, agent_name])?;
        Ok(())
    }

    async fn log_self_edit(
        &self,
        agent_name: &str,
        field: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO self_edit_log (agent_name, field, old_value, new_value, edited_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent_name,
                field,
                old_value,
                new_value,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn persist_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn().execute(
            "INSERT INTO messages
                 (agent_name, role, timestamp, branch_id, content, tool_calls,
                  tool_call_id, external_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.agent_name,
                role_to_str(message.role),
                message.timestamp,
                message.branch_id,
                message.content,
                tool_calls,
                message.tool_call_id,
                message.external_message_id,
            ],
        )?;
        Ok(())
    }

    async fn get_messages_since(
        &self,
        agent_name: &str,
        cutoff: &str,
        branch_id: Option<u64>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn();
        let mut sql = String::from(
            "SELECT agent_name, role, timestamp, branch_id, content, tool_calls,
                    tool_call_id, external_message_id
             FROM messages
             WHERE agent_name = ?1 AND timestamp > ?2",
        );
        if branch_id.is_some() {
            sql.push_str(" AND branch_id = ?3");
        }
        sql.push_str(" ORDER BY timestamp, id");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StoredMessage> {
            let role: String = row.get(1)?;
            let tool_calls: Option<String> = row.get(5)?;
            Ok(StoredMessage {
                agent_name: row.get(0)?,
                role: role_from_str(&role),
                timestamp: row.get(2)?,
                branch_id: row.get(3)?,
                content: row.get(4)?,
                tool_calls: tool_calls.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
                tool_call_id: row.get(6)?,
                external_message_id: row.get(7)?,
            })
        };
        let rows = match branch_id {
            Some(id) => stmt.query_map(params![agent_name, cutoff, id], map_row)?,
            None => stmt.query_map(params![agent_name, cutoff], map_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_last_clear_time(&self, agent_name: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM agent_kv WHERE agent_name = ?1 AND key = 'last_clear'",
                params![agent_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_last_clear_time(
        &self,
        agent_name: &str,
        timestamp: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO agent_kv (agent_name, key, value) VALUES (?1, 'last_clear', ?2)
             ON CONFLICT(agent_name, key) DO UPDATE SET value = excluded.value",
            params![agent_name, timestamp],
        )?;
        Ok(())
    }

    async fn save_session(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sessions
                 (session_id, agent_name, description, summary, saved_at,
                  message_count, file_path, window_start, window_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                meta.session_id,
                meta.agent_name,
                meta.description,
                meta.summary,
                meta.saved_at,
                meta.message_count,
                meta.file_path,
                meta.window_start,
                meta.window_end,
            ],
        )?;
        Ok(())
    }

    async fn list_sessions(
        &self,
        agent_name: &str,
        limit: u32,
    ) -> Result<Vec<SessionMetadata>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, agent_name, description, summary, saved_at,
                    message_count, file_path, window_start, window_end
             FROM sessions WHERE agent_name = ?1
             ORDER BY saved_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_name, limit], session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionMetadata>, StoreError> {
        let meta = self
            .conn()
            .query_row(
                "SELECT session_id, agent_name, description, summary, saved_at,
                        message_count, file_path, window_start, window_end
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(meta)
    }

    async fn insert_process(&self, process: &TrackedProcess) -> Result<(), StoreError> {
        let callbacks = serde_json::to_string(&process.callbacks)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO processes
                 (pid, command, working_directory, agent_name, started_at, kind,
                  spawned_by_branch, stdout_log, stderr_log, status, exit_code,
                  callbacks, context, model_for_hooks, hook_recursion_depth,
                  external_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                process.pid,
                process.command,
                process.working_directory,
                process.agent_name,
                process.started_at.to_rfc3339(),
                kind_to_str(process.kind),
                process.spawned_by_branch,
                process.stdout_log,
                process.stderr_log,
                process.status.as_str(),
                process.exit_code,
                callbacks,
                process.context,
                process.model_for_hooks,
                process.hook_recursion_depth,
                process.external_message_id,
            ],
        )?;
        Ok(())
    }

    async fn update_process_status(
        &self,
        pid: u32,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE processes SET status = ?1, exit_code = ?2 WHERE pid = ?3",
            params![status.as_str(), exit_code, pid],
        )?;
        Ok(())
    }

    async fn update_process_callbacks(
        &self,
        pid: u32,
        callbacks_json: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE processes SET callbacks = ?1 WHERE pid = ?2",
            params![callbacks_json, pid],
        )?;
        Ok(())
    }

    async fn list_processes(&self) -> Result<Vec<TrackedProcess>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT pid, command, working_directory, agent_name, started_at, kind,
                    spawned_by_branch, stdout_log, stderr_log, status, exit_code,
                    callbacks, context, model_for_hooks, hook_recursion_depth,
                    external_message_id
             FROM processes ORDER BY started_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let started_at: String = row.get(4)?;
            let kind: String = row.get(5)?;
            let status: String = row.get(9)?;
            let callbacks: String = row.get(11)?;
            Ok(TrackedProcess {
                pid: row.get(0)?,
                command: row.get(1)?,
                working_directory: row.get(2)?,
                agent_name: row.get(3)?,
                started_at: chrono::DateTime::parse_from_rfc3339(&started_at)
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
                kind: kind_from_str(&kind),
                spawned_by_branch: row.get(6)?,
                stdout_log: row.get(7)?,
                stderr_log: row.get(8)?,
                status: status_from_str(&status),
                exit_code: row.get(10)?,
                callbacks: serde_json::from_str(&callbacks).unwrap_or_default(),
                context: row.get(12)?,
                rolling_tail: Default::default(),
                model_for_hooks: row.get(13)?,
                hook_recursion_depth: row.get(14)?,
                external_message_id: row.get(15)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn persist_branch_step(
        &self,
        agent_name: &str,
        branch_id: u64,
        step: &BranchStep,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO branch_steps
                 (agent_name, branch_id, step_number, description, started_at,
                  ended_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                agent_name,
                branch_id,
                step.step_number,
                step.description,
                step.started_at.to_rfc3339(),
                step.ended_at.map(|t| t.to_rfc3339()),
                step.duration_ms,
            ],
        )?;
        Ok(())
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMetadata> {
    Ok(SessionMetadata {
        session_id: row.get(0)?,
        agent_name: row.get(1)?,
        description: row.get(2)?,
        summary: row.get(3)?,
        saved_at: row.get(4)?,
        message_count: row.get(5)?,
        file_path: row.get(6)?,
        window_start: row.get(7)?,
        window_end: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_message(agent: &str, ts: &str) -> StoredMessage {
        StoredMessage {
            agent_name: agent.to_owned(),
            role: Role::Assistant,
            timestamp: ts.to_owned(),
            branch_id: Some(2),
            content: Some("working on it".to_owned()),
            tool_calls: Some(json!([{"id": "t1", "name": "bash", "arguments": {"command": "ls"}}])),
            tool_call_id: None,
            external_message_id: Some(99),
        }
    }

    #[tokio::test]
    async fn message_persist_then_read_preserves_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let msg = sample_message("athena", "2026-07-01T00:00:10Z");
        store.persist_message(&msg).await.unwrap();

        let got = store
            .get_messages_since("athena", "2026-07-01T00:00:00Z", None)
            .await
            .unwrap();
        assert_eq!(got, vec![msg]);
    }

    #[tokio::test]
    async fn cutoff_and_branch_filters_apply() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .persist_message(&sample_message("athena", "2026-07-01T00:00:01Z"))
            .await
            .unwrap();
        let mut other_branch = sample_message("athena", "2026-07-01T00:00:02Z");
        other_branch.branch_id = Some(5);
        store.persist_message(&other_branch).await.unwrap();

        // Strictly-after cutoff.
        let got = store
            .get_messages_since("athena", "2026-07-01T00:00:01Z", None)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);

        let got = store
            .get_messages_since("athena", "2026-07-01T00:00:00Z", Some(5))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].branch_id, Some(5));
    }

    #[tokio::test]
    async fn last_clear_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_last_clear_time("a").await.unwrap().is_none());
        store
            .set_last_clear_time("a", "2026-07-01T12:00:00Z")
            .await
            .unwrap();
        store
            .set_last_clear_time("a", "2026-07-02T12:00:00Z")
            .await
            .unwrap();
        assert_eq!(
            store.get_last_clear_time("a").await.unwrap().as_deref(),
            Some("2026-07-02T12:00:00Z")
        );
    }

    #[tokio::test]
    async fn process_row_round_trips_with_status_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let process = TrackedProcess {
            pid: 4242,
            command: "sleep 60".to_owned(),
            working_directory: "/tmp".to_owned(),
            agent_name: "athena".to_owned(),
            started_at: chrono::Utc::now(),
            kind: ProcessKind::Background,
            spawned_by_branch: Some(3),
            stdout_log: Some("/tmp/p/stdout.log".to_owned()),
            stderr_log: Some("/tmp/p/stderr.log".to_owned()),
            status: ProcessStatus::Running,
            exit_code: None,
            callbacks: vec![crate::process::callback_builder::default_callback()],
            context: "watch it".to_owned(),
            rolling_tail: Default::default(),
            model_for_hooks: None,
            hook_recursion_depth: 1,
            external_message_id: None,
        };
        store.insert_process(&process).await.unwrap();

        store
            .update_process_status(4242, ProcessStatus::Exited, Some(0))
            .await
            .unwrap();

        let rows = store.list_processes().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 4242);
        assert_eq!(rows[0].status, ProcessStatus::Exited);
        assert_eq!(rows[0].exit_code, Some(0));
        assert_eq!(rows[0].callbacks.len(), 1);
        assert_eq!(rows[0].hook_recursion_depth, 1);
    }

    #[tokio::test]
    async fn sessions_index_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let meta = SessionMetadata {
            session_id: "abc".to_owned(),
            agent_name: "athena".to_owned(),
            description: "checkpoint".to_owned(),
            summary: "did things".to_owned(),
            saved_at: "2026-07-01T00:00:00Z".to_owned(),
            message_count: 7,
            file_path: "/tmp/sessions/abc.json".to_owned(),
            window_start: "2026-06-30T00:00:00Z".to_owned(),
            window_end: "2026-07-01T00:00:00Z".to_owned(),
        };
        store.save_session(&meta).await.unwrap();
        assert_eq!(store.get_session("abc").await.unwrap(), Some(meta.clone()));
        assert_eq!(store.list_sessions("athena", 10).await.unwrap(), vec![meta]);
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn agent_registration_upserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut agent = AgentRecord {
            name: "athena".to_owned(),
            channel_id: Some(1),
            model: Some("claude-sonnet-4-5".to_owned()),
            system_prompt: "be helpful".to_owned(),
            permissions: "standard".to_owned(),
            web_search_enabled: false,
        };
        store.register_agent(&agent).await.unwrap();
        agent.system_prompt = "be very helpful".to_owned();
        store.register_agent(&agent).await.unwrap();
        store
            .update_agent_field("athena", "model", "gpt-4o")
            .await
            .unwrap();
        store
            .log_self_edit("athena", "model", "claude-sonnet-4-5", "gpt-4o")
            .await
            .unwrap();
    }
}
