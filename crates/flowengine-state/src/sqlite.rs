// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `SqliteStateStore`: the reference [`StateStore`] backend, a `sqlx::SqlitePool`
//! with `CREATE TABLE IF NOT EXISTS` migrations run once at construction. `:memory:`
//! is a valid path -- useful for tests and for single-process runs that don't need
//! the durability a real file buys.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{EventRecord, MemoryRecord, RunStatus, StepExecution, StepStatus, SuspensionRecord, WorkflowRun};
use crate::store::{Result, StateStore, StoreError};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    workflow_name TEXT NOT NULL,
    status TEXT NOT NULL,
    inputs TEXT NOT NULL,
    outputs TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS step_executions (
    exec_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    step_id TEXT NOT NULL,
    status TEXT NOT NULL,
    output TEXT,
    outputs TEXT,
    error TEXT,
    iteration_count INTEGER,
    iteration_index INTEGER,
    attempt INTEGER NOT NULL DEFAULT 1,
    usage TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_step_executions_run ON step_executions(run_id);
CREATE INDEX IF NOT EXISTS idx_step_executions_run_step ON step_executions(run_id, step_id);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);

CREATE TABLE IF NOT EXISTS suspensions (
    suspension_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    step_id TEXT NOT NULL,
    event_name TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_data TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_suspensions_run ON suspensions(run_id);

CREATE TABLE IF NOT EXISTS memory (
    memory_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    text TEXT NOT NULL,
    embedding TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_run ON memory(run_id);
"#;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Opens (creating if necessary) the SQLite database at `path`, running
    /// migrations. `path` of `:memory:` opens a private, non-persistent database.
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path == ":memory:" { "sqlite::memory:".to_string() } else { format!("sqlite:{path}?mode=rwc") };
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        sqlx::query(MIGRATIONS).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRun> {
        let status: String = row.try_get("status")?;
        let inputs: String = row.try_get("inputs")?;
        let outputs: Option<String> = row.try_get("outputs")?;
        Ok(WorkflowRun {
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: status.parse().map_err(|e: String| StoreError::Database(sqlx::Error::Decode(e.into())))?,
            inputs: serde_json::from_str(&inputs)?,
            outputs: outputs.map(|s| serde_json::from_str(&s)).transpose()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_step_execution(row: &sqlx::sqlite::SqliteRow) -> Result<StepExecution> {
        let status: String = row.try_get("status")?;
        let output: Option<String> = row.try_get("output")?;
        let outputs: Option<String> = row.try_get("outputs")?;
        let usage: Option<String> = row.try_get("usage")?;
        Ok(StepExecution {
            exec_id: row.try_get("exec_id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            status: status.parse().map_err(|e: String| StoreError::Database(sqlx::Error::Decode(e.into())))?,
            output: output.map(|s| serde_json::from_str(&s)).transpose()?,
            outputs: outputs.map(|s| serde_json::from_str(&s)).transpose()?,
            error: row.try_get("error")?,
            iteration_count: row.try_get("iteration_count")?,
            iteration_index: row.try_get("iteration_index")?,
            attempt: row.try_get("attempt")?,
            usage: usage.map(|s| serde_json::from_str(&s)).transpose()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
        let data: String = row.try_get("data")?;
        Ok(EventRecord {
            event_id: row.try_get("event_id")?,
            run_id: row.try_get("run_id")?,
            name: row.try_get("name")?,
            data: serde_json::from_str(&data)?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn row_to_suspension(row: &sqlx::sqlite::SqliteRow) -> Result<SuspensionRecord> {
        let resolved_data: Option<String> = row.try_get("resolved_data")?;
        Ok(SuspensionRecord {
            suspension_id: row.try_get("suspension_id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            event_name: row.try_get("event_name")?,
            resolved: row.try_get::<i64, _>("resolved")? != 0,
            resolved_data: resolved_data.map(|s| serde_json::from_str(&s)).transpose()?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryRecord> {
        let embedding: String = row.try_get("embedding")?;
        let metadata: String = row.try_get("metadata")?;
        Ok(MemoryRecord {
            memory_id: row.try_get("memory_id")?,
            run_id: row.try_get("run_id")?,
            text: row.try_get("text")?,
            embedding: serde_json::from_str(&embedding)?,
            metadata: serde_json::from_str(&metadata)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_run(&self, run_id: Uuid, workflow_name: &str, inputs: Value) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO runs (run_id, workflow_name, status, inputs, outputs, started_at, completed_at)
             VALUES (?, ?, ?, ?, NULL, ?, NULL)",
        )
        .bind(run_id)
        .bind(workflow_name)
        .bind(RunStatus::Running.as_str())
        .bind(serde_json::to_string(&inputs)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: Uuid, status: RunStatus, outputs: Option<Value>) -> Result<()> {
        let outputs_json = outputs.map(|v| serde_json::to_string(&v)).transpose()?;
        let result = sqlx::query("UPDATE runs SET status = ?, outputs = ?, completed_at = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(outputs_json)
            .bind(Utc::now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Self::row_to_run(&row)
    }

    async fn start_step(&self, run_id: Uuid, step_id: &str, iteration_index: Option<i64>, attempt: i64) -> Result<Uuid> {
        let exec_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO step_executions (exec_id, run_id, step_id, status, iteration_index, attempt, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(exec_id)
        .bind(run_id)
        .bind(step_id)
        .bind(StepStatus::Running.as_str())
        .bind(iteration_index)
        .bind(attempt)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(exec_id)
    }

    async fn complete_step(
        &self,
        exec_id: Uuid,
        status: StepStatus,
        output: Option<Value>,
        outputs: Option<Value>,
        error: Option<String>,
        iteration_count: Option<i64>,
        usage: Option<Value>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal(), "complete_step requires a terminal status");
        let output_json = output.map(|v| serde_json::to_string(&v)).transpose()?;
        let outputs_json = outputs.map(|v| serde_json::to_string(&v)).transpose()?;
        let usage_json = usage.map(|v| serde_json::to_string(&v)).transpose()?;
        sqlx::query(
            "UPDATE step_executions
             SET status = ?, output = ?, outputs = ?, error = ?, iteration_count = ?, usage = ?, completed_at = ?
             WHERE exec_id = ?",
        )
        .bind(status.as_str())
        .bind(output_json)
        .bind(outputs_json)
        .bind(error)
        .bind(iteration_count)
        .bind(usage_json)
        .bind(Utc::now())
        .bind(exec_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_transient(&self, exec_id: Uuid, status: StepStatus) -> Result<()> {
        sqlx::query("UPDATE step_executions SET status = ? WHERE exec_id = ?")
            .bind(status.as_str())
            .bind(exec_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_foreach_items(&self, exec_id: Uuid, items: &Value) -> Result<()> {
        sqlx::query("UPDATE step_executions SET output = ? WHERE exec_id = ?")
            .bind(serde_json::to_string(&serde_json::json!({"__foreachItems": items}))?)
            .bind(exec_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query("SELECT * FROM step_executions WHERE run_id = ? ORDER BY started_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_step_execution).collect()
    }

    async fn get_main_step(&self, run_id: Uuid, step_id: &str) -> Result<Option<StepExecution>> {
        let row = sqlx::query(
            "SELECT * FROM step_executions
             WHERE run_id = ? AND step_id = ? AND iteration_index IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_step_execution).transpose()
    }

    async fn get_step_iterations(&self, run_id: Uuid, step_id: &str, include_output: bool) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions
             WHERE run_id = ? AND step_id = ? AND iteration_index IS NOT NULL
             ORDER BY iteration_index",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        let mut executions = rows.iter().map(Self::row_to_step_execution).collect::<Result<Vec<_>>>()?;
        if !include_output {
            for execution in &mut executions {
                execution.output = None;
                execution.outputs = None;
            }
        }
        Ok(executions)
    }

    async fn count_step_iterations(&self, run_id: Uuid, step_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM step_executions
             WHERE run_id = ? AND step_id = ? AND iteration_index IS NOT NULL",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn record_event(&self, run_id: Uuid, name: &str, data: Value) -> Result<Uuid> {
        let event_id = Uuid::new_v4();
        sqlx::query("INSERT INTO events (event_id, run_id, name, data, recorded_at) VALUES (?, ?, ?, ?, ?)")
            .bind(event_id)
            .bind(run_id)
            .bind(name)
            .bind(serde_json::to_string(&data)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(event_id)
    }

    async fn list_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM events WHERE run_id = ? ORDER BY recorded_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn create_suspension(&self, run_id: Uuid, step_id: &str, event_name: &str) -> Result<Uuid> {
        let suspension_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO suspensions (suspension_id, run_id, step_id, event_name, resolved, resolved_data, created_at)
             VALUES (?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(suspension_id)
        .bind(run_id)
        .bind(step_id)
        .bind(event_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(suspension_id)
    }

    async fn resolve_suspension(&self, run_id: Uuid, event_name: &str, data: Value) -> Result<SuspensionRecord> {
        let row = sqlx::query(
            "SELECT * FROM suspensions WHERE run_id = ? AND event_name = ? AND resolved = 0
             ORDER BY created_at LIMIT 1",
        )
        .bind(run_id)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::SuspensionNotFound { run_id, step_id: event_name.to_string() })?;
        let mut suspension = Self::row_to_suspension(&row)?;

        sqlx::query("UPDATE suspensions SET resolved = 1, resolved_data = ? WHERE suspension_id = ?")
            .bind(serde_json::to_string(&data)?)
            .bind(suspension.suspension_id)
            .execute(&self.pool)
            .await?;

        suspension.resolved = true;
        suspension.resolved_data = Some(data);
        Ok(suspension)
    }

    async fn pending_suspensions(&self, run_id: Uuid) -> Result<Vec<SuspensionRecord>> {
        let rows = sqlx::query("SELECT * FROM suspensions WHERE run_id = ? AND resolved = 0 ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_suspension).collect()
    }

    async fn upsert_memory(&self, run_id: Uuid, text: &str, embedding: Value, metadata: Value) -> Result<Uuid> {
        let memory_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO memory (memory_id, run_id, text, embedding, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(memory_id)
        .bind(run_id)
        .bind(text)
        .bind(serde_json::to_string(&embedding)?)
        .bind(serde_json::to_string(&metadata)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(memory_id)
    }

    async fn list_memory(&self, run_id: Uuid) -> Result<Vec<MemoryRecord>> {
        let rows = sqlx::query("SELECT * FROM memory WHERE run_id = ? ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_memory).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStateStore {
        SqliteStateStore::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn creates_and_fetches_a_run() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", serde_json::json!({"a": 1})).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.workflow_name, "demo");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.inputs, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn completing_a_run_sets_status_and_outputs() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", Value::Null).await.unwrap();
        store.complete_run(run_id, RunStatus::Completed, Some(serde_json::json!({"ok": true}))).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.outputs, Some(serde_json::json!({"ok": true})));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn step_lifecycle_round_trips() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", Value::Null).await.unwrap();
        let exec_id = store.start_step(run_id, "s1", None, 1).await.unwrap();
        store
            .complete_step(exec_id, StepStatus::Completed, Some(serde_json::json!("done")), None, None, None, None)
            .await
            .unwrap();
        let executions = store.list_step_executions(run_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, StepStatus::Completed);
        assert_eq!(executions[0].output, Some(serde_json::json!("done")));
        assert_eq!(executions[0].attempt, 1);
        assert_eq!(executions[0].iteration_index, None);
    }

    #[tokio::test]
    async fn suspension_resolves_with_event_data() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", Value::Null).await.unwrap();
        store.create_suspension(run_id, "ask_step", "human_reply").await.unwrap();
        assert_eq!(store.pending_suspensions(run_id).await.unwrap().len(), 1);

        let resolved = store.resolve_suspension(run_id, "human_reply", serde_json::json!({"answer": "yes"})).await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(store.pending_suspensions(run_id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn mark_transient_does_not_close_the_row() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", Value::Null).await.unwrap();
        let exec_id = store.start_step(run_id, "s1", None, 1).await.unwrap();
        store.mark_transient(exec_id, StepStatus::Running).await.unwrap();
        let executions = store.list_step_executions(run_id).await.unwrap();
        assert_eq!(executions[0].status, StepStatus::Running);
        assert!(executions[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn foreach_iterations_are_queryable_separately_from_the_parent() {
        let store = store().await;
        let run_id = Uuid::new_v4();
        store.create_run(run_id, "demo", Value::Null).await.unwrap();
        let parent = store.start_step(run_id, "fe", None, 1).await.unwrap();
        store.record_foreach_items(parent, &serde_json::json!([1, 2, 3])).await.unwrap();

        for i in 0..3 {
            let child = store.start_step(run_id, "fe", Some(i), 1).await.unwrap();
            store
                .complete_step(child, StepStatus::Completed, Some(serde_json::json!(i)), None, None, None, None)
                .await
                .unwrap();
        }

        assert_eq!(store.count_step_iterations(run_id, "fe").await.unwrap(), 3);
        let iterations = store.get_step_iterations(run_id, "fe", true).await.unwrap();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0].output, Some(serde_json::json!(0)));

        let stripped = store.get_step_iterations(run_id, "fe", false).await.unwrap();
        assert!(stripped[0].output.is_none());

        let main = store.get_main_step(run_id, "fe").await.unwrap().unwrap();
        assert_eq!(main.iteration_index, None);
        assert_eq!(main.output, Some(serde_json::json!({"__foreachItems": [1, 2, 3]})));
        assert_eq!(main.status, StepStatus::Running);
    }
}
