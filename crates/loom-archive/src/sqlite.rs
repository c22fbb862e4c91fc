use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

use loom_workflow::Workflow;

use crate::types::ArchivedWorkflow;
use crate::{ArchiveError, Result};

/// SQLite-backed workflow archive.
#[derive(Clone)]
pub struct WorkflowArchive {
  pool: SqlitePool,
}

impl WorkflowArchive {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and apply migrations.
  pub async fn connect(url: &str) -> Result<Self> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // An in-memory database lives and dies with its connection.
    let max = if url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
      .max_connections(max)
      .connect_with(options)
      .await?;
    let archive = Self::new(pool);
    archive.migrate().await?;
    Ok(archive)
  }

  pub async fn migrate(&self) -> Result<()> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  /// Insert or refresh the archived copy of `workflow`.
  pub async fn archive(&self, workflow: &Workflow, now: DateTime<Utc>) -> Result<()> {
    if workflow.metadata.uid.is_empty() {
      return Err(ArchiveError::MissingUid(workflow.key()));
    }
    sqlx::query(
      r#"
      INSERT INTO archived_workflows (uid, namespace, name, phase, started_at, finished_at, archived_at, workflow)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (uid) DO UPDATE SET
        phase = excluded.phase,
        finished_at = excluded.finished_at,
        archived_at = excluded.archived_at,
        workflow = excluded.workflow
      "#,
    )
    .bind(&workflow.metadata.uid)
    .bind(workflow.namespace())
    .bind(workflow.name())
    .bind(workflow.status.phase.as_str())
    .bind(workflow.status.started_at)
    .bind(workflow.status.finished_at)
    .bind(now)
    .bind(Json(workflow))
    .execute(&self.pool)
    .await?;
    debug!(workflow = %workflow.key(), "workflow archived");
    Ok(())
  }

  pub async fn get(&self, uid: &str) -> Result<Option<ArchivedWorkflow>> {
    let row = sqlx::query_as(
      r#"
      SELECT uid, namespace, name, phase, started_at, finished_at, archived_at, workflow
      FROM archived_workflows
      WHERE uid = ?
      "#,
    )
    .bind(uid)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row)
  }

  /// Archived workflows of a namespace, most recently finished first.
  pub async fn list(&self, namespace: &str) -> Result<Vec<ArchivedWorkflow>> {
    let rows = sqlx::query_as(
      r#"
      SELECT uid, namespace, name, phase, started_at, finished_at, archived_at, workflow
      FROM archived_workflows
      WHERE namespace = ?
      ORDER BY finished_at DESC
      "#,
    )
    .bind(namespace)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows)
  }

  /// Drop rows archived before `cutoff`. Returns how many were removed.
  pub async fn expire(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let done = sqlx::query("DELETE FROM archived_workflows WHERE archived_at < ?")
      .bind(cutoff)
      .execute(&self.pool)
      .await?;
    Ok(done.rows_affected())
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use loom_config::{ObjectMeta, WorkflowSpec};
  use loom_workflow::WorkflowPhase;

  use super::*;

  fn finished(name: &str, uid: &str, finished_secs: i64) -> Workflow {
    let mut workflow = Workflow {
      metadata: ObjectMeta::new("default", name),
      spec: WorkflowSpec {
        entrypoint: "main".into(),
        ..Default::default()
      },
      status: Default::default(),
    };
    workflow.metadata.uid = uid.into();
    workflow.status.phase = WorkflowPhase::Succeeded;
    workflow.status.started_at = DateTime::from_timestamp(finished_secs - 10, 0);
    workflow.status.finished_at = DateTime::from_timestamp(finished_secs, 0);
    workflow
  }

  #[tokio::test]
  async fn test_archive_and_read_back() {
    let archive = WorkflowArchive::connect("sqlite::memory:").await.unwrap();
    let now = DateTime::from_timestamp(2_000_000_000, 0).unwrap();
    let workflow = finished("wf", "uid-1", 1_999_999_000);

    archive.archive(&workflow, now).await.unwrap();
    archive.archive(&workflow, now).await.unwrap();

    let row = archive.get("uid-1").await.unwrap().unwrap();
    assert_eq!(row.phase, "Succeeded");
    assert_eq!(row.workflow.0, workflow);
    assert_eq!(archive.list("default").await.unwrap().len(), 1);
    assert!(archive.get("uid-2").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_list_orders_by_finish_and_expire_prunes() {
    let archive = WorkflowArchive::connect("sqlite::memory:").await.unwrap();
    let now = DateTime::from_timestamp(2_000_000_000, 0).unwrap();
    archive
      .archive(&finished("old", "uid-old", 1_000), now - Duration::days(10))
      .await
      .unwrap();
    archive
      .archive(&finished("new", "uid-new", 2_000), now)
      .await
      .unwrap();

    let names: Vec<_> = archive
      .list("default")
      .await
      .unwrap()
      .into_iter()
      .map(|row| row.name)
      .collect();
    assert_eq!(names, vec!["new", "old"]);

    assert_eq!(archive.expire(now - Duration::days(1)).await.unwrap(), 1);
    assert!(archive.get("uid-old").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_archive_requires_uid() {
    let archive = WorkflowArchive::connect("sqlite::memory:").await.unwrap();
    let mut workflow = finished("wf", "", 10);
    workflow.metadata.uid.clear();
    let err = archive.archive(&workflow, Utc::now()).await.unwrap_err();
    assert!(matches!(err, ArchiveError::MissingUid(_)));
  }
}
