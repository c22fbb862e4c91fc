use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

use loom_workflow::Workflow;

/// A completed workflow as stored in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ArchivedWorkflow {
  pub uid: String,
  pub namespace: String,
  pub name: String,
  pub phase: String,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub archived_at: DateTime<Utc>,
  pub workflow: Json<Workflow>,
}
