//! Loom Archive
//!
//! Completed workflows are copied here when they reach a terminal phase, so
//! their status outlives the cluster object once TTL or retention deletes
//! it. Rows expire after the configured archive TTL.

mod sqlite;
mod types;

pub use sqlite::WorkflowArchive;
pub use types::ArchivedWorkflow;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("workflow {0} has no uid")]
  MissingUid(String),
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
