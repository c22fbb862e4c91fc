//! Loom Artifact
//!
//! Artifact repository shared by the executor agent and the controller.
//! Output artifacts are packed by the agent and stored under
//! `{namespace}/{workflow}/{node}/{artifact}.tgz`; downstream steps fetch them
//! by the same key.
//!
//! The [`Store`] trait is the backend seam. [`FsStore`] keeps blobs on a
//! shared directory, which is what local mode uses.

mod fs;

pub use fs::FsStore;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("artifact not found: {0}")]
  NotFound(String),

  #[error("invalid artifact key `{0}`")]
  InvalidKey(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
  async fn get(&self, key: &str) -> Result<ByteStream, Error>;

  /// Replaces any blob already stored under `key`.
  async fn put(&self, key: &str, data: ByteStream, content_type: &str) -> Result<(), Error>;

  async fn delete(&self, key: &str) -> Result<(), Error>;

  async fn exists(&self, key: &str) -> Result<bool, Error>;
}

/// Repository key for a node's output artifact.
pub fn artifact_key(namespace: &str, workflow: &str, node_id: &str, artifact: &str) -> String {
  format!("{namespace}/{workflow}/{node_id}/{artifact}.tgz")
}

/// Keys are relative, `/`-separated and never climb out of the store.
pub fn check_key(key: &str) -> Result<(), Error> {
  let bad = key.is_empty()
    || key.starts_with('/')
    || key.contains('\\')
    || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
  if bad {
    return Err(Error::InvalidKey(key.to_string()));
  }
  Ok(())
}

/// Stream a local file into the store.
pub async fn upload_file(store: &dyn Store, key: &str, path: &Path) -> Result<(), Error> {
  let file = tokio::fs::File::open(path).await?;
  let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
  store.put(key, Box::pin(stream), "application/gzip").await
}

/// Stream a stored blob into a local file, creating parent directories.
pub async fn download_file(store: &dyn Store, key: &str, path: &Path) -> Result<u64, Error> {
  let mut stream = store.get(key).await?;
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  let mut file = tokio::fs::File::create(path).await?;
  let mut written = 0u64;
  while let Some(chunk) = stream.next().await {
    let bytes = chunk?;
    written += bytes.len() as u64;
    file.write_all(&bytes).await?;
  }
  file.flush().await?;
  Ok(written)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_artifact_key_layout() {
    assert_eq!(
      artifact_key("default", "wf", "wf-0123456789", "out"),
      "default/wf/wf-0123456789/out.tgz"
    );
  }

  #[test]
  fn test_check_key_rejects_escapes() {
    assert!(check_key("a/b/c.tgz").is_ok());
    for bad in ["", "/abs", "a/../b", "a//b", "./a", "a\\b"] {
      assert!(check_key(bad).is_err(), "{bad}");
    }
  }

  #[tokio::test]
  async fn test_upload_then_download_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path().join("repo"));

    let source = dir.path().join("source.tgz");
    tokio::fs::write(&source, b"packed bytes").await.unwrap();
    upload_file(&store, "ns/wf/node/out.tgz", &source).await.unwrap();
    assert!(store.exists("ns/wf/node/out.tgz").await.unwrap());

    let target = dir.path().join("nested/target.tgz");
    let n = download_file(&store, "ns/wf/node/out.tgz", &target).await.unwrap();
    assert_eq!(n, 12);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"packed bytes");
  }
}
