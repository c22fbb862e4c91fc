use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{ByteStream, Error, Store, check_key};

/// Blobs as files under `{base_path}/{key}`.
///
/// Writes land in a sibling `.partial` file and are renamed into place, so a
/// reader never sees a half-written artifact.
pub struct FsStore {
  base_path: PathBuf,
}

impl FsStore {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn key_to_path(&self, key: &str) -> Result<PathBuf, Error> {
    check_key(key)?;
    Ok(self.base_path.join(key))
  }
}

fn not_found(key: &str, e: std::io::Error) -> Error {
  if e.kind() == std::io::ErrorKind::NotFound {
    Error::NotFound(key.to_string())
  } else {
    Error::Io(e)
  }
}

#[async_trait]
impl Store for FsStore {
  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    let path = self.key_to_path(key)?;
    let file = File::open(&path).await.map_err(|e| not_found(key, e))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn put(&self, key: &str, mut data: ByteStream, content_type: &str) -> Result<(), Error> {
    let path = self.key_to_path(key)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let partial = path.with_extension("partial");
    let mut file = File::create(&partial).await?;
    let mut size = 0usize;
    while let Some(chunk) = data.next().await {
      let bytes = match chunk {
        Ok(bytes) => bytes,
        Err(e) => {
          drop(file);
          let _ = fs::remove_file(&partial).await;
          return Err(e);
        }
      };
      size += bytes.len();
      file.write_all(&bytes).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&partial, &path).await?;

    debug!(key, size, content_type, "artifact stored");
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), Error> {
    let path = self.key_to_path(key)?;
    fs::remove_file(&path).await.map_err(|e| not_found(key, e))
  }

  async fn exists(&self, key: &str) -> Result<bool, Error> {
    let path = self.key_to_path(key)?;
    Ok(fs::try_exists(&path).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn body(parts: &[&'static [u8]]) -> ByteStream {
    let chunks: Vec<Result<Bytes, Error>> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
    Box::pin(futures::stream::iter(chunks))
  }

  async fn collect(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
      out.extend_from_slice(&chunk.unwrap());
    }
    out
  }

  #[tokio::test]
  async fn test_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());

    store.put("a/b.tgz", body(&[b"he", b"llo"]), "application/gzip").await.unwrap();
    assert_eq!(collect(store.get("a/b.tgz").await.unwrap()).await, b"hello");
    assert!(!dir.path().join("a/b.partial").exists());

    store.delete("a/b.tgz").await.unwrap();
    assert!(matches!(store.get("a/b.tgz").await, Err(Error::NotFound(_))));
    assert!(matches!(store.delete("a/b.tgz").await, Err(Error::NotFound(_))));
  }

  #[tokio::test]
  async fn test_put_replaces_existing() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    store.put("k.tgz", body(&[b"old"]), "").await.unwrap();
    store.put("k.tgz", body(&[b"new"]), "").await.unwrap();
    assert_eq!(collect(store.get("k.tgz").await.unwrap()).await, b"new");
  }

  #[tokio::test]
  async fn test_failed_stream_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let chunks: Vec<Result<Bytes, Error>> = vec![
      Ok(Bytes::from_static(b"part")),
      Err(Error::Io(std::io::Error::other("reset"))),
    ];
    let err = store.put("k.tgz", Box::pin(futures::stream::iter(chunks)), "").await;
    assert!(err.is_err());
    assert!(!store.exists("k.tgz").await.unwrap());
    assert!(!dir.path().join("k.partial").exists());
  }

  #[tokio::test]
  async fn test_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    assert!(matches!(store.get("../x").await, Err(Error::InvalidKey(_))));
  }
}
