//! Gzipped tar archives for artifacts.
//!
//! A file is archived as a single entry under its own name; a directory is
//! archived with its contents at the root. Unpacking mirrors that: a
//! single-file archive lands at the destination path itself, anything else
//! becomes a directory there.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};

pub fn pack(source: &Path, archive: &Path) -> io::Result<()> {
  if let Some(parent) = archive.parent() {
    fs::create_dir_all(parent)?;
  }
  let file = File::create(archive)?;
  let mut tar = Builder::new(GzEncoder::new(file, Compression::default()));
  if source.is_dir() {
    tar.append_dir_all(".", source)?;
  } else {
    let name = source
      .file_name()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no file name"))?;
    tar.append_path_with_name(source, name)?;
  }
  tar.into_inner()?.finish()?;
  Ok(())
}

pub fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
  let parent = dest.parent().unwrap_or(Path::new("."));
  fs::create_dir_all(parent)?;
  let name = dest
    .file_name()
    .and_then(|n| n.to_str())
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no file name"))?;
  let staging = parent.join(format!(".{name}.unpack"));
  if staging.exists() {
    fs::remove_dir_all(&staging)?;
  }
  fs::create_dir_all(&staging)?;

  let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
  tar.unpack(&staging)?;

  let entries: Vec<_> = fs::read_dir(&staging)?.collect::<io::Result<_>>()?;
  if let [only] = entries.as_slice()
    && only.file_type()?.is_file()
  {
    fs::rename(only.path(), dest)?;
    fs::remove_dir(&staging)?;
  } else {
    if dest.exists() {
      fs::remove_dir_all(dest)?;
    }
    fs::rename(&staging, dest)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_file_unpacks_to_destination_path() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("message.txt");
    fs::write(&source, "hi there").unwrap();
    let archive = dir.path().join("out/message.tgz");

    pack(&source, &archive).unwrap();
    let dest = dir.path().join("inputs/msg");
    unpack(&archive, &dest).unwrap();

    assert_eq!(fs::read_to_string(&dest).unwrap(), "hi there");
  }

  #[test]
  fn test_directory_unpacks_as_directory() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("data");
    fs::create_dir_all(source.join("nested")).unwrap();
    fs::write(source.join("a.txt"), "a").unwrap();
    fs::write(source.join("nested/b.txt"), "b").unwrap();
    let archive = dir.path().join("data.tgz");

    pack(&source, &archive).unwrap();
    let dest = dir.path().join("restored");
    unpack(&archive, &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
    assert_eq!(fs::read_to_string(dest.join("nested/b.txt")).unwrap(), "b");
  }
}
