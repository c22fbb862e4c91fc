//! Output capture after the command exits.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use loom_config::{Parameter, Template};

use crate::error::{ExecutorError, Result, io_err};
use crate::paths::AgentPaths;
use crate::tarball;

/// Copy declared output parameters into `outputs/parameters` and archive
/// declared output artifacts into `outputs/artifacts`.
///
/// With `strict`, a declared output that is missing and has no default (or
/// is not optional) fails the capture. A failed command is captured
/// leniently: whatever exists is kept.
pub async fn capture_outputs(template: &Template, paths: &AgentPaths, strict: bool) -> Result<()> {
  for parameter in &template.outputs.parameters {
    let Some(source) = parameter.value_from.as_ref().and_then(|v| v.path.as_deref()) else {
      continue;
    };
    let value = match tokio::fs::read_to_string(source).await {
      Ok(text) => text.trim_end().to_string(),
      Err(err) if err.kind() == ErrorKind::NotFound => match fallback(parameter) {
        Some(default) => default.to_string(),
        None if strict => {
          return Err(ExecutorError::MissingOutput {
            kind: "output parameter",
            name: parameter.name.clone(),
            path: source.to_string(),
          });
        }
        None => continue,
      },
      Err(err) => return Err(io_err(format!("read output parameter {}", parameter.name))(err)),
    };
    let dest = paths.parameter(&parameter.name);
    write_file(&dest, value.as_bytes()).await?;
    debug!(parameter = %parameter.name, bytes = value.len(), "captured output parameter");
  }

  for artifact in &template.outputs.artifacts {
    let Some(source) = artifact.path.as_deref() else {
      continue;
    };
    let source = PathBuf::from(source);
    if !source.exists() {
      if strict && !artifact.optional {
        return Err(ExecutorError::MissingOutput {
          kind: "output artifact",
          name: artifact.name.clone(),
          path: source.display().to_string(),
        });
      }
      continue;
    }
    let dest = paths.artifact(&artifact.name);
    tokio::task::spawn_blocking(move || tarball::pack(&source, &dest))
      .await
      .map_err(|e| std::io::Error::other(e.to_string()))
      .and_then(|r| r)
      .map_err(io_err(format!("archive output artifact {}", artifact.name)))?;
    debug!(artifact = %artifact.name, "archived output artifact");
  }
  Ok(())
}

fn fallback(parameter: &Parameter) -> Option<&str> {
  parameter
    .value_from
    .as_ref()
    .and_then(|v| v.default.as_deref())
    .or(parameter.default.as_deref())
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(io_err(format!("create {}", parent.display())))?;
  }
  tokio::fs::write(path, contents)
    .await
    .map_err(io_err(format!("write {}", path.display())))
}

#[cfg(test)]
mod tests {
  use loom_config::{Artifact, Outputs, ValueFrom};

  use super::*;

  fn from_path(name: &str, path: &Path, default: Option<&str>) -> Parameter {
    Parameter {
      name: name.into(),
      value_from: Some(ValueFrom {
        path: Some(path.display().to_string()),
        default: default.map(String::from),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_parameters_are_trimmed_and_defaulted() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AgentPaths::new(dir.path().join("agent"));
    std::fs::write(dir.path().join("answer"), "42\n").unwrap();
    let template = Template {
      outputs: Outputs {
        parameters: vec![
          from_path("answer", &dir.path().join("answer"), None),
          from_path("fallback", &dir.path().join("missing"), Some("none")),
        ],
        ..Default::default()
      },
      ..Default::default()
    };

    capture_outputs(&template, &paths, true).await.unwrap();

    assert_eq!(std::fs::read_to_string(paths.parameter("answer")).unwrap(), "42");
    assert_eq!(std::fs::read_to_string(paths.parameter("fallback")).unwrap(), "none");
  }

  #[tokio::test]
  async fn test_missing_output_fails_only_when_strict() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AgentPaths::new(dir.path().join("agent"));
    let template = Template {
      outputs: Outputs {
        parameters: vec![from_path("answer", &dir.path().join("missing"), None)],
        artifacts: vec![Artifact {
          name: "report".into(),
          path: Some(dir.path().join("report").display().to_string()),
          optional: true,
          ..Default::default()
        }],
        ..Default::default()
      },
      ..Default::default()
    };

    let err = capture_outputs(&template, &paths, true).await.unwrap_err();
    assert!(matches!(err, ExecutorError::MissingOutput { name, .. } if name == "answer"));

    capture_outputs(&template, &paths, false).await.unwrap();
    assert!(!paths.parameter("answer").exists());
    assert!(!paths.artifact("report").exists());
  }
}
