use std::path::Path;

use tracing::{debug, info, instrument};

use loom_artifact::{Store, download_file};
use loom_config::Template;

use crate::config::AgentConfig;
use crate::error::{ExecutorError, Result, io_err};
use crate::paths::AgentPaths;
use crate::{payload, tarball};

/// Stage everything the main container needs on the shared volume: the
/// template, the script source, the agent binary (when `binary` is given)
/// and the input artifacts.
#[instrument(skip_all, fields(workflow = %config.workflow, node_id = %config.node_id))]
pub async fn run_init(
  config: &AgentConfig,
  store: Option<&dyn Store>,
  binary: Option<&Path>,
) -> Result<Template> {
  let paths = config.paths();
  for dir in [paths.root().to_path_buf(), paths.parameters(), paths.artifacts()] {
    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(io_err(format!("create {}", dir.display())))?;
  }

  let template = payload::resolve(config.template.as_deref(), config.template_mount.as_deref()).await?;
  payload::write(&paths, &template).await?;

  if let Some(script) = &template.script {
    let path = paths.script();
    tokio::fs::write(&path, &script.source)
      .await
      .map_err(io_err(format!("write {}", path.display())))?;
  }

  if let Some(binary) = binary {
    let dest = paths.binary();
    tokio::fs::copy(binary, &dest)
      .await
      .map_err(io_err(format!("stage agent binary to {}", dest.display())))?;
  }

  stage_inputs(&template, &paths, store).await?;
  info!(template = %template.name, "pod staged");
  Ok(template)
}

async fn stage_inputs(template: &Template, paths: &AgentPaths, store: Option<&dyn Store>) -> Result<()> {
  for artifact in &template.inputs.artifacts {
    let Some(path) = &artifact.path else {
      continue;
    };
    let Some(key) = &artifact.key else {
      if artifact.optional {
        continue;
      }
      return Err(ExecutorError::UnboundArtifact {
        name: artifact.name.clone(),
      });
    };
    let store = store.ok_or(ExecutorError::NoRepository)?;

    let download = paths.root().join(format!(".input-{}.tgz", artifact.name));
    match download_file(store, key, &download).await {
      Ok(bytes) => debug!(artifact = %artifact.name, bytes, "input artifact downloaded"),
      Err(loom_artifact::Error::NotFound(_)) if artifact.optional => continue,
      Err(err) => return Err(err.into()),
    }

    let dest = Path::new(path).to_path_buf();
    let archive = download.clone();
    tokio::task::spawn_blocking(move || tarball::unpack(&archive, &dest))
      .await
      .map_err(|e| std::io::Error::other(e.to_string()))
      .and_then(|r| r)
      .map_err(io_err(format!("unpack input artifact {}", artifact.name)))?;
    let _ = tokio::fs::remove_file(&download).await;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use loom_artifact::{FsStore, upload_file};
  use loom_config::{Artifact, Inputs, Script};

  use super::*;

  fn config(root: &Path, template: &Template) -> AgentConfig {
    let mut config = AgentConfig::new(root, "default", "wf", "wf-0123456789");
    config.template = Some(payload::encode(template).unwrap());
    config
  }

  #[tokio::test]
  async fn test_init_stages_template_and_script() {
    let dir = tempfile::tempdir().unwrap();
    let template = Template {
      name: "gen".into(),
      script: Some(Script {
        source: "echo 42\n".into(),
        ..Default::default()
      }),
      ..Default::default()
    };

    let staged = run_init(&config(dir.path(), &template), None, None).await.unwrap();

    assert_eq!(staged, template);
    let paths = AgentPaths::new(dir.path());
    assert_eq!(payload::read(&paths).await.unwrap(), template);
    assert_eq!(std::fs::read_to_string(paths.script()).unwrap(), "echo 42\n");
    assert!(paths.parameters().is_dir());
  }

  #[tokio::test]
  async fn test_init_unpacks_input_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path().join("repo"));
    let source = dir.path().join("hello.txt");
    std::fs::write(&source, "hello world").unwrap();
    let archive = dir.path().join("hello.tgz");
    tarball::pack(&source, &archive).unwrap();
    upload_file(&store, "default/wf/wf-a/out.tgz", &archive).await.unwrap();

    let dest = dir.path().join("inputs/message");
    let template = Template {
      name: "consume".into(),
      inputs: Inputs {
        artifacts: vec![Artifact {
          name: "message".into(),
          path: Some(dest.display().to_string()),
          key: Some("default/wf/wf-a/out.tgz".into()),
          ..Default::default()
        }],
        ..Default::default()
      },
      ..Default::default()
    };

    run_init(&config(&dir.path().join("agent"), &template), Some(&store), None)
      .await
      .unwrap();
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello world");
  }

  #[tokio::test]
  async fn test_init_rejects_unbound_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let template = Template {
      name: "consume".into(),
      inputs: Inputs {
        artifacts: vec![Artifact {
          name: "message".into(),
          path: Some("/tmp/never".into()),
          ..Default::default()
        }],
        ..Default::default()
      },
      ..Default::default()
    };

    let err = run_init(&config(dir.path(), &template), None, None).await.unwrap_err();
    assert!(matches!(err, ExecutorError::UnboundArtifact { name } if name == "message"));
  }
}
