//! The frozen template as it travels from controller to agent.

use std::path::Path;

use loom_config::Template;
use loom_workflow::contract::{OFFLOAD_KEY, OFFLOADED};

use crate::error::{ExecutorError, Result, io_err};
use crate::paths::AgentPaths;

pub fn encode(template: &Template) -> Result<String> {
  serde_json::to_string(template).map_err(|e| ExecutorError::Template {
    message: e.to_string(),
  })
}

pub fn decode(payload: &str) -> Result<Template> {
  serde_json::from_str(payload).map_err(|e| ExecutorError::Template {
    message: e.to_string(),
  })
}

/// Resolve the env payload, following the offload sentinel to the mounted
/// config map.
pub async fn resolve(payload: Option<&str>, mount: Option<&Path>) -> Result<Template> {
  match payload {
    Some(OFFLOADED) => {
      let mount = mount.ok_or_else(|| ExecutorError::Template {
        message: "payload offloaded but no template mount given".to_string(),
      })?;
      let path = mount.join(OFFLOAD_KEY);
      let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(io_err(format!("read offloaded template {}", path.display())))?;
      decode(&text)
    }
    Some(text) => decode(text),
    None => Err(ExecutorError::Template {
      message: "no template payload".to_string(),
    }),
  }
}

pub async fn write(paths: &AgentPaths, template: &Template) -> Result<()> {
  let path = paths.template();
  tokio::fs::write(&path, encode(template)?)
    .await
    .map_err(io_err(format!("write {}", path.display())))
}

pub async fn read(paths: &AgentPaths) -> Result<Template> {
  let path = paths.template();
  let text = tokio::fs::read_to_string(&path)
    .await
    .map_err(io_err(format!("read {}", path.display())))?;
  decode(&text)
}

#[cfg(test)]
mod tests {
  use loom_config::{Container, Outputs, Parameter, ValueFrom};

  use super::*;

  fn template() -> Template {
    Template {
      name: "hello".into(),
      container: Some(Container {
        image: "alpine".into(),
        command: vec!["echo".into(), "hello".into()],
        ..Default::default()
      }),
      outputs: Outputs {
        parameters: vec![Parameter {
          name: "out".into(),
          value_from: Some(ValueFrom {
            path: Some("/tmp/out".into()),
            ..Default::default()
          }),
          ..Default::default()
        }],
        ..Default::default()
      },
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_written_template_reads_back_identical() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AgentPaths::new(dir.path());
    write(&paths, &template()).await.unwrap();
    assert_eq!(read(&paths).await.unwrap(), template());
  }

  #[tokio::test]
  async fn test_offloaded_payload_reads_mount() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(OFFLOAD_KEY), encode(&template()).unwrap()).unwrap();
    let resolved = resolve(Some(OFFLOADED), Some(dir.path())).await.unwrap();
    assert_eq!(resolved.name, "hello");

    let err = resolve(Some(OFFLOADED), None).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Template { .. }));
  }
}
