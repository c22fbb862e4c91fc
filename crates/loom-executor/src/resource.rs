//! Resource templates: act on a cluster object instead of running a command.

use serde_json::Value;
use tracing::{info, instrument};

use loom_cluster::{Api, DeleteParams, DynamicObject, TaskResult};
use loom_config::{ObjectMeta, Outputs, Parameter, ResourceAction, Template, parse_manifest};
use loom_workflow::NodePhase;
use loom_workflow::contract::{LABEL_WORKFLOW, LABEL_WORKFLOW_NAMESPACE};

use crate::config::AgentConfig;
use crate::error::{ExecutorError, Result};
use crate::wait::ResultWriter;

fn action_name(action: ResourceAction) -> &'static str {
  match action {
    ResourceAction::Create => "create",
    ResourceAction::Apply => "apply",
    ResourceAction::Delete => "delete",
    ResourceAction::Get => "get",
  }
}

/// Apply the template's manifest and evaluate its `jsonPath` outputs against
/// the resulting object.
pub async fn run_resource(
  template: &Template,
  namespace: &str,
  objects: &dyn Api<DynamicObject>,
) -> Result<Outputs> {
  let resource = template.resource.as_ref().ok_or(ExecutorError::Resource {
    action: "parse",
    message: "template has no resource".to_string(),
  })?;
  let action = action_name(resource.action);
  let failed = |message: String| ExecutorError::Resource { action, message };

  let mut manifest: DynamicObject =
    parse_manifest(&resource.manifest).map_err(|e| failed(e.to_string()))?;
  if manifest.metadata.namespace.is_empty() {
    manifest.metadata.namespace = namespace.to_string();
  }
  if manifest.metadata.name.is_empty() {
    return Err(failed("manifest has no metadata.name".to_string()));
  }
  let (ns, name) = (manifest.metadata.namespace.clone(), manifest.metadata.name.clone());

  let object = match resource.action {
    ResourceAction::Create => objects.create(manifest).await?,
    ResourceAction::Apply => match objects.get(&ns, &name).await {
      Ok(current) => {
        manifest.metadata.resource_version = current.metadata.resource_version;
        manifest.metadata.uid = current.metadata.uid;
        objects.replace(manifest).await?
      }
      Err(err) if err.is_not_found() => objects.create(manifest).await?,
      Err(err) => return Err(err.into()),
    },
    ResourceAction::Delete => {
      match objects.delete(&ns, &name, &DeleteParams::immediate()).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
      }
      manifest
    }
    ResourceAction::Get => objects.get(&ns, &name).await?,
  };
  info!(action, kind = %object.kind, object = %name, "resource action applied");

  let value = serde_json::to_value(&object).map_err(|e| failed(e.to_string()))?;
  let mut outputs = Outputs::default();
  for declared in &template.outputs.parameters {
    let Some(path) = declared.value_from.as_ref().and_then(|v| v.json_path.as_deref()) else {
      continue;
    };
    let found = json_path(&value, path).map(|v| match v {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    });
    let fallback = declared
      .value_from
      .as_ref()
      .and_then(|v| v.default.clone())
      .or(declared.default.clone());
    match found.or(fallback) {
      Some(value) => outputs.parameters.push(Parameter::new(&declared.name, value)),
      None => {
        return Err(ExecutorError::MissingOutput {
          kind: "output parameter",
          name: declared.name.clone(),
          path: path.to_string(),
        });
      }
    }
  }
  Ok(outputs)
}

/// Run a resource template and report it the way the wait sidecar would.
/// Returns the exit code to record on the main container.
#[instrument(skip_all, fields(workflow = %config.workflow, node_id = %config.node_id))]
pub async fn execute_resource(
  config: &AgentConfig,
  template: &Template,
  objects: &dyn Api<DynamicObject>,
  writer: &dyn ResultWriter,
) -> Result<i32> {
  let mut result = TaskResult {
    metadata: ObjectMeta::new(&config.namespace, &config.node_id)
      .with_label(LABEL_WORKFLOW, &config.workflow)
      .with_label(LABEL_WORKFLOW_NAMESPACE, &config.namespace),
    ..Default::default()
  };
  let code = match run_resource(template, &config.namespace, objects).await {
    Ok(outputs) => {
      result.outputs = outputs;
      0
    }
    Err(err) => {
      result.phase = Some(NodePhase::Error);
      result.message = Some(err.to_string());
      1
    }
  };
  writer.write(&result).await?;
  Ok(code)
}

/// Evaluate a dotted path such as `{.metadata.name}`, `$.status.items[0]` or
/// `.spec.replicas`.
pub fn json_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
  let path = path.trim();
  let path = path
    .strip_prefix('{')
    .and_then(|p| p.strip_suffix('}'))
    .unwrap_or(path);
  let path = path.strip_prefix('$').unwrap_or(path);
  let mut current = value;
  for segment in path.split('.').filter(|s| !s.is_empty()) {
    let (field, indices) = match segment.find('[') {
      Some(at) => (&segment[..at], &segment[at..]),
      None => (segment, ""),
    };
    if !field.is_empty() {
      current = current.get(field)?;
    }
    for index in indices.split('[').filter(|s| !s.is_empty()) {
      let index: usize = index.strip_suffix(']')?.parse().ok()?;
      current = current.get(index)?;
    }
  }
  Some(current)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use loom_cluster::MemoryCluster;
  use loom_config::{ResourceTemplate, ValueFrom};

  use super::*;

  #[test]
  fn test_json_path_forms() {
    let value = json!({"metadata": {"name": "cm"}, "items": [{"id": 7}]});
    assert_eq!(json_path(&value, "{.metadata.name}"), Some(&json!("cm")));
    assert_eq!(json_path(&value, "$.items[0].id"), Some(&json!(7)));
    assert_eq!(json_path(&value, ".missing"), None);
    assert_eq!(json_path(&value, "items[3]"), None);
  }

  fn template(action: ResourceAction) -> Template {
    Template {
      name: "make-cm".into(),
      resource: Some(ResourceTemplate {
        action,
        manifest: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  mode: fast\n"
          .into(),
      }),
      outputs: Outputs {
        parameters: vec![Parameter {
          name: "mode".into(),
          value_from: Some(ValueFrom {
            json_path: Some("{.data.mode}".into()),
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
  async fn test_create_then_apply_then_get() {
    let cluster = MemoryCluster::new();
    let objects = cluster.objects.as_ref();

    let outputs = run_resource(&template(ResourceAction::Create), "default", objects)
      .await
      .unwrap();
    assert_eq!(outputs.parameters[0].value.as_deref(), Some("fast"));

    let err = run_resource(&template(ResourceAction::Create), "default", objects)
      .await
      .unwrap_err();
    assert!(matches!(err, ExecutorError::Cluster(e) if e.is_already_exists()));

    run_resource(&template(ResourceAction::Apply), "default", objects)
      .await
      .unwrap();
    let got = run_resource(&template(ResourceAction::Get), "default", objects)
      .await
      .unwrap();
    assert_eq!(got.parameters[0].value.as_deref(), Some("fast"));

    run_resource(&template(ResourceAction::Delete), "default", objects)
      .await
      .unwrap();
    assert!(objects.get("default", "settings").await.unwrap_err().is_not_found());
  }
}
