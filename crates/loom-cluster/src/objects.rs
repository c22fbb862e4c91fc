use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use loom_config::{ObjectMeta, Outputs};
use loom_workflow::{NodePhase, ResourcesDuration};

/// Outcome record written by the executor agent, named after the node id
/// and labelled with the workflow name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default, skip_serializing_if = "Outputs::is_empty")]
  pub outputs: Outputs,
  /// Set when the agent already knows the outcome (e.g. `Error` for a missing
  /// output path).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phase: Option<NodePhase>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "ResourcesDuration::is_empty")]
  pub resources_duration: ResourcesDuration,
}

/// A human-visible status transition recorded against an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
  #[serde(default)]
  pub metadata: ObjectMeta,
  pub involved_object: ObjectReference,
  pub reason: String,
  #[serde(default)]
  pub message: String,
  #[serde(rename = "type", default)]
  pub event_type: EventType,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub first_timestamp: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_timestamp: Option<DateTime<Utc>>,
  #[serde(default)]
  pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
  pub kind: String,
  pub namespace: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub uid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
  #[default]
  Normal,
  Warning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub data: BTreeMap<String, String>,
}

/// Arbitrary object created by resource templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
  #[serde(default)]
  pub api_version: String,
  #[serde(default)]
  pub kind: String,
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(flatten)]
  pub data: Map<String, Value>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dynamic_object_keeps_unknown_fields() {
    let obj: DynamicObject = serde_json::from_str(
      r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"cm"},"data":{"k":"v"}}"#,
    )
    .unwrap();
    assert_eq!(obj.kind, "ConfigMap");
    assert_eq!(obj.metadata.name, "cm");
    assert_eq!(obj.data["data"]["k"], "v");

    let back = serde_json::to_value(&obj).unwrap();
    assert_eq!(back["data"]["k"], "v");
    assert_eq!(back["apiVersion"], "v1");
  }
}
