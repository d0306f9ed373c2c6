//! Volume CRD
//!
//! A consumer's claim on space within a drive.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Volume records one persistent volume carved out of a drive.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "vol",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Drive", "type": "string", "jsonPath": ".spec.driveName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.totalCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    #[serde(default)]
    pub node_name: String,

    /// Name of the drive the volume lives on
    pub drive_name: String,

    /// Directory on the drive backing the volume
    #[serde(default)]
    pub host_path: String,

    /// Requested capacity in bytes
    #[serde(default)]
    pub total_capacity: u64,

    #[serde(default)]
    pub conditions: Vec<VolumeCondition>,
}

/// Lifecycle condition of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCondition {
    /// Condition type (Staged, Published, Ready)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// True, False, Unknown
    pub status: String,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}
