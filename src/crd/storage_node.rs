//! StorageNode CRD
//!
//! Represents a node's block device inventory as last probed by the agent,
//! plus a flag an administrator sets to ask for a fresh probe.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// StorageNode CRD
// =============================================================================

/// StorageNode tracks the devices visible on one cluster node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "StorageNode",
    plural = "storagenodes",
    shortname = "sn",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Refresh", "type": "boolean", "jsonPath": ".spec.refresh"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Name of the Kubernetes node
    pub node_name: String,

    /// Set to request a re-probe; cleared by the agent
    #[serde(default)]
    pub refresh: bool,

    /// Devices found on the last probe
    #[serde(default)]
    pub devices: Vec<NodeDevice>,

    /// Last probe time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Inventory entry for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDevice {
    /// Device name, e.g. sdb
    pub name: String,

    /// Identity fingerprint at probe time
    pub id: String,

    pub major_minor: String,

    pub size: u64,

    #[serde(default)]
    pub make: String,

    #[serde(default)]
    pub fs_type: String,

    #[serde(default)]
    pub fs_uuid: String,

    /// Why the device cannot be initialized; empty when it can
    #[serde(default)]
    pub denied_reason: String,
}

impl NodeDevice {
    pub fn is_eligible(&self) -> bool {
        self.denied_reason.is_empty()
    }
}
