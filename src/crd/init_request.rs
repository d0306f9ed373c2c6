//! InitRequest CRD
//!
//! A node-addressed batch job naming the devices to format, mount and
//! register. Each addressed node writes exactly one result into `response`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// InitRequest asks one or more nodes to initialize devices.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "InitRequest",
    plural = "initrequests",
    shortname = "ir",
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct InitRequestSpec {
    /// Devices to initialize, keyed by node
    #[serde(default)]
    pub request: BTreeMap<String, Vec<InitDevice>>,

    /// Results, keyed by node
    #[serde(default)]
    pub response: BTreeMap<String, InitResult>,
}

/// A device named in an init request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDevice {
    /// Identity fingerprint the requestor saw
    pub id: String,

    pub name: String,

    pub major_minor: String,

    /// Overwrite an existing filesystem
    #[serde(default)]
    pub force: bool,
}

/// Result of one node's batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub completed: bool,

    #[serde(default)]
    pub devices: Vec<InitDeviceResult>,

    /// Request-level error aborting the whole batch
    #[serde(default)]
    pub error: String,
}

/// Outcome for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDeviceResult {
    pub name: String,

    #[serde(default)]
    pub error: String,
}

impl InitDeviceResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_empty()
    }
}

impl InitRequestSpec {
    /// True once every addressed node has written a completed result
    pub fn is_complete(&self) -> bool {
        self.request.keys().all(|node| {
            self.response
                .get(node)
                .map(|result| result.completed)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_complete_requires_every_node() {
        let mut spec = InitRequestSpec::default();
        spec.request.insert("node-1".into(), vec![InitDevice::default()]);
        spec.request.insert("node-2".into(), vec![InitDevice::default()]);
        assert!(!spec.is_complete());

        spec.response.insert(
            "node-1".into(),
            InitResult {
                completed: true,
                ..Default::default()
            },
        );
        assert!(!spec.is_complete());

        spec.response.insert(
            "node-2".into(),
            InitResult {
                completed: true,
                error: "no devices".into(),
                ..Default::default()
            },
        );
        assert!(spec.is_complete());
    }
}
