//! Init configuration file
//!
//! Administrators edit a YAML listing of each node's devices, select the
//! ones to initialize, and submit it as an [`InitRequest`]:
//!
//! ```yaml
//! version: v1
//! nodes:
//!   - name: node-1
//!     drives:
//!       - id: "8:16$ud8mwCjPTH8147TysmiQ2GGLpffqUht6bz7NtHqReJo="
//!         name: sdb
//!         majorMinor: "8:16"
//!         fs: xfs
//!         select: "yes"
//! ```

use crate::consts::REQUESTOR_LABEL_KEY;
use crate::crd::{InitDevice, InitRequest, InitRequestSpec};
use crate::error::{Error, Result};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const INIT_CONFIG_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub drives: Vec<DriveInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveInfo {
    pub id: String,
    pub name: String,
    pub major_minor: String,
    /// Filesystem currently on the device, if any
    #[serde(default)]
    pub fs: String,
    #[serde(default = "selected")]
    pub select: String,
}

fn selected() -> String {
    "yes".to_string()
}

impl DriveInfo {
    pub fn is_selected(&self) -> bool {
        self.select.eq_ignore_ascii_case("yes")
    }
}

impl InitConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: InitConfig = serde_yaml::from_str(content)?;
        if config.version != INIT_CONFIG_VERSION {
            return Err(Error::Configuration(format!(
                "unsupported init config version {:?}",
                config.version
            )));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Build a request for the selected drives.
    ///
    /// Drives that already carry a filesystem are forced; nodes left with
    /// nothing selected are omitted.
    pub fn to_request(&self, requestor: &str) -> InitRequest {
        let mut spec = InitRequestSpec::default();
        for node in &self.nodes {
            let devices: Vec<InitDevice> = node
                .drives
                .iter()
                .filter(|drive| drive.is_selected())
                .map(|drive| InitDevice {
                    id: drive.id.clone(),
                    name: drive.name.clone(),
                    major_minor: drive.major_minor.clone(),
                    force: !drive.fs.is_empty(),
                })
                .collect();
            if !devices.is_empty() {
                spec.request.insert(node.name.clone(), devices);
            }
        }

        let mut request = InitRequest::new(&uuid::Uuid::new_v4().to_string(), spec);
        request
            .labels_mut()
            .insert(REQUESTOR_LABEL_KEY.to_string(), requestor.to_string());
        request
    }
}
