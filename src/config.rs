//! Agent configuration
//!
//! Built by `main` from command-line arguments; everything downstream takes
//! its settings from here rather than from the environment.

use crate::consts::{
    APP_NAME, DEV_DIR, MOUNT_ROOT_DIR, PROCFS_DIR, SYSFS_DIR, TOPOLOGY_IDENTITY_KEY,
    TOPOLOGY_NODE_KEY, TOPOLOGY_RACK_KEY, TOPOLOGY_REGION_KEY, TOPOLOGY_ZONE_KEY, UDEV_DATA_DIR,
};
use crate::controller::ControllerConfig;
use crate::device::HostPaths;
use crate::error::{Error, Result};
use crate::host::DriveLayout;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings of one agent process
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Kubernetes node this agent runs on
    pub node_id: String,
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,

    pub sysfs_dir: PathBuf,
    pub procfs_dir: PathBuf,
    pub udev_data_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub mount_root: PathBuf,

    /// Format with XFS reflink support
    pub reflink: bool,

    pub workers: usize,
    pub resync_period: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            identity: APP_NAME.to_string(),
            rack: "default".to_string(),
            zone: "default".to_string(),
            region: "default".to_string(),
            sysfs_dir: PathBuf::from(SYSFS_DIR),
            procfs_dir: PathBuf::from(PROCFS_DIR),
            udev_data_dir: PathBuf::from(UDEV_DATA_DIR),
            dev_dir: PathBuf::from(DEV_DIR),
            mount_root: PathBuf::from(MOUNT_ROOT_DIR),
            reflink: true,
            workers: 4,
            resync_period: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Configuration("node id must not be empty".into()));
        }
        if self.identity.trim().is_empty() {
            return Err(Error::Configuration("identity must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("at least one worker is required".into()));
        }
        Ok(())
    }

    /// Topology labels stamped on this node's drives
    pub fn topology(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TOPOLOGY_IDENTITY_KEY.to_string(), self.identity.clone()),
            (TOPOLOGY_RACK_KEY.to_string(), self.rack.clone()),
            (TOPOLOGY_ZONE_KEY.to_string(), self.zone.clone()),
            (TOPOLOGY_REGION_KEY.to_string(), self.region.clone()),
            (TOPOLOGY_NODE_KEY.to_string(), self.node_id.clone()),
        ])
    }

    pub fn host_paths(&self) -> HostPaths {
        HostPaths {
            sysfs: self.sysfs_dir.clone(),
            procfs: self.procfs_dir.clone(),
            udev_data: self.udev_data_dir.clone(),
            dev: self.dev_dir.clone(),
        }
    }

    pub fn layout(&self) -> DriveLayout {
        DriveLayout::new(self.mount_root.clone())
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_period: self.resync_period,
            ..Default::default()
        }
    }
}
