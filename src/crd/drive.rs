//! Drive CRD
//!
//! One record per managed host block device. Identity attributes are copied
//! from the probed device so a later hotplug event can be matched back to
//! the record; capacity fields are maintained by the capacity ledger.

use crate::consts::{
    CREATED_BY_LABEL_KEY, DRIVE_FINALIZER_DATA_PROTECTION, DRIVE_FINALIZER_PREFIX,
    DRIVE_NAME_LABEL_KEY, NODE_LABEL_KEY,
};
use crate::device::Device;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Drive CRD
// =============================================================================

/// Drive is a host block device managed by the agent.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "Drive",
    plural = "drives",
    shortname = "drv",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "Make", "type": "string", "jsonPath": ".spec.make"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.totalCapacity"}"#,
    printcolumn = r#"{"name": "Allocated", "type": "integer", "jsonPath": ".spec.allocatedCapacity"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".spec.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    derive = "PartialEq",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    /// Node the device is attached to
    pub node_name: String,

    /// Device path, e.g. /dev/sdb
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub major: u32,

    #[serde(default)]
    pub minor: u32,

    /// Raw device size in bytes
    #[serde(default)]
    pub size: u64,

    /// UUID of the filesystem created by initialization
    #[serde(default)]
    pub fs_uuid: String,

    /// Filesystem UUID reported by udev
    #[serde(default)]
    pub uevent_fs_uuid: String,

    #[serde(default)]
    pub filesystem: String,

    #[serde(default)]
    pub serial_number: String,

    /// Short serial reported by udev
    #[serde(default)]
    pub uevent_serial: String,

    #[serde(default)]
    pub wwid: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub make: String,

    #[serde(default)]
    pub partition_num: u32,

    #[serde(default)]
    pub dm_name: String,

    #[serde(default)]
    pub dm_uuid: String,

    /// MD RAID UUID
    #[serde(default)]
    pub md_uuid: String,

    #[serde(default)]
    pub part_uuid: String,

    #[serde(default)]
    pub pt_uuid: String,

    #[serde(default)]
    pub logical_block_size: u64,

    #[serde(default)]
    pub physical_block_size: u64,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub removable: bool,

    /// Where the managed filesystem is mounted
    #[serde(default)]
    pub mountpoint: String,

    /// Filesystem capacity in bytes
    #[serde(default)]
    pub total_capacity: u64,

    #[serde(default)]
    pub allocated_capacity: u64,

    #[serde(default)]
    pub free_capacity: u64,

    #[serde(default)]
    pub status: DriveStatus,

    /// Topology labels of the owning node
    #[serde(default)]
    pub topology: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Drive lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DriveStatus {
    /// Discovered, not yet initialized
    #[default]
    Available,
    /// Formatted and registered, no volumes
    Ready,
    /// At least one volume lives on the drive
    InUse,
    /// Device disappeared from the host
    Unavailable,
    Terminating,
}

impl std::fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveStatus::Available => write!(f, "Available"),
            DriveStatus::Ready => write!(f, "Ready"),
            DriveStatus::InUse => write!(f, "InUse"),
            DriveStatus::Unavailable => write!(f, "Unavailable"),
            DriveStatus::Terminating => write!(f, "Terminating"),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

impl DriveSpec {
    /// Copy every device-derived attribute from a probed device.
    ///
    /// Returns true when anything changed.
    pub fn sync_from_device(&mut self, device: &Device) -> bool {
        let before = self.clone();

        self.path = device.dev_path();
        self.major = device.major;
        self.minor = device.minor;
        self.size = device.size;
        self.read_only = device.read_only;
        self.removable = device.removable;
        self.dm_name = device.dm_name.clone();
        self.logical_block_size = device.logical_block_size;
        self.physical_block_size = device.physical_block_size;
        self.uevent_fs_uuid = device.fs_uuid().to_string();
        self.filesystem = device.fs_type().to_string();
        self.serial_number = device.serial().to_string();
        self.uevent_serial = device.serial_short().to_string();
        self.wwid = device.wwid().to_string();
        self.model = device.model().to_string();
        self.vendor = device.vendor().to_string();
        self.partition_num = device.partition_number();
        self.dm_uuid = device.dm_uuid().to_string();
        self.md_uuid = device.md_uuid().to_string();
        self.part_uuid = device.part_uuid().to_string();
        self.pt_uuid = device.pt_uuid().to_string();
        self.make = device.make();

        *self != before
    }
}

impl Drive {
    /// Build a drive record for a device on `node_name`
    pub fn from_device(
        name: &str,
        node_name: &str,
        device: &Device,
        topology: BTreeMap<String, String>,
    ) -> Self {
        let mut spec = DriveSpec {
            node_name: node_name.to_string(),
            topology,
            ..Default::default()
        };
        spec.sync_from_device(device);

        let mut drive = Drive::new(name, spec);
        drive.labels_mut().extend([
            (NODE_LABEL_KEY.to_string(), node_name.to_string()),
            (DRIVE_NAME_LABEL_KEY.to_string(), device.name.clone()),
            (CREATED_BY_LABEL_KEY.to_string(), crate::consts::APP_NAME.to_string()),
        ]);
        drive
    }

    /// Finalizer token recording that `volume` lives on this drive
    pub fn volume_finalizer(volume: &str) -> String {
        format!("{}{}", DRIVE_FINALIZER_PREFIX, volume)
    }

    /// Names of volumes recorded in finalizer tokens
    pub fn volume_names(&self) -> Vec<String> {
        self.finalizers()
            .iter()
            .filter_map(|f| f.strip_prefix(DRIVE_FINALIZER_PREFIX))
            .map(str::to_string)
            .collect()
    }

    pub fn has_data_protection(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == DRIVE_FINALIZER_DATA_PROTECTION)
    }
}
