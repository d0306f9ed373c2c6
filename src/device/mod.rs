//! Host block devices
//!
//! A [`Device`] is an immutable snapshot of one block device as seen through
//! sysfs, procfs and the udev database. [`ProbedDevice`] adds the identity of
//! the filesystem found on it.

pub mod identity;
pub mod mounts;
pub mod probe;

pub use identity::*;
pub use mounts::MountTable;
pub use probe::{HostPaths, Prober};

use std::collections::BTreeMap;

// =============================================================================
// Udev property keys
// =============================================================================

pub const UDEV_VENDOR: &str = "ID_VENDOR";
pub const UDEV_MODEL: &str = "ID_MODEL";
pub const UDEV_SERIAL: &str = "ID_SERIAL";
pub const UDEV_SERIAL_SHORT: &str = "ID_SERIAL_SHORT";
pub const UDEV_WWN: &str = "ID_WWN";
pub const UDEV_FS_UUID: &str = "ID_FS_UUID";
pub const UDEV_FS_TYPE: &str = "ID_FS_TYPE";
pub const UDEV_PART_ENTRY_NUMBER: &str = "ID_PART_ENTRY_NUMBER";
pub const UDEV_PART_ENTRY_UUID: &str = "ID_PART_ENTRY_UUID";
pub const UDEV_PART_TABLE_UUID: &str = "ID_PART_TABLE_UUID";
pub const UDEV_PART_TABLE_TYPE: &str = "ID_PART_TABLE_TYPE";
pub const UDEV_DM_NAME: &str = "DM_NAME";
pub const UDEV_DM_UUID: &str = "DM_UUID";
pub const UDEV_MD_UUID: &str = "MD_UUID";

// =============================================================================
// Device
// =============================================================================

/// Snapshot of a host block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    /// Kernel name, e.g. sdb or nvme0n1p1
    pub name: String,
    /// "major:minor"
    pub major_minor: String,
    pub major: u32,
    pub minor: u32,
    /// Size in bytes
    pub size: u64,
    pub hidden: bool,
    pub removable: bool,
    pub read_only: bool,
    /// Has partitions
    pub partitioned: bool,
    /// Devices stacked on top of this one (dm, md)
    pub holders: Vec<String>,
    pub mount_points: Vec<String>,
    pub swap_on: bool,
    pub cdrom: bool,
    pub dm_name: String,
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    /// Udev properties without the `E:` prefix
    pub udev_data: BTreeMap<String, String>,
}

impl Device {
    pub fn dev_path(&self) -> String {
        format!("{}/{}", crate::consts::DEV_DIR, self.name)
    }

    fn udev(&self, key: &str) -> &str {
        self.udev_data.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn vendor(&self) -> &str {
        self.udev(UDEV_VENDOR)
    }

    pub fn model(&self) -> &str {
        self.udev(UDEV_MODEL)
    }

    pub fn serial(&self) -> &str {
        self.udev(UDEV_SERIAL)
    }

    pub fn serial_short(&self) -> &str {
        self.udev(UDEV_SERIAL_SHORT)
    }

    pub fn wwid(&self) -> &str {
        self.udev(UDEV_WWN)
    }

    pub fn fs_uuid(&self) -> &str {
        self.udev(UDEV_FS_UUID)
    }

    pub fn fs_type(&self) -> &str {
        self.udev(UDEV_FS_TYPE)
    }

    pub fn dm_uuid(&self) -> &str {
        self.udev(UDEV_DM_UUID)
    }

    pub fn md_uuid(&self) -> &str {
        self.udev(UDEV_MD_UUID)
    }

    pub fn part_uuid(&self) -> &str {
        self.udev(UDEV_PART_ENTRY_UUID)
    }

    pub fn pt_uuid(&self) -> &str {
        self.udev(UDEV_PART_TABLE_UUID)
    }

    /// Partition number, 0 for whole disks
    pub fn partition_number(&self) -> u32 {
        self.udev(UDEV_PART_ENTRY_NUMBER).parse().unwrap_or(0)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }
}

// =============================================================================
// ProbedDevice
// =============================================================================

/// Device carrying a recognised filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedDevice {
    pub device: Device,
    pub fs_uuid: String,
    pub label: String,
    pub total_capacity: u64,
    pub free_capacity: u64,
}
