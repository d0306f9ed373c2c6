//! Device identity
//!
//! Deterministic fingerprint, human-readable make, and the reasons a device
//! may not be initialized.

use super::Device;
use crate::consts::{APP_PRETTY_NAME, FS_TYPE_XFS, MIN_SUPPORTED_DEVICE_SIZE};
use crate::crd::NodeDevice;
use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

impl Device {
    /// Fingerprint of every comparison attribute on `node_id`.
    ///
    /// Holder and mount point order does not matter. Every field is hashed
    /// with a length prefix so no two attribute sets share an encoding. The
    /// result is `major:minor$base64(sha256(...))`.
    pub fn id(&self, node_id: &str) -> String {
        let mut holders = self.holders.clone();
        holders.sort();
        let mut mount_points = self.mount_points.clone();
        mount_points.sort();

        let fields: BTreeMap<&str, String> = BTreeMap::from([
            ("node", node_id.to_string()),
            ("name", self.name.clone()),
            ("majorminor", self.major_minor.clone()),
            ("size", self.size.to_string()),
            ("hidden", self.hidden.to_string()),
            ("removable", self.removable.to_string()),
            ("readonly", self.read_only.to_string()),
            ("partitioned", self.partitioned.to_string()),
            ("swapon", self.swap_on.to_string()),
            ("cdrom", self.cdrom.to_string()),
            ("dmname", self.dm_name.clone()),
            ("logicalblocksize", self.logical_block_size.to_string()),
            ("physicalblocksize", self.physical_block_size.to_string()),
        ]);

        let mut hasher = Sha256::new();
        for (key, value) in &fields {
            put(&mut hasher, key);
            put(&mut hasher, value);
        }
        put_list(&mut hasher, "holders", holders.iter());
        put_list(&mut hasher, "mountpoints", mount_points.iter());

        put(&mut hasher, "udevdata");
        hasher.update((self.udev_data.len() as u64).to_be_bytes());
        for (key, value) in &self.udev_data {
            put(&mut hasher, key);
            put(&mut hasher, value);
        }

        format!("{}${}", self.major_minor, STANDARD.encode(hasher.finalize()))
    }

    /// Human-readable label, e.g. "ATA QEMU_HARDDISK (Part 1)"
    pub fn make(&self) -> String {
        let mut parts = Vec::new();
        if !self.dm_name.is_empty() {
            parts.push(self.dm_name.clone());
        }
        if !self.vendor().is_empty() {
            parts.push(self.vendor().to_string());
        }
        if !self.model().is_empty() {
            parts.push(self.model().to_string());
        }
        if let Some(number) = self.udev_data.get(super::UDEV_PART_ENTRY_NUMBER) {
            parts.push(format!("(Part {})", number));
        }
        parts.join(" ")
    }

    /// Semicolon-joined reasons this device cannot be initialized.
    ///
    /// `lookup` is asked whether a managed drive already owns the device's
    /// XFS filesystem UUID. A "not found" answer is not a denial; any other
    /// error becomes an internal-error reason.
    pub fn denied_reason<F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Result<()>,
    {
        let mut reasons: Vec<String> = Vec::new();

        if self.size < MIN_SUPPORTED_DEVICE_SIZE {
            reasons.push("Too small".into());
        }
        if self.hidden {
            reasons.push("Hidden".into());
        }
        if self.read_only {
            reasons.push("Read only".into());
        }
        if self.partitioned {
            reasons.push("Partitioned".into());
        }
        if !self.holders.is_empty() {
            reasons.push("Held by other device".into());
        }
        if self.is_mounted() {
            reasons.push("Mounted".into());
        }
        if self.swap_on {
            reasons.push("Swap".into());
        }
        if self.cdrom {
            reasons.push("CDROM".into());
        }

        if self.fs_type() == FS_TYPE_XFS && !self.fs_uuid().is_empty() {
            match lookup(self.fs_uuid()) {
                Ok(()) => reasons.push(format!("Used by {}", APP_PRETTY_NAME)),
                Err(err) if err.is_not_found() => {}
                Err(err) => reasons.push(format!("internal error; {}", err)),
            }
        }

        reasons.join("; ")
    }

    /// Inventory entry for the node record
    pub fn to_node_device<F>(&self, node_id: &str, lookup: F) -> NodeDevice
    where
        F: Fn(&str) -> Result<()>,
    {
        NodeDevice {
            name: self.name.clone(),
            id: self.id(node_id),
            major_minor: self.major_minor.clone(),
            size: self.size,
            make: self.make(),
            fs_type: self.fs_type().to_string(),
            fs_uuid: self.fs_uuid().to_string(),
            denied_reason: self.denied_reason(lookup),
        }
    }
}

fn put(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn put_list<'a>(hasher: &mut Sha256, key: &str, values: impl ExactSizeIterator<Item = &'a String>) {
    put(hasher, key);
    hasher.update((values.len() as u64).to_be_bytes());
    for value in values {
        put(hasher, value);
    }
}
