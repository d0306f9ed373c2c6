//! Test doubles shared by unit tests

use crate::consts::FS_LABEL;
use crate::device::Device;
use crate::domain::ports::HostOps;
use crate::error::{Error, Result};
use crate::xfs::FsInfo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const GIB: u64 = 1 << 30;

/// Host that records every operation and fails the ones it is told to
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub devices: Mutex<Vec<Device>>,
    pub mounts: Mutex<BTreeMap<String, Vec<String>>>,
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<BTreeSet<&'static str>>,
}

impl RecordingHost {
    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, operation: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(operation))
    }

    fn record(&self, operation: &'static str, target: &str) -> Result<()> {
        self.calls.lock().push(format!("{} {}", operation, target));
        if self.failing.lock().contains(operation) {
            return Err(Error::HostOperation {
                operation: operation.to_string(),
                target: target.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Whole disk with a serial number
pub(crate) fn disk(name: &str, minor: u32, serial: &str) -> Device {
    Device {
        name: name.to_string(),
        major_minor: format!("8:{}", minor),
        major: 8,
        minor,
        size: 10 * GIB,
        logical_block_size: 512,
        physical_block_size: 4096,
        udev_data: BTreeMap::from([
            ("ID_SERIAL".to_string(), serial.to_string()),
            ("ID_VENDOR".to_string(), "ATA".to_string()),
            ("ID_MODEL".to_string(), "QEMU_HARDDISK".to_string()),
        ]),
        ..Default::default()
    }
}

#[async_trait]
impl HostOps for RecordingHost {
    async fn probe_devices(&self, major_minors: &[String]) -> Result<Vec<Device>> {
        self.record("probe", &major_minors.join(","))?;
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| major_minors.is_empty() || major_minors.contains(&d.major_minor))
            .cloned()
            .collect())
    }

    async fn mount_points(&self, major_minor: &str) -> Result<Vec<String>> {
        self.record("mount-points", major_minor)?;
        Ok(self.mounts.lock().get(major_minor).cloned().unwrap_or_default())
    }

    async fn make_fs(&self, device: &str, fs_uuid: &str, _force: bool) -> Result<FsInfo> {
        self.record("mkfs", device)?;
        Ok(FsInfo {
            fs_uuid: fs_uuid.to_string(),
            label: FS_LABEL.to_string(),
            total_capacity: 10 * GIB,
            free_capacity: 9 * GIB,
        })
    }

    async fn mount(&self, device: &str, _fs_uuid: &str) -> Result<()> {
        self.record("mount", device)
    }

    async fn unmount(&self, fs_uuid: &str) -> Result<()> {
        self.record("unmount", fs_uuid)
    }

    async fn symlink(&self, fs_uuid: &str) -> Result<()> {
        self.record("symlink", fs_uuid)
    }

    async fn make_meta_dir(&self, fs_uuid: &str) -> Result<()> {
        self.record("meta-dir", fs_uuid)
    }

    async fn write_meta_file(&self, fs_uuid: &str, _content: &str) -> Result<()> {
        self.record("meta-file", fs_uuid)
    }

    fn mount_dir(&self, fs_uuid: &str) -> String {
        format!("/var/lib/smart-drive-agent/mnt/{}", fs_uuid)
    }
}
