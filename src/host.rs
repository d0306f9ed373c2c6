//! Host operations
//!
//! [`LinuxHost`] is the production [`HostOps`]: it probes through the
//! [`Prober`], formats and mounts through [`xfs`], and lays out managed
//! filesystems according to [`DriveLayout`]. Blocking filesystem and sysfs
//! work runs on the blocking pool.

use crate::consts::{FS_LABEL, META_DIR_NAME, META_FILE_NAME, MOUNT_ROOT_DIR, VOLUME_ROOT_PREFIX};
use crate::device::{Device, Prober};
use crate::domain::ports::HostOps;
use crate::error::{Error, Result};
use crate::xfs::{self, FsInfo};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Layout
// =============================================================================

/// Where a managed filesystem and its bookkeeping live on the host
#[derive(Debug, Clone)]
pub struct DriveLayout {
    pub mount_root: PathBuf,
}

impl Default for DriveLayout {
    fn default() -> Self {
        Self::new(MOUNT_ROOT_DIR)
    }
}

impl DriveLayout {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }

    /// `<root>/<fsuuid>`
    pub fn mount_dir(&self, fs_uuid: &str) -> PathBuf {
        self.mount_root.join(fs_uuid)
    }

    /// Self-referencing entry volumes are created under
    pub fn volume_root_dir(&self, fs_uuid: &str) -> PathBuf {
        self.mount_dir(fs_uuid)
            .join(format!("{}{}", VOLUME_ROOT_PREFIX, fs_uuid))
    }

    pub fn meta_dir(&self, fs_uuid: &str) -> PathBuf {
        self.mount_dir(fs_uuid).join(META_DIR_NAME)
    }

    pub fn meta_file(&self, fs_uuid: &str) -> PathBuf {
        self.meta_dir(fs_uuid).join(META_FILE_NAME)
    }
}

// =============================================================================
// Linux host
// =============================================================================

/// Host operations against the local kernel
#[derive(Debug, Clone)]
pub struct LinuxHost {
    prober: Prober,
    layout: DriveLayout,
    /// Cleared once mkfs rejects reflink
    reflink: Arc<AtomicBool>,
}

impl LinuxHost {
    pub fn new(prober: Prober, layout: DriveLayout, reflink: bool) -> Self {
        Self {
            prober,
            layout,
            reflink: Arc::new(AtomicBool::new(reflink)),
        }
    }

    pub fn reflink(&self) -> bool {
        self.reflink.load(Ordering::Acquire)
    }

    pub fn layout(&self) -> &DriveLayout {
        &self.layout
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

fn host_error(operation: &str, target: &std::path::Path, err: io::Error) -> Error {
    Error::HostOperation {
        operation: operation.to_string(),
        target: target.display().to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn probe_devices(&self, major_minors: &[String]) -> Result<Vec<Device>> {
        let prober = self.prober.clone();
        let major_minors = major_minors.to_vec();
        blocking(move || prober.probe_devices(&major_minors)).await
    }

    async fn mount_points(&self, major_minor: &str) -> Result<Vec<String>> {
        let prober = self.prober.clone();
        let major_minor = major_minor.to_string();
        blocking(move || Ok(prober.mount_table()?.mount_points(&major_minor))).await
    }

    async fn make_fs(&self, device: &str, fs_uuid: &str, force: bool) -> Result<FsInfo> {
        xfs::format_with_reflink_fallback(&self.reflink, |reflink| {
            xfs::make_fs(device, fs_uuid, FS_LABEL, force, reflink)
        })
        .await
    }

    async fn mount(&self, device: &str, fs_uuid: &str) -> Result<()> {
        let target = self.layout.mount_dir(fs_uuid);
        let device = device.to_string();
        info!("Mounting {} at {}", device, target.display());
        blocking(move || xfs::mount(&device, &target)).await
    }

    async fn unmount(&self, fs_uuid: &str) -> Result<()> {
        let target = self.layout.mount_dir(fs_uuid);
        info!("Unmounting {}", target.display());
        blocking(move || xfs::unmount(&target)).await
    }

    async fn symlink(&self, fs_uuid: &str) -> Result<()> {
        let link = self.layout.volume_root_dir(fs_uuid);
        blocking(move || match std::os::unix::fs::symlink(".", &link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} already exists", link.display());
                Ok(())
            }
            Err(e) => Err(host_error("symlink", &link, e)),
        })
        .await
    }

    async fn make_meta_dir(&self, fs_uuid: &str) -> Result<()> {
        let dir = self.layout.meta_dir(fs_uuid);
        blocking(move || std::fs::create_dir_all(&dir).map_err(|e| host_error("mkdir", &dir, e))).await
    }

    async fn write_meta_file(&self, fs_uuid: &str, content: &str) -> Result<()> {
        let file = self.layout.meta_file(fs_uuid);
        let content = content.to_string();
        blocking(move || std::fs::write(&file, content).map_err(|e| host_error("write", &file, e))).await
    }

    fn mount_dir(&self, fs_uuid: &str) -> String {
        self.layout.mount_dir(fs_uuid).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::probe::tests::FakeHost;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = DriveLayout::default();
        assert_eq!(
            layout.mount_dir("abc"),
            PathBuf::from("/var/lib/smart-drive-agent/mnt/abc")
        );
        assert_eq!(
            layout.volume_root_dir("abc"),
            PathBuf::from("/var/lib/smart-drive-agent/mnt/abc/.FSUUID.abc")
        );
        assert_eq!(
            layout.meta_file("abc"),
            PathBuf::from("/var/lib/smart-drive-agent/mnt/abc/.smart-drive-agent/meta.info")
        );
    }

    #[tokio::test]
    async fn test_metadata_registration() {
        let root = TempDir::new().unwrap();
        let host = LinuxHost::new(Prober::default(), DriveLayout::new(root.path()), false);
        assert!(!host.reflink());
        std::fs::create_dir_all(host.layout().mount_dir("abc")).unwrap();

        host.symlink("abc").await.unwrap();
        host.symlink("abc").await.unwrap();
        host.make_meta_dir("abc").await.unwrap();
        host.write_meta_file("abc", "FSUUID=abc\n").await.unwrap();

        let link = host.layout().volume_root_dir("abc");
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("."));
        assert_eq!(
            std::fs::read_to_string(host.layout().meta_file("abc")).unwrap(),
            "FSUUID=abc\n"
        );
    }

    #[tokio::test]
    async fn test_probe_and_mount_points_through_host() {
        let fake = FakeHost::new();
        fake.add_device("sdb", "8:16", 2 * 1024 * 1024);
        fake.add_device("sdc", "8:32", 2 * 1024 * 1024);
        fake.write(
            "proc/1/mountinfo",
            "36 35 8:32 / /mnt/data rw,noatime shared:1 - xfs /dev/sdc rw\n",
        );

        let host = LinuxHost::new(Prober::new(fake.paths()), DriveLayout::default(), false);
        let devices = host.probe_devices(&["8:16".to_string()]).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdb");

        assert_eq!(host.mount_points("8:32").await.unwrap(), vec!["/mnt/data"]);
        assert!(host.mount_points("8:16").await.unwrap().is_empty());
    }
}
