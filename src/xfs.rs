//! XFS helpers
//!
//! Superblock probing plus the format, mount and unmount operations the
//! initialization pipeline runs against a device.

use crate::error::{Error, Result};
use nix::mount::{MntFlags, MsFlags};
use std::fs::File;
use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

const XFS_MAGIC: &[u8; 4] = b"XFSB";
const SUPERBLOCK_SIZE: usize = 512;

// Big-endian superblock field offsets
const OFFSET_BLOCK_SIZE: usize = 4;
const OFFSET_DATA_BLOCKS: usize = 8;
const OFFSET_UUID: usize = 32;
const OFFSET_LABEL: usize = 108;
const LABEL_LEN: usize = 12;
const OFFSET_FREE_DATA_BLOCKS: usize = 144;

/// Identity and capacity of an XFS filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub fs_uuid: String,
    pub label: String,
    pub total_capacity: u64,
    pub free_capacity: u64,
}

/// Decode the primary superblock
pub fn parse_superblock(buf: &[u8], device: &str) -> Result<FsInfo> {
    if buf.len() < SUPERBLOCK_SIZE || &buf[..4] != XFS_MAGIC {
        return Err(Error::FilesystemNotFound {
            device: device.to_string(),
        });
    }

    let block_size = u64::from(be_u32(buf, OFFSET_BLOCK_SIZE));
    let data_blocks = be_u64(buf, OFFSET_DATA_BLOCKS);
    let free_blocks = be_u64(buf, OFFSET_FREE_DATA_BLOCKS);

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&buf[OFFSET_UUID..OFFSET_UUID + 16]);

    let label = String::from_utf8_lossy(&buf[OFFSET_LABEL..OFFSET_LABEL + LABEL_LEN])
        .trim_end_matches('\0')
        .to_string();

    let capacity = |blocks: u64, field: &str| {
        block_size
            .checked_mul(blocks)
            .ok_or_else(|| Error::CorruptSuperblock {
                device: device.to_string(),
                reason: format!("{} of {} blocks of {} bytes overflows", field, blocks, block_size),
            })
    };

    Ok(FsInfo {
        fs_uuid: Uuid::from_bytes(uuid).to_string(),
        label,
        total_capacity: capacity(data_blocks, "data")?,
        free_capacity: capacity(free_blocks, "free")?,
    })
}

/// Read the superblock of the device at `path`
pub fn probe(path: &Path) -> Result<FsInfo> {
    let device = path.display().to_string();
    let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
    File::open(path)?
        .take(SUPERBLOCK_SIZE as u64)
        .read_to_end(&mut buf)?;
    parse_superblock(&buf, &device)
}

/// Format `device` with the given UUID and return the new filesystem
pub async fn make_fs(
    device: &str,
    fs_uuid: &str,
    label: &str,
    force: bool,
    reflink: bool,
) -> Result<FsInfo> {
    let mut command = Command::new("mkfs.xfs");
    command
        .arg("-i")
        .arg("maxpct=50")
        .arg("-m")
        .arg(format!("uuid={}", fs_uuid))
        .arg("-m")
        .arg(format!("reflink={}", if reflink { 1 } else { 0 }))
        .arg("-L")
        .arg(label);
    if force {
        command.arg("-f");
    }
    command.arg(device);

    debug!("Running {:?}", command);
    let output = command.output().await.map_err(|e| Error::HostOperation {
        operation: "mkfs.xfs".into(),
        target: device.to_string(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::HostOperation {
            operation: "mkfs.xfs".into(),
            target: device.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!("Formatted {} with XFS uuid {}", device, fs_uuid);
    probe(Path::new(device))
}

/// mkfs.xfs refused the reflink option
pub fn is_reflink_rejection(err: &Error) -> bool {
    matches!(
        err,
        Error::HostOperation { operation, reason, .. }
            if operation == "mkfs.xfs" && reason.contains("reflink")
    )
}

/// Run `format` with reflink while `reflink` allows it.
///
/// The first time mkfs rejects the reflink option, `reflink` is cleared and
/// the format is retried without it; later formats skip reflink directly.
pub async fn format_with_reflink_fallback<F, Fut>(reflink: &AtomicBool, format: F) -> Result<FsInfo>
where
    F: Fn(bool) -> Fut,
    Fut: Future<Output = Result<FsInfo>>,
{
    if !reflink.load(Ordering::Acquire) {
        return format(false).await;
    }
    match format(true).await {
        Err(err) if is_reflink_rejection(&err) => {
            warn!("XFS reflink not supported, disabling it: {}", err);
            reflink.store(false, Ordering::Release);
            format(false).await
        }
        result => result,
    }
}

/// Mount an XFS device with project quotas enabled
pub fn mount(device: &str, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    nix::mount::mount(
        Some(device),
        target,
        Some("xfs"),
        MsFlags::MS_NOATIME,
        Some("prjquota"),
    )
    .map_err(|e| Error::HostOperation {
        operation: "mount".into(),
        target: device.to_string(),
        reason: e.to_string(),
    })
}

/// Forced lazy unmount
pub fn unmount(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH).map_err(|e| {
        Error::HostOperation {
            operation: "umount".into(),
            target: target.display().to_string(),
            reason: e.to_string(),
        }
    })
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Minimal superblock image
    pub(crate) fn superblock(
        uuid: &str,
        label: &str,
        block_size: u32,
        data_blocks: u64,
        free_blocks: u64,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[..4].copy_from_slice(XFS_MAGIC);
        buf[OFFSET_BLOCK_SIZE..OFFSET_BLOCK_SIZE + 4].copy_from_slice(&block_size.to_be_bytes());
        buf[OFFSET_DATA_BLOCKS..OFFSET_DATA_BLOCKS + 8].copy_from_slice(&data_blocks.to_be_bytes());
        buf[OFFSET_UUID..OFFSET_UUID + 16]
            .copy_from_slice(Uuid::parse_str(uuid).unwrap().as_bytes());
        buf[OFFSET_LABEL..OFFSET_LABEL + label.len()].copy_from_slice(label.as_bytes());
        buf[OFFSET_FREE_DATA_BLOCKS..OFFSET_FREE_DATA_BLOCKS + 8]
            .copy_from_slice(&free_blocks.to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_superblock() {
        let image = superblock("6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11", "DATA", 4096, 256, 128);
        let info = parse_superblock(&image, "/dev/sdb").unwrap();
        assert_eq!(info.fs_uuid, "6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11");
        assert_eq!(info.label, "DATA");
        assert_eq!(info.total_capacity, 4096 * 256);
        assert_eq!(info.free_capacity, 4096 * 128);
    }

    #[test]
    fn test_parse_rejects_other_filesystems() {
        let mut image = superblock("6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11", "DATA", 4096, 1, 1);
        image[..4].copy_from_slice(b"EXT4");
        assert_matches!(
            parse_superblock(&image, "/dev/sdb"),
            Err(Error::FilesystemNotFound { .. })
        );
        assert_matches!(
            parse_superblock(&image[..100], "/dev/sdb"),
            Err(Error::FilesystemNotFound { .. })
        );
    }

    #[test]
    fn test_parse_rejects_overflowing_capacity() {
        let image = superblock(
            "6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11",
            "DATA",
            65536,
            u64::MAX / 2,
            1,
        );
        assert_matches!(
            parse_superblock(&image, "/dev/sdb"),
            Err(Error::CorruptSuperblock { .. })
        );

        let image = superblock("6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11", "DATA", 65536, 1, u64::MAX);
        assert_matches!(
            parse_superblock(&image, "/dev/sdb"),
            Err(Error::CorruptSuperblock { .. })
        );
    }

    fn fs_info() -> FsInfo {
        FsInfo {
            fs_uuid: "6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11".into(),
            label: "SMARTDRIVE".into(),
            total_capacity: 1 << 30,
            free_capacity: 1 << 29,
        }
    }

    #[tokio::test]
    async fn test_reflink_rejection_falls_back_once() {
        let reflink = AtomicBool::new(true);
        let calls = parking_lot::Mutex::new(Vec::new());
        let format = |with_reflink: bool| {
            calls.lock().push(with_reflink);
            async move {
                if with_reflink {
                    Err(Error::HostOperation {
                        operation: "mkfs.xfs".into(),
                        target: "/dev/sdb".into(),
                        reason: "unknown option -m reflink=1".into(),
                    })
                } else {
                    Ok(fs_info())
                }
            }
        };

        assert_eq!(format_with_reflink_fallback(&reflink, &format).await.unwrap(), fs_info());
        assert!(!reflink.load(Ordering::Acquire));
        assert_eq!(*calls.lock(), vec![true, false]);

        format_with_reflink_fallback(&reflink, &format).await.unwrap();
        assert_eq!(*calls.lock(), vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_other_mkfs_errors_keep_reflink() {
        let reflink = AtomicBool::new(true);
        let result = format_with_reflink_fallback(&reflink, |_| async {
            Err(Error::HostOperation {
                operation: "mkfs.xfs".into(),
                target: "/dev/sdb".into(),
                reason: "device busy".into(),
            })
        })
        .await;
        assert_matches!(result, Err(Error::HostOperation { .. }));
        assert!(reflink.load(Ordering::Acquire));
    }

    #[test]
    fn test_probe_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(
            &path,
            superblock("6f1b0c1e-2a49-4e6b-9a3c-5b7d2f0e9c11", "SMARTDRIVE", 512, 10, 5),
        )
        .unwrap();
        assert_eq!(probe(&path).unwrap().label, "SMARTDRIVE");

        let missing = dir.path().join("missing.img");
        assert_matches!(probe(&missing), Err(Error::Io(_)));
    }
}
