//! Block Device Prober
//!
//! Enumerates block devices from sysfs and enriches them with mount, swap,
//! CD-ROM and udev information from procfs and the udev database.

use super::{Device, MountTable, ProbedDevice};
use crate::consts::{DEV_DIR, PROCFS_DIR, SYSFS_DIR, UDEV_DATA_DIR};
use crate::error::{Error, Result};
use crate::xfs;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Host paths
// =============================================================================

/// Roots of the host trees the prober reads (overridable for testing)
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sysfs: PathBuf,
    pub procfs: PathBuf,
    pub udev_data: PathBuf,
    pub dev: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from(SYSFS_DIR),
            procfs: PathBuf::from(PROCFS_DIR),
            udev_data: PathBuf::from(UDEV_DATA_DIR),
            dev: PathBuf::from(DEV_DIR),
        }
    }
}

// =============================================================================
// Prober
// =============================================================================

/// Reads block device state from the host
#[derive(Debug, Clone, Default)]
pub struct Prober {
    paths: HostPaths,
}

impl Prober {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    /// Probe every visible block device
    pub fn probe(&self) -> Result<Vec<Device>> {
        let class_block = self.paths.sysfs.join("class/block");
        let mounts = self.mount_table()?;
        let swaps = self.swap_devices()?;
        let cdroms = self.cdrom_devices()?;

        let mut devices = Vec::new();
        for entry in fs::read_dir(&class_block)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            match self.probe_one(&name, &mounts, &swaps, &cdroms) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Skipping block device {}: {}", name, e),
            }
        }

        devices.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Probed {} block devices", devices.len());
        Ok(devices)
    }

    /// Probe only devices whose major:minor is listed; an empty list means all
    pub fn probe_devices(&self, major_minors: &[String]) -> Result<Vec<Device>> {
        let devices = self.probe()?;
        if major_minors.is_empty() {
            return Ok(devices);
        }

        let wanted: BTreeSet<&str> = major_minors.iter().map(String::as_str).collect();
        Ok(devices
            .into_iter()
            .filter(|device| wanted.contains(device.major_minor.as_str()))
            .collect())
    }

    /// Eligible devices carrying an XFS filesystem, keyed by filesystem UUID
    pub fn probe_device_map(&self) -> Result<BTreeMap<String, Vec<ProbedDevice>>> {
        let mut map: BTreeMap<String, Vec<ProbedDevice>> = BTreeMap::new();

        for device in self.probe()? {
            if device.hidden
                || device.partitioned
                || !device.holders.is_empty()
                || device.swap_on
                || device.cdrom
                || device.size == 0
            {
                continue;
            }

            let path = self.paths.dev.join(&device.name);
            match xfs::probe(&path) {
                Ok(info) => {
                    map.entry(info.fs_uuid.clone())
                        .or_default()
                        .push(ProbedDevice {
                            device,
                            fs_uuid: info.fs_uuid,
                            label: info.label,
                            total_capacity: info.total_capacity,
                            free_capacity: info.free_capacity,
                        });
                }
                Err(Error::FilesystemNotFound { .. }) => {}
                Err(e) => warn!("Unable to probe filesystem on {}: {}", path.display(), e),
            }
        }

        Ok(map)
    }

    /// Current mount table
    pub fn mount_table(&self) -> Result<MountTable> {
        let primary = self.paths.procfs.join("1/mountinfo");
        if primary.exists() {
            return MountTable::read(&primary);
        }
        MountTable::read(&self.paths.procfs.join("self/mountinfo"))
    }

    fn probe_one(
        &self,
        name: &str,
        mounts: &MountTable,
        swaps: &BTreeSet<String>,
        cdroms: &BTreeSet<String>,
    ) -> Result<Device> {
        let sysfs_path = self.paths.sysfs.join("class/block").join(name);

        let major_minor = read_sysfs_attr(&sysfs_path, "dev")?;
        let (major, minor) = parse_major_minor(&major_minor)?;

        let sectors = read_u64(&sysfs_path, "size").unwrap_or(0);
        let dm_name = read_sysfs_attr(&sysfs_path, "dm/name").unwrap_or_default();

        let mut holders = list_dir(&sysfs_path.join("holders"));
        holders.sort();

        let udev_data = self.read_udev_data(&major_minor)?;

        Ok(Device {
            name: name.to_string(),
            mount_points: mounts.mount_points(&major_minor),
            major_minor,
            major,
            minor,
            size: sectors * 512,
            hidden: read_bool(&sysfs_path, "hidden"),
            removable: read_bool(&sysfs_path, "removable"),
            read_only: read_bool(&sysfs_path, "ro"),
            partitioned: has_partitions(&sysfs_path, name),
            holders,
            swap_on: swaps.contains(name) || (!dm_name.is_empty() && swaps.contains(&dm_name)),
            cdrom: cdroms.contains(name),
            dm_name,
            logical_block_size: read_u64(&sysfs_path, "queue/logical_block_size").unwrap_or(0),
            physical_block_size: read_u64(&sysfs_path, "queue/physical_block_size")
                .unwrap_or(0),
            udev_data,
        })
    }

    /// `E:` properties from the udev database entry of a block device
    fn read_udev_data(&self, major_minor: &str) -> Result<BTreeMap<String, String>> {
        let path = self.paths.udev_data.join(format!("b{}", major_minor));
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter_map(|line| line.strip_prefix("E:"))
            .filter_map(|property| property.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect())
    }

    /// Names of active swap devices
    fn swap_devices(&self) -> Result<BTreeSet<String>> {
        let content = match fs::read_to_string(self.paths.procfs.join("swaps")) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|path| Path::new(path).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect())
    }

    /// Names of CD-ROM drives
    fn cdrom_devices(&self) -> Result<BTreeSet<String>> {
        let content = match fs::read_to_string(self.paths.procfs.join("sys/dev/cdrom/info")) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter_map(|line| line.strip_prefix("drive name:"))
            .flat_map(|names| names.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect())
    }
}

// =============================================================================
// Sysfs helpers
// =============================================================================

/// Read a sysfs attribute, trimmed
fn read_sysfs_attr(base: &Path, attr: &str) -> Result<String> {
    let path = base.join(attr);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::HardwareDiscovery(format!("Failed to read {:?}: {}", path, e)))
}

fn read_u64(base: &Path, attr: &str) -> Result<u64> {
    let value = read_sysfs_attr(base, attr)?;
    value.parse().map_err(|_| Error::FieldConversion {
        field: attr.to_string(),
        value,
    })
}

fn read_bool(base: &Path, attr: &str) -> bool {
    read_sysfs_attr(base, attr)
        .map(|value| value == "1")
        .unwrap_or(false)
}

fn list_dir(path: &Path) -> Vec<String> {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// A whole disk is partitioned when sysfs lists `<name>/<name>*` children
fn has_partitions(sysfs_path: &Path, name: &str) -> bool {
    let pattern = sysfs_path.join(format!("{}*", glob::Pattern::escape(name)));
    glob::glob(&pattern.to_string_lossy())
        .map(|paths| paths.filter_map(|p| p.ok()).any(|p| p.is_dir()))
        .unwrap_or(false)
}

pub(crate) fn parse_major_minor(value: &str) -> Result<(u32, u32)> {
    let conversion = || Error::FieldConversion {
        field: "dev".to_string(),
        value: value.to_string(),
    };
    let (major, minor) = value.split_once(':').ok_or_else(conversion)?;
    Ok((
        major.parse().map_err(|_| conversion())?,
        minor.parse().map_err(|_| conversion())?,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Builds a fake host tree under a temp dir
    pub(crate) struct FakeHost {
        pub dir: TempDir,
    }

    impl FakeHost {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["sys/class/block", "proc/1", "run/udev/data", "dev"] {
                fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            fs::write(dir.path().join("proc/1/mountinfo"), "").unwrap();
            Self { dir }
        }

        pub fn paths(&self) -> HostPaths {
            HostPaths {
                sysfs: self.dir.path().join("sys"),
                procfs: self.dir.path().join("proc"),
                udev_data: self.dir.path().join("run/udev/data"),
                dev: self.dir.path().join("dev"),
            }
        }

        pub fn add_device(&self, name: &str, major_minor: &str, sectors: u64) -> PathBuf {
            let base = self.dir.path().join("sys/class/block").join(name);
            fs::create_dir_all(base.join("holders")).unwrap();
            fs::create_dir_all(base.join("queue")).unwrap();
            fs::write(base.join("dev"), format!("{}\n", major_minor)).unwrap();
            fs::write(base.join("size"), format!("{}\n", sectors)).unwrap();
            fs::write(base.join("ro"), "0\n").unwrap();
            fs::write(base.join("removable"), "0\n").unwrap();
            fs::write(base.join("queue/logical_block_size"), "512\n").unwrap();
            fs::write(base.join("queue/physical_block_size"), "4096\n").unwrap();
            base
        }

        pub fn write(&self, relative: &str, content: &str) {
            let path = self.dir.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_probe_reads_sysfs_and_udev() {
        let host = FakeHost::new();
        host.add_device("sdb", "8:16", 2 * 1024 * 1024);
        host.write(
            "run/udev/data/b8:16",
            "S:disk/by-id/ata-QEMU\nE:ID_VENDOR=ATA\nE:ID_MODEL=QEMU_HARDDISK\nE:ID_SERIAL_SHORT=QM0001\nG:systemd\n",
        );
        host.write(
            "proc/1/mountinfo",
            "36 22 8:16 / /mnt/data rw - xfs /dev/sdb rw\n",
        );

        let devices = Prober::new(host.paths()).probe().unwrap();
        assert_eq!(devices.len(), 1);

        let sdb = &devices[0];
        assert_eq!(sdb.name, "sdb");
        assert_eq!(sdb.major_minor, "8:16");
        assert_eq!((sdb.major, sdb.minor), (8, 16));
        assert_eq!(sdb.size, 1 << 30);
        assert_eq!(sdb.logical_block_size, 512);
        assert_eq!(sdb.physical_block_size, 4096);
        assert_eq!(sdb.mount_points, vec!["/mnt/data"]);
        assert_eq!(sdb.vendor(), "ATA");
        assert_eq!(sdb.serial_short(), "QM0001");
        assert_eq!(sdb.udev_data.len(), 3);
        assert!(!sdb.partitioned);
    }

    #[test]
    fn test_probe_flags() {
        let host = FakeHost::new();
        let sda = host.add_device("sda", "8:0", 4096);
        fs::create_dir_all(sda.join("sda1")).unwrap();
        host.add_device("sda1", "8:1", 2048);
        let sdc = host.add_device("sdc", "8:32", 4096);
        fs::create_dir_all(sdc.join("holders/dm-0")).unwrap();
        host.add_device("sr0", "11:0", 4096);
        host.add_device("sdd", "8:48", 4096);
        fs::write(host.dir.path().join("sys/class/block/sdd/ro"), "1\n").unwrap();

        host.write(
            "proc/swaps",
            "Filename\tType\tSize\tUsed\tPriority\n/dev/sda1 partition 1024 0 -2\n",
        );
        host.write("proc/sys/dev/cdrom/info", "CD-ROM information\n\ndrive name:\t\tsr0\n");

        let devices = Prober::new(host.paths()).probe().unwrap();
        let by_name: BTreeMap<_, _> = devices.iter().map(|d| (d.name.as_str(), d)).collect();

        assert!(by_name["sda"].partitioned);
        assert!(by_name["sda1"].swap_on);
        assert_eq!(by_name["sdc"].holders, vec!["dm-0"]);
        assert!(by_name["sr0"].cdrom);
        assert!(by_name["sdd"].read_only);
    }

    #[test]
    fn test_probe_devices_filters_by_major_minor() {
        let host = FakeHost::new();
        host.add_device("sdb", "8:16", 4096);
        host.add_device("sdc", "8:32", 4096);

        let prober = Prober::new(host.paths());
        let devices = prober.probe_devices(&["8:32".to_string()]).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdc");
        assert_eq!(prober.probe_devices(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_probe_device_map_skips_non_xfs() {
        let host = FakeHost::new();
        host.add_device("sdb", "8:16", 4096);
        host.add_device("sdc", "8:32", 4096);
        host.write("dev/sdb", &"\0".repeat(1024));
        fs::write(
            host.dir.path().join("dev/sdc"),
            xfs::tests::superblock("0b9c7e2a-3f43-4b8e-a4e3-1f4e8a3a0d10", "SMARTDRIVE", 4096, 1000, 400),
        )
        .unwrap();

        let map = Prober::new(host.paths()).probe_device_map().unwrap();
        assert_eq!(map.len(), 1);
        let probed = &map["0b9c7e2a-3f43-4b8e-a4e3-1f4e8a3a0d10"];
        assert_eq!(probed[0].device.name, "sdc");
        assert_eq!(probed[0].label, "SMARTDRIVE");
        assert_eq!(probed[0].total_capacity, 4096 * 1000);
        assert_eq!(probed[0].free_capacity, 4096 * 400);
    }

    #[test]
    fn test_parse_major_minor() {
        assert_eq!(parse_major_minor("259:3").unwrap(), (259, 3));
        assert!(parse_major_minor("259").is_err());
        assert!(parse_major_minor("x:1").is_err());
    }
}
