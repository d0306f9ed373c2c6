//! Well-known names shared across the agent

/// Application name, used in metadata files and log lines
pub const APP_NAME: &str = "smart-drive-agent";

/// Pretty name used in denial reasons
pub const APP_PRETTY_NAME: &str = "SmartDrive";

/// API group of the custom resources
pub const GROUP_NAME: &str = "storage.billyronks.io";

pub const API_VERSION: &str = "v1";

// =============================================================================
// Finalizers
// =============================================================================

/// Held on a drive while any volume lives on it
pub const DRIVE_FINALIZER_DATA_PROTECTION: &str = "storage.billyronks.io/data-protection";

/// Prefix of per-volume finalizers on a drive; the suffix is the volume name
pub const DRIVE_FINALIZER_PREFIX: &str = "storage.billyronks.io.volume/";

// =============================================================================
// Labels
// =============================================================================

pub const NODE_LABEL_KEY: &str = "storage.billyronks.io/node";
pub const DRIVE_NAME_LABEL_KEY: &str = "storage.billyronks.io/drive-name";
pub const REQUESTOR_LABEL_KEY: &str = "storage.billyronks.io/requested-by";
pub const CREATED_BY_LABEL_KEY: &str = "storage.billyronks.io/created-by";

pub const TOPOLOGY_IDENTITY_KEY: &str = "storage.billyronks.io/identity";
pub const TOPOLOGY_RACK_KEY: &str = "storage.billyronks.io/rack";
pub const TOPOLOGY_ZONE_KEY: &str = "storage.billyronks.io/zone";
pub const TOPOLOGY_REGION_KEY: &str = "storage.billyronks.io/region";
pub const TOPOLOGY_NODE_KEY: &str = "storage.billyronks.io/node";

// =============================================================================
// Host paths
// =============================================================================

pub const SYSFS_DIR: &str = "/sys";
pub const PROCFS_DIR: &str = "/proc";
pub const UDEV_DATA_DIR: &str = "/run/udev/data";
pub const DEV_DIR: &str = "/dev";

pub const APP_ROOT_DIR: &str = "/var/lib/smart-drive-agent";
pub const MOUNT_ROOT_DIR: &str = "/var/lib/smart-drive-agent/mnt";

/// Metadata directory created at the root of every managed filesystem
pub const META_DIR_NAME: &str = ".smart-drive-agent";
pub const META_FILE_NAME: &str = "meta.info";

/// Prefix of the self-referencing volume root entry
pub const VOLUME_ROOT_PREFIX: &str = ".FSUUID.";

// =============================================================================
// Filesystem
// =============================================================================

/// XFS label, at most 12 bytes
pub const FS_LABEL: &str = "SMARTDRIVE";

pub const FS_TYPE_XFS: &str = "xfs";

/// Devices smaller than this cannot be initialized
pub const MIN_SUPPORTED_DEVICE_SIZE: u64 = 512 * 1024 * 1024;
