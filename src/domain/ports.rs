//! Domain Ports - Core trait definitions for the drive agent
//!
//! These traits define the boundaries between the domain logic and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::device::Device;
use crate::error::Result;
use crate::store::Selector;
use crate::xfs::FsInfo;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

// =============================================================================
// Cluster Objects
// =============================================================================

/// A cluster-scoped object the agent reads and writes
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Change observed on a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object created or modified
    Applied(K),
    /// Object removed
    Deleted(K),
    /// Watch (re)started; carries the full current list
    Restarted(Vec<K>),
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Versioned object store with optimistic-concurrency updates.
///
/// `update` fails with `Error::Conflict` when the object's resource version
/// is stale, and lookups of missing objects fail with
/// `Error::ResourceNotFound`.
#[async_trait]
pub trait ResourceStore<K: Object>: Send + Sync {
    /// Kind name used in errors and logs
    fn kind(&self) -> &str;

    async fn get(&self, name: &str) -> Result<K>;

    async fn list(&self, selector: &Selector) -> Result<Vec<K>>;

    async fn create(&self, object: &K) -> Result<K>;

    async fn update(&self, object: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Stream of changes, starting with a `Restarted` snapshot
    async fn watch(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;
}

// =============================================================================
// Host Operations Port
// =============================================================================

/// Host-side collaborators of the initialization pipeline
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Probe devices by major:minor; an empty list probes everything
    async fn probe_devices(&self, major_minors: &[String]) -> Result<Vec<Device>>;

    /// Current mount points of a device
    async fn mount_points(&self, major_minor: &str) -> Result<Vec<String>>;

    async fn make_fs(&self, device: &str, fs_uuid: &str, force: bool) -> Result<FsInfo>;

    /// Mount `device` at the mount directory of `fs_uuid`
    async fn mount(&self, device: &str, fs_uuid: &str) -> Result<()>;

    async fn unmount(&self, fs_uuid: &str) -> Result<()>;

    /// Create the self-referencing volume root entry
    async fn symlink(&self, fs_uuid: &str) -> Result<()>;

    async fn make_meta_dir(&self, fs_uuid: &str) -> Result<()>;

    async fn write_meta_file(&self, fs_uuid: &str, content: &str) -> Result<()>;

    /// Mount directory of a filesystem
    fn mount_dir(&self, fs_uuid: &str) -> String;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef<K> = Arc<dyn ResourceStore<K>>;
pub type HostOpsRef = Arc<dyn HostOps>;
