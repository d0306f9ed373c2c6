//! Cluster object stores
//!
//! [`Clients`] bundles one store per resource kind. It is built once at
//! process start, either against the API server or in memory, and handed to
//! every component explicitly.

pub mod kubernetes;
pub mod memory;
pub mod retry;
pub mod selector;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;
pub use retry::{read_modify_write, retry_on_conflict, RetryPolicy};
pub use selector::Selector;

use crate::crd::{Drive, InitRequest, StorageNode, Volume};
use crate::domain::ports::ResourceStoreRef;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::Arc;

/// Stores for every kind the agent touches
#[derive(Clone)]
pub struct Clients {
    pub drives: ResourceStoreRef<Drive>,
    pub volumes: ResourceStoreRef<Volume>,
    pub nodes: ResourceStoreRef<StorageNode>,
    pub init_requests: ResourceStoreRef<InitRequest>,
    pub persistent_volumes: ResourceStoreRef<PersistentVolume>,
    pub retry: RetryPolicy,
}

impl Clients {
    /// Stores backed by the Kubernetes API
    pub fn kube(client: kube::Client) -> Self {
        Self {
            drives: Arc::new(KubeStore::new(client.clone())),
            volumes: Arc::new(KubeStore::new(client.clone())),
            nodes: Arc::new(KubeStore::new(client.clone())),
            init_requests: Arc::new(KubeStore::new(client.clone())),
            persistent_volumes: Arc::new(KubeStore::new(client)),
            retry: RetryPolicy::default(),
        }
    }

    /// Process-local stores for standalone mode and tests
    pub fn in_memory() -> Self {
        Self {
            drives: Arc::new(MemoryStore::new("Drive")),
            volumes: Arc::new(MemoryStore::new("Volume")),
            nodes: Arc::new(MemoryStore::new("StorageNode")),
            init_requests: Arc::new(MemoryStore::new("InitRequest")),
            persistent_volumes: Arc::new(MemoryStore::new("PersistentVolume")),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
