//! Smart Drive Agent
//!
//! Node-local agent that discovers block devices, keeps a Drive record for
//! each one in step with hotplug events, and formats, mounts and registers
//! devices on request.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Smart Drive Agent                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Uevent         │  │  InitRequest    │  │  StorageNode                │  │
//! │  │  Listener       │  │  Controller     │  │  Controller                 │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │  ┌────────┴────────┐  ┌────────┴────────┐  ┌─────────────┴───────────────┐  │
//! │  │  Drive Matcher  │  │  Init Pipeline  │  │  Node Sync                  │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └──────────┬─────────┴──────────┬──────────────┘                   │
//! │                      │                    │                                  │
//! │          ┌───────────┴─────────┐ ┌────────┴──────────┐                       │
//! │          │  Capacity Ledger    │ │  Device Prober    │                       │
//! │          └───────────┬─────────┘ └────────┬──────────┘                       │
//! ├──────────────────────┼────────────────────┼──────────────────────────────────┤
//! │     Resource stores (Kubernetes / memory) │  sysfs · procfs · udev · xfs     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`uevent`]: Hotplug event decoding, listening, matching and dispatch
//! - [`device`]: Block device probing and identity
//! - [`initrequest`]: Batch device initialization
//! - [`ledger`]: Drive capacity accounting through finalizer tokens
//! - [`node`]: Node device inventory
//! - [`controller`]: Generic list/watch reconciliation
//! - [`store`]: Cluster object stores and conflict retry
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod consts;
pub mod controller;
pub mod crd;
pub mod device;
pub mod domain;
pub mod error;
pub mod host;
pub mod initrequest;
pub mod ledger;
pub mod metrics;
pub mod node;
pub mod store;
pub mod uevent;
pub mod xfs;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::AgentConfig;

pub use controller::{Controller, ControllerConfig, EventHandler, EventType};

pub use crd::{
    Drive, DriveSpec, DriveStatus, InitDevice, InitDeviceResult, InitRequest, InitRequestSpec,
    InitResult, NodeDevice, StorageNode, StorageNodeSpec, Volume, VolumeSpec,
};

pub use device::{Device, HostPaths, Prober};

pub use domain::ports::{HostOps, HostOpsRef, ResourceStore, ResourceStoreRef, WatchEvent};

pub use error::{Error, ErrorAction, InitStage, Result};

pub use host::{DriveLayout, LinuxHost};

pub use initrequest::{wait_for_completion, InitConfig, InitRequestHandler, InitRequestLister};

pub use ledger::{Association, CapacityLedger, LedgerReport};

pub use metrics::Metrics;

pub use node::{NodeEventHandler, NodeSync};

pub use store::{Clients, KubeStore, MemoryStore, RetryPolicy, Selector};

pub use uevent::{
    DeviceEvent, DeviceEventHandler, DriveEventHandler, Listener, MatchResult, Matcher,
    NetlinkSocket, UeventProcessor,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
