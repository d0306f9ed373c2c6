//! Custom Resource Definitions for the drive agent
//!
//! This module contains all CRD types:
//! - Drive: a managed host block device
//! - Volume: a claim on space within a drive
//! - StorageNode: per-node device inventory
//! - InitRequest: batch initialization job addressed to nodes

pub mod drive;
pub mod init_request;
pub mod storage_node;
pub mod volume;

pub use drive::*;
pub use init_request::*;
pub use storage_node::*;
pub use volume::*;
