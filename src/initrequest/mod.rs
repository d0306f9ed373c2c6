//! Batch device initialization
//!
//! Requestors submit an [`InitRequest`](crate::crd::InitRequest) built from
//! an [`InitConfig`]; each addressed node's [`InitRequestHandler`] answers it
//! and [`wait_for_completion`] reports when all of them have.

pub mod config;
pub mod handler;
pub mod lister;
pub mod wait;

pub use config::{DriveInfo, InitConfig, NodeInfo};
pub use handler::InitRequestHandler;
pub use lister::InitRequestLister;
pub use wait::wait_for_completion;
