//! Per-node device inventory

pub mod handler;
pub mod sync;

pub use handler::NodeEventHandler;
pub use sync::NodeSync;
