//! Capacity accounting through drive finalizers

pub mod capacity;

pub use capacity::{Association, CapacityLedger, LedgerReport};
