//! Hotplug event pipeline
//!
//! ```text
//! netlink socket ─► Listener ─► decoder ─► UeventProcessor ─► Matcher ─► DeviceEventHandler
//! ```

pub mod decoder;
pub mod handler;
pub mod listener;
pub mod matcher;

pub use decoder::{decode, encode, map_to_udev_data, parse_device_event, Action, DeviceEvent, UdevData};
pub use handler::{device_from_event, DeviceEventHandler, DriveEventHandler, UeventProcessor};
pub use listener::{Listener, MonitorSocket, NetlinkSocket};
pub use matcher::{Criterion, MatchResult, Matcher};
