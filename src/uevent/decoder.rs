//! Uevent wire decoder
//!
//! Decodes messages published by udev on the netlink uevent socket:
//!
//! ```text
//! 0        8         12       16      17 ..        offset ..
//! +--------+---------+--------+-------+------------+-------------------------+
//! |libudev\0| magic  | ...    | offset| ...        | KEY=VALUE\0KEY=VALUE\0  |
//! +--------+---------+--------+-------+------------+-------------------------+
//! ```
//!
//! The magic is big-endian; the payload offset is a single byte.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

/// Signature at the start of every udev monitor message
pub const SIGNATURE: &[u8; 8] = b"libudev\0";

/// Expected magic at byte offset 8
pub const MAGIC: u32 = 0xfeed_cafe;

const MAGIC_OFFSET: usize = 8;
const PAYLOAD_OFFSET_FIELD: usize = 16;

/// Smallest valid payload offset
pub const MIN_HEADER_SIZE: usize = 17;

/// Header size written by [`encode`]
const ENCODED_HEADER_SIZE: usize = 40;

// =============================================================================
// Raw decode
// =============================================================================

/// Decode a raw message into its properties
pub fn decode(msg: &[u8]) -> Result<BTreeMap<String, String>> {
    if msg.is_empty() {
        return Err(Error::EmptyBuffer);
    }
    if msg.len() < SIGNATURE.len() || &msg[..SIGNATURE.len()] != SIGNATURE {
        return Err(Error::MalformedSignature);
    }
    if msg.len() <= PAYLOAD_OFFSET_FIELD {
        return Err(Error::InvalidOffset {
            offset: 0,
            len: msg.len(),
        });
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&msg[MAGIC_OFFSET..MAGIC_OFFSET + 4]);
    let got = u32::from_be_bytes(magic);
    if got != MAGIC {
        return Err(Error::MagicMismatch {
            expected: MAGIC,
            got,
        });
    }

    let offset = usize::from(msg[PAYLOAD_OFFSET_FIELD]);
    if offset < MIN_HEADER_SIZE || offset > msg.len() {
        return Err(Error::InvalidOffset {
            offset,
            len: msg.len(),
        });
    }

    Ok(msg[offset..]
        .split(|b| *b == 0)
        .filter(|field| !field.is_empty())
        .map(|field| {
            let field = String::from_utf8_lossy(field);
            match field.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (field.to_string(), String::new()),
            }
        })
        .collect())
}

/// Build a udev monitor message carrying `properties`
pub fn encode(properties: &BTreeMap<String, String>) -> Vec<u8> {
    let mut msg = vec![0u8; ENCODED_HEADER_SIZE];
    msg[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
    msg[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC.to_be_bytes());
    msg[PAYLOAD_OFFSET_FIELD] = ENCODED_HEADER_SIZE as u8;

    for (key, value) in properties {
        msg.extend_from_slice(key.as_bytes());
        if !value.is_empty() {
            msg.push(b'=');
            msg.extend_from_slice(value.as_bytes());
        }
        msg.push(0);
    }
    msg
}

// =============================================================================
// Typed udev data
// =============================================================================

/// Device identity carried by a uevent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevData {
    pub path: String,
    pub major: u32,
    pub minor: u32,
    pub partition: u32,
    pub wwid: String,
    pub model: String,
    pub uevent_serial: String,
    pub vendor: String,
    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,
    pub pt_uuid: String,
    pub pt_type: String,
    pub part_uuid: String,
    pub uevent_fs_uuid: String,
    pub fs_type: String,
}

fn parse_number(properties: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    match properties.get(key).map(String::as_str) {
        None | Some("") => Ok(0),
        Some(value) => value.parse().map_err(|_| Error::FieldConversion {
            field: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Second-stage decode of raw properties
pub fn map_to_udev_data(properties: &BTreeMap<String, String>) -> Result<UdevData> {
    let text = |key: &str| properties.get(key).cloned().unwrap_or_default();

    Ok(UdevData {
        path: text("DEVPATH"),
        major: parse_number(properties, "MAJOR")?,
        minor: parse_number(properties, "MINOR")?,
        partition: parse_number(properties, "ID_PART_ENTRY_NUMBER")?,
        wwid: text("ID_WWN"),
        model: text("ID_MODEL"),
        uevent_serial: text("ID_SERIAL_SHORT"),
        vendor: text("ID_VENDOR"),
        dm_name: text("DM_NAME"),
        dm_uuid: text("DM_UUID"),
        md_uuid: text("MD_UUID"),
        pt_uuid: text("ID_PART_TABLE_UUID"),
        pt_type: text("ID_PART_TABLE_TYPE"),
        part_uuid: text("ID_PART_ENTRY_UUID"),
        uevent_fs_uuid: text("ID_FS_UUID"),
        fs_type: text("ID_FS_TYPE"),
    })
}

// =============================================================================
// Device events
// =============================================================================

/// Hotplug action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl std::str::FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Action::Add),
            "change" => Ok(Action::Change),
            "remove" => Ok(Action::Remove),
            other => Err(Error::InvalidEvent(format!("invalid device action {:?}", other))),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Add => write!(f, "add"),
            Action::Change => write!(f, "change"),
            Action::Remove => write!(f, "remove"),
        }
    }
}

/// Decoded block device hotplug notification
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub created: DateTime<Utc>,
    pub action: Action,
    pub properties: BTreeMap<String, String>,
    pub udev_data: UdevData,
    /// /dev/<name>
    pub dev_path: String,
    pub major: u32,
    pub minor: u32,
}

impl DeviceEvent {
    /// Kernel name of the device
    pub fn name(&self) -> &str {
        self.dev_path.rsplit('/').next().unwrap_or("")
    }

    pub fn major_minor(&self) -> String {
        format!("{}:{}", self.major, self.minor)
    }
}

/// Decode a block device event; other subsystems yield `Error::NonDeviceEvent`
pub fn parse_device_event(msg: &[u8]) -> Result<DeviceEvent> {
    let properties = decode(msg)?;

    if properties.get("SUBSYSTEM").map(String::as_str) != Some("block") {
        return Err(Error::NonDeviceEvent);
    }

    let action: Action = properties
        .get("ACTION")
        .map(String::as_str)
        .unwrap_or("")
        .parse()?;

    let path = properties.get("DEVPATH").map(String::as_str).unwrap_or("");
    if path.is_empty() {
        return Err(Error::InvalidEvent("empty device path".into()));
    }
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidEvent(format!("invalid device path {:?}", path)))?;

    let udev_data = map_to_udev_data(&properties)?;

    Ok(DeviceEvent {
        created: Utc::now(),
        action,
        dev_path: format!("{}/{}", crate::consts::DEV_DIR, name),
        major: udev_data.major,
        minor: udev_data.minor,
        properties,
        udev_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn loop7() -> BTreeMap<String, String> {
        props(&[
            ("ACTION", "add"),
            ("SUBSYSTEM", "block"),
            ("DEVPATH", "/devices/virtual/block/loop7"),
            ("MAJOR", "7"),
            ("MINOR", "0"),
            ("ID_FS_UUID", "ID_FS_UUID"),
            ("ID_FS_TYPE", "ID_FS_TYPE"),
        ])
    }

    #[test]
    fn test_decode_round_trip() {
        let properties = loop7();
        assert_eq!(decode(&encode(&properties)).unwrap(), properties);
    }

    #[test]
    fn test_decode_ignores_field_order_and_empty_fields() {
        let mut msg = encode(&BTreeMap::new());
        msg.extend_from_slice(b"MINOR=0\0\0MAJOR=7\0DEVNAME\0SEQNUM=12=3\0");
        let properties = decode(&msg).unwrap();
        assert_eq!(
            properties,
            props(&[("MAJOR", "7"), ("MINOR", "0"), ("DEVNAME", ""), ("SEQNUM", "12=3")])
        );
    }

    #[test]
    fn test_decode_rejects_bad_signature() {
        let mut msg = encode(&loop7());
        msg[0] = b'L';
        assert_matches!(decode(&msg), Err(Error::MalformedSignature));
        assert_matches!(decode(b"lib"), Err(Error::MalformedSignature));
        assert_matches!(decode(&[]), Err(Error::EmptyBuffer));
    }

    #[test]
    fn test_decode_rejects_magic_mismatch() {
        let mut msg = encode(&loop7());
        msg[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&0xcafe_feedu32.to_be_bytes());
        assert_matches!(
            decode(&msg),
            Err(Error::MagicMismatch { expected: MAGIC, got: 0xcafe_feed })
        );
    }

    #[test]
    fn test_decode_rejects_bad_offsets() {
        for offset in [0u8, 8, 16] {
            let mut msg = encode(&loop7());
            msg[PAYLOAD_OFFSET_FIELD] = offset;
            assert_matches!(decode(&msg), Err(Error::InvalidOffset { .. }), "offset {}", offset);
        }

        let mut msg = encode(&BTreeMap::new());
        msg[PAYLOAD_OFFSET_FIELD] = 255;
        assert_matches!(decode(&msg), Err(Error::InvalidOffset { offset: 255, .. }));

        // Offset equal to the length is an empty payload
        let mut msg = encode(&BTreeMap::new());
        msg[PAYLOAD_OFFSET_FIELD] = msg.len() as u8;
        assert!(decode(&msg).unwrap().is_empty());
    }

    #[test]
    fn test_map_to_udev_data() {
        let properties = props(&[
            ("DEVPATH", "/devices/virtual/block/loop7"),
            ("MAJOR", "7"),
            ("MINOR", "0"),
            ("ID_PART_ENTRY_NUMBER", "7"),
            ("ID_WWN", "ID_WWN"),
            ("ID_MODEL", "ID_MODEL"),
            ("ID_SERIAL_SHORT", "ID_SERIAL_SHORT"),
            ("ID_VENDOR", "ID_VENDOR"),
            ("DM_NAME", "DM_NAME"),
            ("DM_UUID", "DM_UUID"),
            ("MD_UUID", "MD_UUID"),
            ("ID_PART_TABLE_UUID", "ID_PART_TABLE_UUID"),
            ("ID_PART_TABLE_TYPE", "ID_PART_TABLE_TYPE"),
            ("ID_PART_ENTRY_UUID", "ID_PART_ENTRY_UUID"),
            ("ID_FS_UUID", "ID_FS_UUID"),
            ("ID_FS_TYPE", "ID_FS_TYPE"),
        ]);

        let data = map_to_udev_data(&properties).unwrap();
        assert_eq!(
            data,
            UdevData {
                path: "/devices/virtual/block/loop7".into(),
                major: 7,
                minor: 0,
                partition: 7,
                wwid: "ID_WWN".into(),
                model: "ID_MODEL".into(),
                uevent_serial: "ID_SERIAL_SHORT".into(),
                vendor: "ID_VENDOR".into(),
                dm_name: "DM_NAME".into(),
                dm_uuid: "DM_UUID".into(),
                md_uuid: "MD_UUID".into(),
                pt_uuid: "ID_PART_TABLE_UUID".into(),
                pt_type: "ID_PART_TABLE_TYPE".into(),
                part_uuid: "ID_PART_ENTRY_UUID".into(),
                uevent_fs_uuid: "ID_FS_UUID".into(),
                fs_type: "ID_FS_TYPE".into(),
            }
        );
    }

    #[test]
    fn test_map_to_udev_data_rejects_non_numeric() {
        let properties = props(&[("MAJOR", "seven"), ("MINOR", "0")]);
        assert_matches!(
            map_to_udev_data(&properties),
            Err(Error::FieldConversion { field, .. }) if field == "MAJOR"
        );
    }

    #[test]
    fn test_parse_device_event_loop7() {
        let event = parse_device_event(&encode(&loop7())).unwrap();
        assert_eq!(event.action, Action::Add);
        assert_eq!(event.dev_path, "/dev/loop7");
        assert_eq!(event.name(), "loop7");
        assert_eq!(event.major_minor(), "7:0");
        assert_eq!(event.udev_data.major, 7);
        assert_eq!(event.udev_data.minor, 0);
        assert_eq!(event.udev_data.uevent_fs_uuid, "ID_FS_UUID");
        assert_eq!(event.udev_data.fs_type, "ID_FS_TYPE");
    }

    #[test]
    fn test_parse_device_event_validation() {
        let mut usb = loop7();
        usb.insert("SUBSYSTEM".into(), "usb".into());
        assert_matches!(parse_device_event(&encode(&usb)), Err(Error::NonDeviceEvent));

        let mut bind = loop7();
        bind.insert("ACTION".into(), "bind".into());
        assert_matches!(parse_device_event(&encode(&bind)), Err(Error::InvalidEvent(_)));

        let mut no_path = loop7();
        no_path.remove("DEVPATH");
        assert_matches!(parse_device_event(&encode(&no_path)), Err(Error::InvalidEvent(_)));
    }
}
