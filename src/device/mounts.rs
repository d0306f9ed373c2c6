//! Mount table
//!
//! Parses `/proc/<pid>/mountinfo` into mount points keyed by the
//! `major:minor` of the mounted device.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Mount points per device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    by_major_minor: BTreeMap<String, BTreeSet<String>>,
}

impl MountTable {
    /// Read and parse a mountinfo file
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse mountinfo content
    pub fn parse(content: &str) -> Result<Self> {
        let mut by_major_minor: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(Error::HardwareDiscovery(format!(
                    "invalid mountinfo line: {}",
                    line
                )));
            }
            by_major_minor
                .entry(fields[2].to_string())
                .or_default()
                .insert(unescape(fields[4]));
        }

        Ok(Self { by_major_minor })
    }

    /// Mount points of a device, sorted
    pub fn mount_points(&self, major_minor: &str) -> Vec<String> {
        self.by_major_minor
            .get(major_minor)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Decode the octal escapes the kernel uses for whitespace in paths
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
