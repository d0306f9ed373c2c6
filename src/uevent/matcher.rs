//! Drive matcher
//!
//! Reconciles a live [`Device`] against the Drive records of its node. An
//! ordered chain of criteria narrows the candidate set; a criterion may also
//! declare a conclusive match, which ends narrowing immediately.
//!
//! A criterion that matches no candidate leaves the set as it was, so a
//! missing or drifted descriptive signal (capacity, filesystem type, block
//! size) never eliminates the right drive. Hardware identifiers are the
//! exception: when every remaining candidate carries a different serial,
//! WWID or device-mapper/RAID/partition UUID than the device, none of them
//! is the device. Such a criterion narrows the set to empty and the device
//! is reported as new rather than matched to a drive with other hardware.

use crate::crd::Drive;
use crate::device::Device;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Result of evaluating one criterion for one drive: `(matched, continue)`.
///
/// `continue == false` on a match means the drive is the device with
/// certainty and narrowing stops.
pub type Verdict = (bool, bool);

pub type CriterionFn = Arc<dyn Fn(&Drive, &Device) -> Verdict + Send + Sync>;

/// Named step of the matching chain
#[derive(Clone)]
pub struct Criterion {
    pub name: &'static str,
    /// An empty narrowing result ends the chain with no candidates
    pub identifying: bool,
    pub check: CriterionFn,
}

impl Criterion {
    pub fn new<F>(name: &'static str, check: F) -> Self
    where
        F: Fn(&Drive, &Device) -> Verdict + Send + Sync + 'static,
    {
        Self {
            name,
            identifying: false,
            check: Arc::new(check),
        }
    }

    fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Criterion")
            .field("name", &self.name)
            .field("identifying", &self.identifying)
            .finish()
    }
}

/// Matcher outcome
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// Device is new to the node
    NoMatch,
    /// Ambiguous; needs an administrator
    TooManyMatches(Vec<Drive>),
    /// Matched, record is out of date
    Changed(Drive),
    /// Matched, record is current
    NoChange(Drive),
}

impl MatchResult {
    pub fn label(&self) -> &'static str {
        match self {
            MatchResult::NoMatch => "no-match",
            MatchResult::TooManyMatches(_) => "too-many-matches",
            MatchResult::Changed(_) => "changed",
            MatchResult::NoChange(_) => "no-change",
        }
    }
}

// =============================================================================
// Criteria
// =============================================================================

/// Compare one attribute; an empty value on either side is an unavailable
/// signal and matches without narrowing
fn compare(drive_value: &str, device_value: &str, conclusive: bool) -> Verdict {
    if drive_value.is_empty() || device_value.is_empty() {
        return (true, true);
    }
    if drive_value == device_value {
        (true, !conclusive)
    } else {
        (false, true)
    }
}

fn compare_number(drive_value: u64, device_value: u64) -> Verdict {
    if drive_value == 0 || device_value == 0 {
        return (true, true);
    }
    (drive_value == device_value, true)
}

/// The production chain, in evaluation order
pub fn default_criteria() -> Vec<Criterion> {
    vec![
        Criterion::new("fs-uuid", |drive, device| {
            compare(&drive.spec.fs_uuid, device.fs_uuid(), true)
        }),
        Criterion::new("uevent-fs-uuid", |drive, device| {
            compare(&drive.spec.uevent_fs_uuid, device.fs_uuid(), false)
        }),
        Criterion::new("serial-number", |drive, device| {
            compare(&drive.spec.serial_number, device.serial(), false)
        })
        .identifying(),
        Criterion::new("uevent-serial-number", |drive, device| {
            compare(&drive.spec.uevent_serial, device.serial_short(), false)
        })
        .identifying(),
        Criterion::new("wwid", |drive, device| {
            compare(&drive.spec.wwid, device.wwid(), false)
        })
        .identifying(),
        Criterion::new("model", |drive, device| {
            compare(&drive.spec.model, device.model(), false)
        }),
        Criterion::new("vendor", |drive, device| {
            compare(&drive.spec.vendor, device.vendor(), false)
        }),
        Criterion::new("partition-number", |drive, device| {
            (drive.spec.partition_num == device.partition_number(), true)
        }),
        Criterion::new("dm-uuid", |drive, device| {
            compare(&drive.spec.dm_uuid, device.dm_uuid(), true)
        })
        .identifying(),
        Criterion::new("md-uuid", |drive, device| {
            compare(&drive.spec.md_uuid, device.md_uuid(), false)
        })
        .identifying(),
        Criterion::new("partition-uuid", |drive, device| {
            compare(&drive.spec.part_uuid, device.part_uuid(), true)
        })
        .identifying(),
        Criterion::new("partition-table-uuid", |drive, device| {
            compare(&drive.spec.pt_uuid, device.pt_uuid(), false)
        }),
        Criterion::new("logical-block-size", |drive, device| {
            compare_number(drive.spec.logical_block_size, device.logical_block_size)
        }),
        Criterion::new("physical-block-size", |drive, device| {
            compare_number(drive.spec.physical_block_size, device.physical_block_size)
        }),
        Criterion::new("filesystem", |drive, device| {
            compare(&drive.spec.filesystem, device.fs_type(), false)
        }),
        Criterion::new("total-capacity", |drive, device| {
            compare_number(drive.spec.size, device.size)
        }),
        Criterion::new("allocated-capacity", |drive, device| {
            (device.size == 0 || drive.spec.allocated_capacity <= device.size, true)
        }),
        Criterion::new("mount", |drive, device| {
            let mountpoint = &drive.spec.mountpoint;
            (
                mountpoint.is_empty() || device.mount_points.iter().any(|m| m == mountpoint),
                true,
            )
        }),
    ]
}

// =============================================================================
// Matcher
// =============================================================================

/// Ordered criteria chain
#[derive(Debug, Clone)]
pub struct Matcher {
    criteria: Vec<Criterion>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(default_criteria())
    }
}

impl Matcher {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self { criteria }
    }

    /// Narrow `drives` to those that may be `device`
    pub fn candidates(&self, drives: &[Drive], device: &Device) -> Vec<Drive> {
        let mut candidates: Vec<&Drive> = drives.iter().collect();

        for criterion in &self.criteria {
            if candidates.is_empty() {
                break;
            }

            let mut matched = Vec::with_capacity(candidates.len());
            for drive in &candidates {
                let (is_match, proceed) = (criterion.check)(drive, device);
                if !is_match {
                    continue;
                }
                if !proceed {
                    trace!(criterion = criterion.name, "Conclusive match for {}", device.name);
                    return vec![(*drive).clone()];
                }
                matched.push(*drive);
            }

            if matched.is_empty() && !criterion.identifying {
                continue;
            }
            candidates = matched;
        }

        candidates.into_iter().cloned().collect()
    }

    /// Match `device` against the node's drives
    pub fn run(&self, drives: &[Drive], device: &Device) -> MatchResult {
        let mut candidates = self.candidates(drives, device);
        match candidates.len() {
            0 => MatchResult::NoMatch,
            1 => {
                let drive = candidates.remove(0);
                if validate_non_host_info(&drive, device) && validate_host_info(&drive, device) {
                    MatchResult::NoChange(drive)
                } else {
                    MatchResult::Changed(drive)
                }
            }
            _ => MatchResult::TooManyMatches(candidates),
        }
    }
}

/// Attributes udev reports about the device itself
fn validate_non_host_info(drive: &Drive, device: &Device) -> bool {
    let spec = &drive.spec;
    spec.uevent_fs_uuid == device.fs_uuid()
        && spec.filesystem == device.fs_type()
        && spec.serial_number == device.serial()
        && spec.uevent_serial == device.serial_short()
        && spec.wwid == device.wwid()
        && spec.model == device.model()
        && spec.vendor == device.vendor()
        && spec.partition_num == device.partition_number()
        && spec.dm_uuid == device.dm_uuid()
        && spec.md_uuid == device.md_uuid()
        && spec.part_uuid == device.part_uuid()
        && spec.pt_uuid == device.pt_uuid()
}

/// Attributes that depend on where and how the host attached the device
fn validate_host_info(drive: &Drive, device: &Device) -> bool {
    let spec = &drive.spec;
    spec.path == device.dev_path()
        && spec.major == device.major
        && spec.minor == device.minor
        && spec.size == device.size
        && spec.read_only == device.read_only
        && spec.removable == device.removable
        && spec.dm_name == device.dm_name
        && spec.logical_block_size == device.logical_block_size
        && spec.physical_block_size == device.physical_block_size
        && spec.make == device.make()
}
