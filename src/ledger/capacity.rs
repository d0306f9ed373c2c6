//! Capacity ledger
//!
//! A drive's allocated capacity is derived from the per-volume finalizer
//! tokens it carries. The ledger attaches and releases those tokens and
//! repairs drives whose tokens reference volumes that are gone.

use crate::consts::DRIVE_FINALIZER_DATA_PROTECTION;
use crate::crd::{Drive, DriveStatus};
use crate::domain::ports::ResourceStore;
use crate::error::{ignore_not_found, Result};
use crate::store::{read_modify_write, retry_on_conflict, Clients};
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Persistent volume phases after which the backing volume will not return
const DEAD_PV_PHASES: &[&str] = &["Released", "Failed"];

/// State of one volume association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// Volume record exists; carries its capacity
    Live(u64),
    /// Volume record missing but its persistent volume is still bound
    Unobserved,
    /// Volume and persistent volume are gone or dead
    Stale,
}

/// Result of checking one drive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerReport {
    pub drive: String,
    pub associations: BTreeMap<String, Association>,
    pub recorded_allocated: u64,
    pub total_capacity: u64,
}

impl LedgerReport {
    pub fn stale(&self) -> Vec<String> {
        self.associations
            .iter()
            .filter(|(_, a)| **a == Association::Stale)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Sum of live volume capacities
    pub fn live_capacity(&self) -> u64 {
        self.associations
            .values()
            .map(|a| match a {
                Association::Live(capacity) => *capacity,
                _ => 0,
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Allocated capacity the drive should record.
    ///
    /// With an unobservable association the true sum is unknown and the
    /// recorded value is kept. The result never exceeds total capacity.
    pub fn expected_allocated(&self) -> u64 {
        let unobserved = self
            .associations
            .values()
            .any(|a| *a == Association::Unobserved);
        let expected = if unobserved {
            self.recorded_allocated
        } else {
            self.live_capacity()
        };

        if self.total_capacity > 0 && expected > self.total_capacity {
            warn!(
                "Drive {} allocation {} exceeds capacity {}, clamping",
                self.drive, expected, self.total_capacity
            );
            return self.total_capacity;
        }
        expected
    }

    pub fn is_consistent(&self) -> bool {
        self.stale().is_empty() && self.expected_allocated() == self.recorded_allocated
    }
}

/// Finalizer-based capacity accounting for drives
#[derive(Clone)]
pub struct CapacityLedger {
    clients: Clients,
}

impl CapacityLedger {
    pub fn new(clients: Clients) -> Self {
        Self { clients }
    }

    /// Classify the volume named by one finalizer token.
    ///
    /// A missing Volume is only stale once its persistent volume is gone or
    /// released/failed; otherwise it may still be on its way back.
    pub async fn association(&self, volume: &str) -> Result<Association> {
        if let Some(volume) = ignore_not_found(self.clients.volumes.get(volume).await)? {
            return Ok(Association::Live(volume.spec.total_capacity));
        }

        let pv = ignore_not_found(self.clients.persistent_volumes.get(volume).await)?;
        let dead = match &pv {
            None => true,
            Some(pv) => pv
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .map(|phase| DEAD_PV_PHASES.contains(&phase))
                .unwrap_or(false),
        };

        Ok(if dead {
            Association::Stale
        } else {
            Association::Unobserved
        })
    }

    /// Report live and stale associations of `drive`
    pub async fn check(&self, drive: &Drive) -> Result<LedgerReport> {
        let mut associations = BTreeMap::new();
        for volume in drive.volume_names() {
            let association = self.association(&volume).await?;
            associations.insert(volume, association);
        }

        Ok(LedgerReport {
            drive: drive.name_any(),
            associations,
            recorded_allocated: drive.spec.allocated_capacity,
            total_capacity: drive.spec.total_capacity,
        })
    }

    /// Drop stale tokens and correct allocated capacity.
    ///
    /// Idempotent: a consistent drive is not written.
    pub async fn repair(&self, name: &str) -> Result<LedgerReport> {
        let drives = self.clients.drives.as_ref();
        retry_on_conflict(&self.clients.retry, || async move {
            let mut drive = drives.get(name).await?;
            let report = self.check(&drive).await?;
            if report.is_consistent() {
                return Ok(report);
            }

            let stale = report.stale();
            for volume in &stale {
                info!("Removing stale volume {} from drive {}", volume, name);
            }
            let tokens: Vec<String> = stale.iter().map(|v| Drive::volume_finalizer(v)).collect();
            drive.finalizers_mut().retain(|f| !tokens.contains(f));
            drive.spec.allocated_capacity = report.expected_allocated();
            release_protection_if_unused(&mut drive);

            drives.update(&drive).await?;
            Ok(report)
        })
        .await
    }

    /// Record `volume` on drive `name`
    pub async fn attach_volume(&self, name: &str, volume: &str, capacity: u64) -> Result<Option<Drive>> {
        let token = Drive::volume_finalizer(volume);
        read_modify_write(
            self.clients.drives.as_ref(),
            name,
            &self.clients.retry,
            |drive: &mut Drive| {
                if drive.finalizers().contains(&token) {
                    return Ok(false);
                }
                let finalizers = drive.finalizers_mut();
                finalizers.push(token.clone());
                if !finalizers.iter().any(|f| f == DRIVE_FINALIZER_DATA_PROTECTION) {
                    finalizers.push(DRIVE_FINALIZER_DATA_PROTECTION.to_string());
                }
                drive.spec.allocated_capacity = drive.spec.allocated_capacity.saturating_add(capacity);
                drive.spec.status = DriveStatus::InUse;
                Ok(true)
            },
        )
        .await
    }

    /// Forget `volume` on drive `name`; a missing drive is not an error
    pub async fn release_volume(&self, name: &str, volume: &str, capacity: u64) -> Result<Option<Drive>> {
        let token = Drive::volume_finalizer(volume);
        let result = read_modify_write(
            self.clients.drives.as_ref(),
            name,
            &self.clients.retry,
            |drive: &mut Drive| {
                if !drive.finalizers().contains(&token) {
                    return Ok(false);
                }
                drive.finalizers_mut().retain(|f| *f != token);
                drive.spec.allocated_capacity = drive.spec.allocated_capacity.saturating_sub(capacity);
                release_protection_if_unused(drive);
                Ok(true)
            },
        )
        .await;

        Ok(ignore_not_found(result)?.flatten())
    }
}

/// Once no volume token remains, the drive no longer needs data protection
fn release_protection_if_unused(drive: &mut Drive) {
    if !drive.volume_names().is_empty() {
        return;
    }
    drive
        .finalizers_mut()
        .retain(|f| f != DRIVE_FINALIZER_DATA_PROTECTION);
    if drive.spec.status == DriveStatus::InUse {
        debug!("Drive {} has no volumes left", drive.name_any());
        drive.spec.status = DriveStatus::Ready;
    }
}
