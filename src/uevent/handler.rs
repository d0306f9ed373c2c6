//! Hotplug event dispatch
//!
//! [`UeventProcessor`] resolves each [`DeviceEvent`] to a live [`Device`],
//! matches it against the node's Drive records and hands the outcome to a
//! [`DeviceEventHandler`]:
//!
//! | action        | match result    | handler call |
//! |---------------|-----------------|--------------|
//! | add / change  | no match        | `add`        |
//! | add / change  | changed         | `change`     |
//! | add / change  | no change       | `change` if the drive was unavailable |
//! | remove        | changed / same  | `remove`     |
//! | remove        | no match        | none         |
//! | any           | too many        | error, no write |

use super::decoder::{Action, DeviceEvent};
use super::matcher::{MatchResult, Matcher};
use crate::consts::NODE_LABEL_KEY;
use crate::crd::{Drive, DriveStatus};
use crate::device::Device;
use crate::domain::ports::{HostOpsRef, ResourceStore};
use crate::error::{Error, Result};
use crate::ledger::CapacityLedger;
use crate::metrics::Metrics;
use crate::store::{read_modify_write, Clients, Selector};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Handler capability
// =============================================================================

/// Reaction to a matched hotplug event
#[async_trait]
pub trait DeviceEventHandler: Send + Sync {
    /// Device is new to the node
    async fn add(&self, device: &Device) -> Result<()>;

    /// Device matches `drive` but the record is out of date
    async fn change(&self, drive: &Drive, device: &Device) -> Result<()>;

    /// Device backing `drive` left the host
    async fn remove(&self, drive: &Drive) -> Result<()>;
}

/// Keeps Drive records in step with hotplug events
pub struct DriveEventHandler {
    node_id: String,
    topology: BTreeMap<String, String>,
    clients: Clients,
    ledger: CapacityLedger,
}

impl DriveEventHandler {
    pub fn new(node_id: impl Into<String>, topology: BTreeMap<String, String>, clients: Clients) -> Self {
        Self {
            node_id: node_id.into(),
            topology,
            ledger: CapacityLedger::new(clients.clone()),
            clients,
        }
    }
}

/// Status a drive returns to once its device is back
fn restored_status(drive: &Drive) -> DriveStatus {
    if !drive.volume_names().is_empty() {
        DriveStatus::InUse
    } else if !drive.spec.fs_uuid.is_empty() {
        DriveStatus::Ready
    } else {
        DriveStatus::Available
    }
}

#[async_trait]
impl DeviceEventHandler for DriveEventHandler {
    async fn add(&self, device: &Device) -> Result<()> {
        let name = uuid::Uuid::new_v4().to_string();
        let drive = Drive::from_device(&name, &self.node_id, device, self.topology.clone());
        self.clients.drives.create(&drive).await?;
        info!("Added drive {} for {}", name, device.dev_path());
        Ok(())
    }

    async fn change(&self, drive: &Drive, device: &Device) -> Result<()> {
        let name = drive.name_any();
        let allocated = self.ledger.check(drive).await?.expected_allocated();

        let updated = read_modify_write(
            self.clients.drives.as_ref(),
            &name,
            &self.clients.retry,
            |drive: &mut Drive| {
                let mut changed = drive.spec.sync_from_device(device);
                if drive.spec.allocated_capacity != allocated {
                    drive.spec.allocated_capacity = allocated;
                    changed = true;
                }
                if drive.spec.status == DriveStatus::Unavailable {
                    drive.spec.status = restored_status(drive);
                    changed = true;
                }
                Ok(changed)
            },
        )
        .await?;

        if updated.is_some() {
            info!("Updated drive {} from {}", name, device.dev_path());
        }
        Ok(())
    }

    async fn remove(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        let updated = read_modify_write(
            self.clients.drives.as_ref(),
            &name,
            &self.clients.retry,
            |drive: &mut Drive| {
                if drive.spec.status == DriveStatus::Unavailable {
                    return Ok(false);
                }
                drive.spec.status = DriveStatus::Unavailable;
                Ok(true)
            },
        )
        .await?;

        if updated.is_some() {
            warn!("Drive {} ({}) is unavailable", name, drive.spec.path);
        }
        Ok(())
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Device built from the event alone, for devices already gone from sysfs
pub fn device_from_event(event: &DeviceEvent) -> Device {
    Device {
        name: event.name().to_string(),
        major_minor: event.major_minor(),
        major: event.major,
        minor: event.minor,
        dm_name: event.udev_data.dm_name.clone(),
        udev_data: event
            .properties
            .iter()
            .filter(|(key, _)| ["ID_", "DM_", "MD_"].iter().any(|p| key.starts_with(p)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        ..Default::default()
    }
}

/// Routes hotplug events for one node
pub struct UeventProcessor {
    node_id: String,
    host: HostOpsRef,
    clients: Clients,
    matcher: Matcher,
    handler: Arc<dyn DeviceEventHandler>,
    metrics: Option<Metrics>,
}

impl UeventProcessor {
    pub fn new(
        node_id: impl Into<String>,
        host: HostOpsRef,
        clients: Clients,
        handler: Arc<dyn DeviceEventHandler>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            host,
            clients,
            matcher: Matcher::default(),
            handler,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Live view of the event's device
    async fn resolve(&self, event: &DeviceEvent) -> Result<Device> {
        if event.action != Action::Remove {
            let probed = self.host.probe_devices(&[event.major_minor()]).await?;
            if let Some(device) = probed.into_iter().find(|d| d.name == event.name()) {
                return Ok(device);
            }
            debug!("{} not visible on host, using event data", event.dev_path);
        }
        Ok(device_from_event(event))
    }

    /// Handle one event
    pub async fn process(&self, event: &DeviceEvent) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            let action = event.action.to_string();
            metrics.uevents.with_label_values(&[action.as_str()]).inc();
        }

        let device = self.resolve(event).await?;
        let selector = Selector::new().label(NODE_LABEL_KEY, &self.node_id);
        let drives = self.clients.drives.list(&selector).await?;

        let result = self.matcher.run(&drives, &device);
        debug!(
            "{} {} matched {}",
            event.action,
            event.dev_path,
            result.label()
        );
        if let Some(metrics) = &self.metrics {
            metrics.matches.with_label_values(&[result.label()]).inc();
        }

        match (event.action, result) {
            (_, MatchResult::TooManyMatches(candidates)) => Err(Error::AmbiguousMatch {
                device: device.dev_path(),
                count: candidates.len(),
            }),
            (Action::Remove, MatchResult::NoMatch) => Ok(()),
            (Action::Remove, MatchResult::Changed(drive))
            | (Action::Remove, MatchResult::NoChange(drive)) => self.handler.remove(&drive).await,
            (_, MatchResult::NoMatch) => self.handler.add(&device).await,
            (_, MatchResult::Changed(drive)) => self.handler.change(&drive, &device).await,
            (_, MatchResult::NoChange(drive)) if drive.spec.status == DriveStatus::Unavailable => {
                self.handler.change(&drive, &device).await
            }
            (_, MatchResult::NoChange(_)) => Ok(()),
        }
    }

    /// Process events until cancelled or the sender goes away
    pub async fn run(&self, cancel: CancellationToken, mut events: mpsc::Receiver<DeviceEvent>) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match self.process(&event).await {
                Ok(()) => {}
                Err(e @ Error::AmbiguousMatch { .. }) => {
                    error!("{}; resolve the duplicate drive records manually", e)
                }
                Err(e) => warn!("Failed to handle {} {}: {}", event.action, event.dev_path, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{disk, RecordingHost};
    use crate::uevent::decoder::{encode, parse_device_event};
    use assert_matches::assert_matches;

    fn event(action: &str, device: &Device) -> DeviceEvent {
        let mut properties: BTreeMap<String, String> = device.udev_data.clone();
        properties.extend([
            ("ACTION".to_string(), action.to_string()),
            ("SUBSYSTEM".to_string(), "block".to_string()),
            ("DEVPATH".to_string(), format!("/devices/pci0000:00/block/{}", device.name)),
            ("MAJOR".to_string(), device.major.to_string()),
            ("MINOR".to_string(), device.minor.to_string()),
        ]);
        parse_device_event(&encode(&properties)).unwrap()
    }

    fn processor(host: RecordingHost, clients: &Clients) -> UeventProcessor {
        let handler = Arc::new(DriveEventHandler::new("node-1", BTreeMap::new(), clients.clone()));
        UeventProcessor::new("node-1", Arc::new(host), clients.clone(), handler)
    }

    async fn drives(clients: &Clients) -> Vec<Drive> {
        clients.drives.list(&Selector::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_creates_available_drive_once() {
        let clients = Clients::in_memory();
        let sdb = disk("sdb", 16, "S1");
        let processor = processor(RecordingHost::with_devices(vec![sdb.clone()]), &clients);

        processor.process(&event("add", &sdb)).await.unwrap();
        processor.process(&event("add", &sdb)).await.unwrap();

        let drives = drives(&clients).await;
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].spec.status, DriveStatus::Available);
        assert_eq!(drives[0].spec.path, "/dev/sdb");
        assert_eq!(drives[0].labels().get(NODE_LABEL_KEY).map(String::as_str), Some("node-1"));
    }

    #[tokio::test]
    async fn test_change_follows_renamed_device() {
        let clients = Clients::in_memory();
        let sdb = disk("sdb", 16, "S1");
        clients
            .drives
            .create(&Drive::from_device("d1", "node-1", &sdb, BTreeMap::new()))
            .await
            .unwrap();

        let renamed = disk("sdc", 32, "S1");
        let processor = processor(RecordingHost::with_devices(vec![renamed.clone()]), &clients);
        processor.process(&event("change", &renamed)).await.unwrap();

        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.spec.path, "/dev/sdc");
        assert_eq!(drive.spec.minor, 32);
        assert_eq!(drives(&clients).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_marks_unavailable_and_add_restores() {
        let clients = Clients::in_memory();
        let sdb = disk("sdb", 16, "S1");
        let mut drive = Drive::from_device("d1", "node-1", &sdb, BTreeMap::new());
        drive.spec.fs_uuid = "fs-1".into();
        drive.spec.status = DriveStatus::Ready;
        clients.drives.create(&drive).await.unwrap();

        // Device already gone from sysfs
        let processor = processor(RecordingHost::default(), &clients);
        processor.process(&event("remove", &sdb)).await.unwrap();
        assert_eq!(
            clients.drives.get("d1").await.unwrap().spec.status,
            DriveStatus::Unavailable
        );

        let processor = self::processor(RecordingHost::with_devices(vec![sdb.clone()]), &clients);
        processor.process(&event("add", &sdb)).await.unwrap();
        assert_eq!(
            clients.drives.get("d1").await.unwrap().spec.status,
            DriveStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_ambiguous_match_writes_nothing() {
        let clients = Clients::in_memory();
        for name in ["a", "b"] {
            let mut drive = Drive::new(name, Default::default());
            drive.spec.node_name = "node-1".into();
            drive.labels_mut().insert(NODE_LABEL_KEY.into(), "node-1".into());
            clients.drives.create(&drive).await.unwrap();
        }
        let before: Vec<_> = drives(&clients).await.iter().map(|d| d.resource_version()).collect();

        let mut bare = disk("sdb", 16, "");
        bare.udev_data.clear();
        let processor = processor(RecordingHost::with_devices(vec![bare.clone()]), &clients);
        assert_matches!(
            processor.process(&event("change", &bare)).await,
            Err(Error::AmbiguousMatch { count: 2, .. })
        );

        let after: Vec<_> = drives(&clients).await.iter().map(|d| d.resource_version()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_device_from_event_keeps_identity() {
        let sdb = disk("sdb", 16, "S1");
        let device = device_from_event(&event("remove", &sdb));
        assert_eq!(device.name, "sdb");
        assert_eq!(device.major_minor, "8:16");
        assert_eq!(device.serial(), "S1");
        assert!(!device.udev_data.contains_key("ACTION"));
    }
}
