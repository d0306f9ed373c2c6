//! Node inventory sync
//!
//! Probes the host's block devices and publishes them on the node's
//! [`StorageNode`] record, each with the reason it cannot be initialized.

use crate::consts::NODE_LABEL_KEY;
use crate::crd::{Drive, NodeDevice, StorageNode, StorageNodeSpec};
use crate::domain::ports::{HostOpsRef, ResourceStore};
use crate::error::{Error, Result};
use crate::store::{retry_on_conflict, Clients, Selector};
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

/// Publishes the device inventory of one node
#[derive(Clone)]
pub struct NodeSync {
    node_id: String,
    host: HostOpsRef,
    clients: Clients,
}

impl NodeSync {
    pub fn new(node_id: impl Into<String>, host: HostOpsRef, clients: Clients) -> Self {
        Self {
            node_id: node_id.into(),
            host,
            clients,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Probe the host and build inventory entries
    pub async fn inventory(&self) -> Result<Vec<NodeDevice>> {
        let devices = self.host.probe_devices(&[]).await?;

        // A listing failure surfaces as a denial reason on XFS devices
        let drives = self
            .clients
            .drives
            .list(&Selector::new().label(NODE_LABEL_KEY, &self.node_id))
            .await
            .map_err(|e| e.to_string());
        let lookup = |fs_uuid: &str| -> Result<()> {
            match &drives {
                Ok(drives) if drives.iter().any(|d: &Drive| d.spec.fs_uuid == fs_uuid) => Ok(()),
                Ok(_) => Err(Error::ResourceNotFound {
                    kind: "Drive".to_string(),
                    name: fs_uuid.to_string(),
                }),
                Err(message) => Err(Error::Internal(message.clone())),
            }
        };

        Ok(devices
            .iter()
            .map(|device| device.to_node_device(&self.node_id, lookup))
            .collect())
    }

    /// Create or refresh the StorageNode record, clearing its refresh flag
    pub async fn sync(&self) -> Result<StorageNode> {
        let devices = self.inventory().await?;
        debug!("Node {} has {} block devices", self.node_id, devices.len());

        let store = self.clients.nodes.as_ref();
        let devices = &devices;
        let node = retry_on_conflict(&self.clients.retry, || async move {
            let now = Some(Utc::now());
            match store.get(&self.node_id).await {
                Ok(mut node) => {
                    node.spec.devices = devices.clone();
                    node.spec.refresh = false;
                    node.spec.last_sync_time = now;
                    store.update(&node).await
                }
                Err(err) if err.is_not_found() => {
                    let mut node = StorageNode::new(
                        &self.node_id,
                        StorageNodeSpec {
                            node_name: self.node_id.clone(),
                            refresh: false,
                            devices: devices.clone(),
                            last_sync_time: now,
                        },
                    );
                    node.labels_mut()
                        .insert(NODE_LABEL_KEY.to_string(), self.node_id.clone());
                    store.create(&node).await
                }
                Err(err) => Err(err),
            }
        })
        .await?;

        info!(
            "Synced node {}: {} devices, {} eligible",
            self.node_id,
            node.spec.devices.len(),
            node.spec.devices.iter().filter(|d| d.is_eligible()).count()
        );
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DriveStatus;
    use crate::testing::{disk, RecordingHost};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn xfs_disk(name: &str, minor: u32, fs_uuid: &str) -> crate::device::Device {
        let mut device = disk(name, minor, name);
        device.udev_data.insert("ID_FS_TYPE".into(), "xfs".into());
        device.udev_data.insert("ID_FS_UUID".into(), fs_uuid.into());
        device
    }

    #[tokio::test]
    async fn test_sync_creates_then_updates_node() {
        let clients = Clients::in_memory();
        let host = Arc::new(RecordingHost::with_devices(vec![disk("sdb", 16, "S1")]));
        let sync = NodeSync::new("node-1", host.clone(), clients.clone());

        let created = sync.sync().await.unwrap();
        assert_eq!(created.spec.devices.len(), 1);
        assert!(created.spec.devices[0].is_eligible());
        assert!(created.spec.last_sync_time.is_some());

        let mut node = clients.nodes.get("node-1").await.unwrap();
        node.spec.refresh = true;
        clients.nodes.update(&node).await.unwrap();

        host.devices.lock().push(disk("sdc", 32, "S2"));
        let updated = sync.sync().await.unwrap();
        assert!(!updated.spec.refresh);
        assert_eq!(updated.spec.devices.len(), 2);
        assert_eq!(
            updated.labels().get(NODE_LABEL_KEY).map(String::as_str),
            Some("node-1")
        );
    }

    #[tokio::test]
    async fn test_managed_filesystem_is_denied() {
        let clients = Clients::in_memory();
        let mut drive = Drive::from_device(
            "fs-1",
            "node-1",
            &xfs_disk("sdb", 16, "fs-1"),
            BTreeMap::new(),
        );
        drive.spec.fs_uuid = "fs-1".into();
        drive.spec.status = DriveStatus::Ready;
        clients.drives.create(&drive).await.unwrap();

        let host = Arc::new(RecordingHost::with_devices(vec![
            xfs_disk("sdb", 16, "fs-1"),
            xfs_disk("sdc", 32, "foreign"),
        ]));
        let devices = NodeSync::new("node-1", host, clients).inventory().await.unwrap();

        assert!(devices[0].denied_reason.starts_with("Used by"));
        assert!(devices[1].is_eligible());
    }
}
