//! InitRequest handler
//!
//! Runs the format → mount → register → record pipeline for every device an
//! [`InitRequest`] addresses to this node and writes one [`InitResult`] back.
//!
//! ```text
//! mount-check ─► format ─► mount ─► register metadata ─► create Drive
//!                                        │
//!                                  failure: unmount
//! ```

use crate::consts::{API_VERSION, APP_NAME, FS_TYPE_XFS};
use crate::controller::{EventHandler, EventType};
use crate::crd::{Drive, DriveStatus, InitDevice, InitDeviceResult, InitRequest, InitResult};
use crate::device::Device;
use crate::domain::ports::{HostOpsRef, ResourceStore};
use crate::error::{ignore_not_found, Error, InitStage, Result};
use crate::metrics::Metrics;
use crate::store::{read_modify_write, Clients};
use async_trait::async_trait;
use futures::future::join_all;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Initializes devices on behalf of InitRequests
pub struct InitRequestHandler {
    node_id: String,
    topology: BTreeMap<String, String>,
    host: HostOpsRef,
    clients: Clients,
    /// One request at a time per node
    lock: Mutex<()>,
    metrics: Option<Metrics>,
}

impl InitRequestHandler {
    pub fn new(
        node_id: impl Into<String>,
        topology: BTreeMap<String, String>,
        host: HostOpsRef,
        clients: Clients,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            topology,
            host,
            clients,
            lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Format, mount and register one device, then record it as a Drive.
    ///
    /// A failure while registering metadata unmounts the fresh filesystem
    /// before returning; a failed Drive create leaves the mount in place.
    pub async fn init_device(&self, device: &Device, force: bool) -> Result<Drive> {
        let dev_path = device.dev_path();

        let mount_points = self
            .host
            .mount_points(&device.major_minor)
            .await
            .map_err(|e| e.at_stage(InitStage::MountCheck, &dev_path))?;
        if !mount_points.is_empty() {
            return Err(Error::DeviceMounted {
                device: dev_path.clone(),
                mount_points: mount_points.join(", "),
            }
            .at_stage(InitStage::MountCheck, &dev_path));
        }

        let fs_uuid = uuid::Uuid::new_v4().to_string();
        let fs = self
            .host
            .make_fs(&dev_path, &fs_uuid, force)
            .await
            .map_err(|e| e.at_stage(InitStage::Format, &dev_path))?;
        info!(device = %dev_path, fs_uuid = %fs_uuid, "Formatted device");

        self.host
            .mount(&dev_path, &fs_uuid)
            .await
            .map_err(|e| e.at_stage(InitStage::Mount, &dev_path))?;

        if let Err(err) = self.register_metadata(&fs_uuid).await {
            let err = err.at_stage(InitStage::RegisterMetadata, &dev_path);
            return Err(match self.host.unmount(&fs_uuid).await {
                Ok(()) => err,
                Err(cleanup) => Error::Compensation {
                    original: Box::new(err),
                    cleanup: Box::new(cleanup),
                },
            });
        }

        let mut drive = Drive::from_device(&fs_uuid, &self.node_id, device, self.topology.clone());
        drive.spec.fs_uuid = fs_uuid.clone();
        drive.spec.uevent_fs_uuid = fs_uuid.clone();
        drive.spec.filesystem = FS_TYPE_XFS.to_string();
        drive.spec.mountpoint = self.host.mount_dir(&fs_uuid);
        drive.spec.total_capacity = fs.total_capacity;
        drive.spec.free_capacity = fs.free_capacity;
        drive.spec.allocated_capacity = 0;
        drive.spec.status = DriveStatus::Ready;
        drive.labels_mut().extend(self.topology.clone());

        let drive = self
            .clients
            .drives
            .create(&drive)
            .await
            .map_err(|e| e.at_stage(InitStage::CreateDrive, &dev_path))?;
        info!(device = %dev_path, drive = %fs_uuid, "Drive initialized");
        Ok(drive)
    }

    async fn register_metadata(&self, fs_uuid: &str) -> Result<()> {
        self.host.symlink(fs_uuid).await?;
        self.host.make_meta_dir(fs_uuid).await?;
        let content = format!(
            "APP_NAME={}\nAPP_VERSION={}\nFSUUID={}\n",
            APP_NAME, API_VERSION, fs_uuid
        );
        self.host.write_meta_file(fs_uuid, &content).await
    }

    /// Initialize a batch; one result per requested device, in order.
    ///
    /// Only a failed re-probe fails the whole batch.
    pub async fn init_devices(&self, requested: &[InitDevice]) -> Result<Vec<InitDeviceResult>> {
        let major_minors: Vec<String> = requested.iter().map(|d| d.major_minor.clone()).collect();
        let probed: HashMap<String, Device> = self
            .host
            .probe_devices(&major_minors)
            .await?
            .into_iter()
            .map(|device| (device.major_minor.clone(), device))
            .collect();

        let mut results: Vec<InitDeviceResult> = requested
            .iter()
            .map(|d| InitDeviceResult {
                name: d.name.clone(),
                error: String::new(),
            })
            .collect();

        let mut pipelines = Vec::new();
        for (index, request) in requested.iter().enumerate() {
            match probed.get(&request.major_minor) {
                None => results[index].error = "device not found".to_string(),
                Some(device) if device.id(&self.node_id) != request.id => {
                    debug!("{} changed since the request was made", device.dev_path());
                    results[index].error = "device state changed".to_string();
                }
                Some(device) => pipelines.push(async move {
                    (index, self.init_device(device, request.force).await)
                }),
            }
        }

        for (index, outcome) in join_all(pipelines).await {
            if let Err(err) = outcome {
                warn!("Failed to initialize {}: {}", requested[index].name, err);
                results[index].error = err.to_string();
            }
        }

        if let Some(metrics) = &self.metrics {
            for result in &results {
                let label = if result.succeeded() { "succeeded" } else { "failed" };
                metrics.init_devices.with_label_values(&[label]).inc();
            }
        }
        Ok(results)
    }

    /// Process a request and record this node's result
    async fn answer(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        // Another worker may have answered while this one waited for the lock
        let Some(request) = ignore_not_found(self.clients.init_requests.get(name).await)? else {
            return Ok(());
        };
        if request.spec.response.contains_key(&self.node_id) {
            return Ok(());
        }
        let Some(devices) = request.spec.request.get(&self.node_id) else {
            return Ok(());
        };

        info!("Processing init request {} for {} devices", name, devices.len());
        let result = match self.init_devices(devices).await {
            Ok(devices) => InitResult {
                completed: true,
                devices,
                error: String::new(),
            },
            Err(err) => {
                warn!("Init request {} failed: {}", name, err);
                InitResult {
                    completed: true,
                    devices: Vec::new(),
                    error: err.to_string(),
                }
            }
        };

        let written = ignore_not_found(
            read_modify_write(
                self.clients.init_requests.as_ref(),
                name,
                &self.clients.retry,
                |request: &mut InitRequest| {
                    if request.spec.response.contains_key(&self.node_id) {
                        return Ok(false);
                    }
                    request
                        .spec
                        .response
                        .insert(self.node_id.clone(), result.clone());
                    Ok(true)
                },
            )
            .await,
        )?;
        if written.is_none() {
            debug!("Init request {} already answered or removed", name);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<InitRequest> for InitRequestHandler {
    fn name(&self) -> &str {
        "initrequest"
    }

    async fn handle(&self, event: EventType, request: InitRequest) -> Result<()> {
        if event == EventType::Delete
            || request.spec.response.contains_key(&self.node_id)
            || !request.spec.request.contains_key(&self.node_id)
        {
            return Ok(());
        }
        self.answer(&request.name_any()).await
    }
}
