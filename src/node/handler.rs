//! StorageNode refresh handling

use super::sync::NodeSync;
use crate::consts::NODE_LABEL_KEY;
use crate::controller::{EventHandler, EventType};
use crate::crd::StorageNode;
use crate::error::Result;
use crate::store::Selector;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

/// Re-probes the node when an administrator sets `spec.refresh`
pub struct NodeEventHandler {
    sync: NodeSync,
}

impl NodeEventHandler {
    pub fn new(sync: NodeSync) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl EventHandler<StorageNode> for NodeEventHandler {
    fn name(&self) -> &str {
        "storagenode"
    }

    fn selector(&self) -> Selector {
        Selector::new().label(NODE_LABEL_KEY, self.sync.node_id())
    }

    async fn handle(&self, event: EventType, node: StorageNode) -> Result<()> {
        if event != EventType::Update || !node.spec.refresh || node.name_any() != self.sync.node_id() {
            return Ok(());
        }
        info!("Refresh requested for node {}", node.name_any());
        self.sync.sync().await.map(|_| ())
    }
}
