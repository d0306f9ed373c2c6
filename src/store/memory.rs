//! In-memory resource store
//!
//! Versioned, finalizer-aware object store used in standalone mode and by
//! tests. Behaves like the API server for the operations the agent uses:
//! stale updates conflict, deleting an object that still carries finalizers
//! only marks it terminating, and watches replay a snapshot first.

use crate::domain::ports::{Object, ResourceStore, WatchEvent};
use crate::error::{Error, Result};
use crate::store::Selector;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Object store held in process memory
pub struct MemoryStore<K: Object> {
    kind: String,
    objects: RwLock<BTreeMap<String, K>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: Object> MemoryStore<K> {
    pub fn new(kind: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind: kind.into(),
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn not_found(&self, name: &str) -> Error {
        Error::ResourceNotFound {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<K: Object> ResourceStore<K> for MemoryStore<K> {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(name))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|object| selector.matches(object.labels()))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let mut stored = object.clone();
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: self.kind.clone(),
                name,
            });
        }

        let meta = stored.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        objects.insert(name.clone(), stored.clone());

        // Publish while locked; events must follow version order
        self.publish(WatchEvent::Applied(stored.clone()));
        debug!("Created {}/{}", self.kind, name);
        Ok(stored)
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let mut stored = object.clone();
        let mut objects = self.objects.write();
        let current = objects.get(&name).ok_or_else(|| self.not_found(&name))?;
        if current.resource_version() != object.resource_version() {
            return Err(Error::Conflict {
                kind: self.kind.clone(),
                name,
            });
        }

        stored.meta_mut().resource_version = Some(self.next_version());
        if stored.meta().deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            objects.remove(&name);
            self.publish(WatchEvent::Deleted(stored.clone()));
            debug!("Finalized {}/{}", self.kind, name);
        } else {
            objects.insert(name, stored.clone());
            self.publish(WatchEvent::Applied(stored.clone()));
        }
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let current = objects.get_mut(name).ok_or_else(|| self.not_found(name))?;
        if current.finalizers().is_empty() {
            if let Some(removed) = objects.remove(name) {
                self.publish(WatchEvent::Deleted(removed));
            }
        } else {
            if current.meta().deletion_timestamp.is_none() {
                let version = self.next_version();
                let meta = current.meta_mut();
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(version);
            }
            self.publish(WatchEvent::Applied(current.clone()));
        }
        Ok(())
    }

    async fn watch(
        &self,
        selector: &Selector,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let receiver = self.events.subscribe();
        let snapshot = self.list(selector).await?;
        let selector = selector.clone();

        let initial = stream::once(async move { Ok(WatchEvent::Restarted(snapshot)) });
        let updates = stream::unfold((receiver, selector), |(mut receiver, selector)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let matched = match &event {
                            WatchEvent::Applied(object) | WatchEvent::Deleted(object) => {
                                selector.matches(object.labels())
                            }
                            WatchEvent::Restarted(_) => true,
                        };
                        if matched {
                            return Some((Ok(event), (receiver, selector)));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let err = Error::Watch(format!("watch lagged by {} events", skipped));
                        return Some((Err(err), (receiver, selector)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(initial.chain(updates).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Drive, DriveSpec};
    use assert_matches::assert_matches;
    use kube::Resource;

    fn drive(name: &str, node: &str) -> Drive {
        let mut drive = Drive::new(
            name,
            DriveSpec {
                node_name: node.into(),
                ..Default::default()
            },
        );
        drive
            .labels_mut()
            .insert("storage.billyronks.io/node".into(), node.into());
        drive
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_publish_in_version_order() {
        let store = std::sync::Arc::new(MemoryStore::<Drive>::new("Drive"));
        let mut events = store.watch(&Selector::new()).await.unwrap();
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Restarted(_))));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut current = store.create(&drive(&format!("d{}", i), "n1")).await?;
                    for _ in 0..20 {
                        current = store.update(&current).await?;
                    }
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let mut last = 0u64;
        for _ in 0..8 * 21 {
            let version = match events.next().await {
                Some(Ok(WatchEvent::Applied(drive))) => drive.resource_version().unwrap(),
                other => panic!("unexpected event {:?}", other.map(|e| e.map(|_| ()))),
            };
            let version: u64 = version.parse().unwrap();
            assert!(version > last, "version {} published after {}", version, last);
            last = version;
        }
    }

    #[tokio::test]
    async fn test_create_get_and_duplicate() {
        let store = MemoryStore::<Drive>::new("Drive");
        let created = store.create(&drive("d1", "n1")).await.unwrap();
        assert!(created.resource_version().is_some());

        let fetched = store.get("d1").await.unwrap();
        assert_eq!(fetched.spec.node_name, "n1");
        assert_matches!(
            store.create(&drive("d1", "n1")).await,
            Err(Error::ResourceExists { .. })
        );
        assert_matches!(store.get("d2").await, Err(Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::<Drive>::new("Drive");
        store.create(&drive("d1", "n1")).await.unwrap();

        let mut first = store.get("d1").await.unwrap();
        let mut second = store.get("d1").await.unwrap();

        first.spec.total_capacity = 10;
        store.update(&first).await.unwrap();

        second.spec.total_capacity = 20;
        assert_matches!(store.update(&second).await, Err(Error::Conflict { .. }));
        assert_eq!(store.get("d1").await.unwrap().spec.total_capacity, 10);
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::<Drive>::new("Drive");
        store.create(&drive("d1", "n1")).await.unwrap();
        store.create(&drive("d2", "n2")).await.unwrap();

        let selector = Selector::new().label("storage.billyronks.io/node", "n2");
        let listed = store.list(&selector).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "d2");
        assert_eq!(store.list(&Selector::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::<Drive>::new("Drive");
        let mut with_finalizer = drive("d1", "n1");
        with_finalizer.finalizers_mut().push("example.com/hold".into());
        store.create(&with_finalizer).await.unwrap();

        store.delete("d1").await.unwrap();
        let mut terminating = store.get("d1").await.unwrap();
        assert!(terminating.meta().deletion_timestamp.is_some());

        terminating.finalizers_mut().clear();
        store.update(&terminating).await.unwrap();
        assert_matches!(store.get("d1").await, Err(Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_watch_replays_snapshot_then_changes() {
        let store = MemoryStore::<Drive>::new("Drive");
        store.create(&drive("d1", "n1")).await.unwrap();

        let selector = Selector::new().label("storage.billyronks.io/node", "n1");
        let mut events = store.watch(&selector).await.unwrap();

        assert_matches!(events.next().await, Some(Ok(WatchEvent::Restarted(list))) if list.len() == 1);

        store.create(&drive("other", "n2")).await.unwrap();
        store.create(&drive("d2", "n1")).await.unwrap();
        assert_matches!(
            events.next().await,
            Some(Ok(WatchEvent::Applied(d))) if d.name_any() == "d2"
        );

        store.delete("d1").await.unwrap();
        assert_matches!(
            events.next().await,
            Some(Ok(WatchEvent::Deleted(d))) if d.name_any() == "d1"
        );
    }
}
