//! Kubernetes-backed resource store

use crate::domain::ports::{Object, ResourceStore, WatchEvent};
use crate::error::{Error, Result};
use crate::store::Selector;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::{Client, Resource};

/// Cluster-scoped objects accessed through the API server
pub struct KubeStore<K: Object> {
    api: Api<K>,
    kind: String,
}

impl<K: Object> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            kind: K::kind(&()).to_string(),
        }
    }

    /// Translate API status codes into store errors
    fn map_error(&self, err: kube::Error, name: &str) -> Error {
        match err {
            kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            kube::Error::Api(response)
                if response.code == 409 && response.reason == "AlreadyExists" =>
            {
                Error::ResourceExists {
                    kind: self.kind.clone(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(response) if response.code == 409 => Error::Conflict {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            other => Error::Kube(other),
        }
    }
}

#[async_trait]
impl<K: Object> ResourceStore<K> for KubeStore<K> {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.api
            .get(name)
            .await
            .map_err(|e| self.map_error(e, name))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| self.map_error(e, ""))?;
        Ok(list.items)
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| self.map_error(e, &name))
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| self.map_error(e, &name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| self.map_error(e, name))
    }

    async fn watch(
        &self,
        selector: &Selector,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let mut config = watcher::Config::default();
        if !selector.is_empty() {
            config = config.labels(&selector.to_string());
        }

        Ok(watcher(self.api.clone(), config)
            .map(|event| match event {
                Ok(watcher::Event::Applied(object)) => Ok(WatchEvent::Applied(object)),
                Ok(watcher::Event::Deleted(object)) => Ok(WatchEvent::Deleted(object)),
                Ok(watcher::Event::Restarted(objects)) => Ok(WatchEvent::Restarted(objects)),
                Err(e) => Err(Error::Watch(e.to_string())),
            })
            .boxed())
    }
}
