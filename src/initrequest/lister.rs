//! InitRequest listing with node, requestor and name filters

use crate::consts::REQUESTOR_LABEL_KEY;
use crate::crd::InitRequest;
use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};
use crate::store::Selector;
use kube::ResourceExt;
use std::collections::BTreeSet;

/// Builder-style InitRequest query
#[derive(Debug, Clone, Default)]
pub struct InitRequestLister {
    nodes: BTreeSet<String>,
    requestors: BTreeSet<String>,
    names: BTreeSet<String>,
}

impl InitRequestLister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests addressed to any of `nodes`
    pub fn nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn requestors<I, S>(mut self, requestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requestors.extend(requestors.into_iter().map(Into::into));
        self
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    fn accepts(&self, request: &InitRequest) -> bool {
        (self.names.is_empty() || self.names.contains(&request.name_any()))
            && (self.nodes.is_empty()
                || request.spec.request.keys().any(|node| self.nodes.contains(node)))
    }

    /// Matching requests, sorted by name.
    ///
    /// With only names given each one is fetched directly and a missing
    /// name is an error.
    pub async fn get<S>(&self, store: &S) -> Result<Vec<InitRequest>>
    where
        S: ResourceStore<InitRequest> + ?Sized,
    {
        if self.nodes.is_empty() && self.requestors.is_empty() && !self.names.is_empty() {
            let mut requests = Vec::with_capacity(self.names.len());
            for name in &self.names {
                requests.push(store.get(name).await?);
            }
            return Ok(requests);
        }

        let selector = Selector::new().with(REQUESTOR_LABEL_KEY, self.requestors.iter().cloned());
        let mut requests: Vec<InitRequest> = store
            .list(&selector)
            .await?
            .into_iter()
            .filter(|request| self.accepts(request))
            .collect();
        requests.sort_by_key(|request| request.name_any());

        if let Some(missing) = self
            .names
            .iter()
            .find(|name| !requests.iter().any(|r| &r.name_any() == *name))
        {
            return Err(Error::ResourceNotFound {
                kind: store.kind().to_string(),
                name: missing.clone(),
            });
        }
        Ok(requests)
    }
}
