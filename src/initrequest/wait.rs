//! Waiting for an InitRequest to finish

use crate::crd::InitRequest;
use crate::domain::ports::{ResourceStore, WatchEvent};
use crate::error::{Error, Result};
use crate::store::Selector;
use futures::StreamExt;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause before watching again after the stream fails or ends
const REWATCH_DELAY: Duration = Duration::from_millis(500);

/// Watch `name` until every addressed node has answered.
///
/// Watch errors and closed streams are retried until `timeout`. Fails with
/// `Error::Timeout` when `timeout` elapses first and with
/// `Error::ResourceNotFound` if the request is deleted meanwhile.
pub async fn wait_for_completion<S>(store: &S, name: &str, timeout: Duration) -> Result<InitRequest>
where
    S: ResourceStore<InitRequest> + ?Sized,
{
    tokio::time::timeout(timeout, watch_until_complete(store, name))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

async fn watch_until_complete<S>(store: &S, name: &str) -> Result<InitRequest>
where
    S: ResourceStore<InitRequest> + ?Sized,
{
    loop {
        match watch_once(store, name).await {
            Ok(Some(request)) => return Ok(request),
            Ok(None) => debug!("Watch of init request {} ended, watching again", name),
            Err(err) if err.is_not_found() => return Err(err),
            Err(err) => warn!("Watch of init request {} failed: {}", name, err),
        }
        tokio::time::sleep(REWATCH_DELAY).await;
    }
}

/// One watch session; `None` when the stream ends unanswered
async fn watch_once<S>(store: &S, name: &str) -> Result<Option<InitRequest>>
where
    S: ResourceStore<InitRequest> + ?Sized,
{
    let not_found = || Error::ResourceNotFound {
        kind: store.kind().to_string(),
        name: name.to_string(),
    };

    let mut stream = store.watch(&Selector::new()).await?;
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!("Watch of init request {} reported: {}", name, err);
                continue;
            }
        };
        let request = match event {
            WatchEvent::Applied(request) if request.name_any() == name => request,
            WatchEvent::Deleted(request) if request.name_any() == name => return Err(not_found()),
            WatchEvent::Restarted(requests) => match requests.into_iter().find(|r| r.name_any() == name) {
                Some(request) => request,
                None => return Err(not_found()),
            },
            _ => continue,
        };

        if request.spec.is_complete() {
            return Ok(Some(request));
        }
        debug!(
            "Init request {}: {}/{} nodes answered",
            name,
            request.spec.response.values().filter(|r| r.completed).count(),
            request.spec.request.len()
        );
    }
    Ok(None)
}
