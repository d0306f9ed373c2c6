//! Reconciliation controller
//!
//! Generic list/watch driver: one delivery task watches a resource kind and
//! turns changes into [`EventType`]s, a bounded pool of workers runs the
//! [`EventHandler`], and failed events are requeued according to
//! [`Error::action`].
//!
//! ```text
//! store.watch ──► delivery ──► queue ──► worker 1..N ──► handler.handle
//!                    ▲                       │
//!                 resync                  requeue
//! ```

use crate::domain::ports::{Object, ResourceStoreRef, WatchEvent};
use crate::error::{ErrorAction, Result};
use crate::metrics::Metrics;
use crate::store::Selector;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 1024;
const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Kind of change delivered to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    /// Periodic resync of an unchanged object
    Sync,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Add => write!(f, "add"),
            EventType::Update => write!(f, "update"),
            EventType::Sync => write!(f, "sync"),
            EventType::Delete => write!(f, "delete"),
        }
    }
}

/// Per-kind reconciliation logic
#[async_trait]
pub trait EventHandler<K: Object>: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Objects this handler cares about
    fn selector(&self) -> Selector {
        Selector::new()
    }

    async fn handle(&self, event: EventType, object: K) -> Result<()>;
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Period of full re-list; zero disables resync
    pub resync_period: Duration,
    /// Attempts per event, including the first
    pub max_attempts: u32,
    /// Base delay for backoff requeues and watch restarts
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(300),
            max_attempts: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

struct Work<K> {
    event: EventType,
    object: K,
    attempt: u32,
}

/// List/watch driver for one resource kind
pub struct Controller<K: Object, H: EventHandler<K>> {
    store: ResourceStoreRef<K>,
    handler: Arc<H>,
    config: ControllerConfig,
    metrics: Option<Metrics>,
    /// Last delivered version of each object, by name
    seen: DashMap<String, K>,
}

impl<K: Object, H: EventHandler<K>> Controller<K, H> {
    pub fn new(store: ResourceStoreRef<K>, handler: Arc<H>, config: ControllerConfig) -> Self {
        Self {
            store,
            handler,
            config,
            metrics: None,
            seen: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let name = self.handler.name().to_string();
        info!("Starting controller {} with {} workers", name, self.config.workers);

        let (tx, rx) = mpsc::channel::<Work<K>>(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers.max(1) {
            let controller = self.clone();
            let rx = rx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                controller.worker(rx, tx, cancel).await
            }));
        }

        self.deliver(&tx, &cancel).await;

        for worker in workers {
            let _ = worker.await;
        }
        info!("Controller {} stopped", name);
        Ok(())
    }

    /// Watch, translate and enqueue until cancelled
    async fn deliver(&self, tx: &mpsc::Sender<Work<K>>, cancel: &CancellationToken) {
        let selector = self.handler.selector();
        let mut resync = (!self.config.resync_period.is_zero())
            .then(|| tokio::time::interval(self.config.resync_period));
        if let Some(resync) = resync.as_mut() {
            // First tick fires immediately; the watch snapshot covers it
            resync.tick().await;
        }

        loop {
            let mut stream = match self.store.watch(&selector).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: watch failed: {}", self.handler.name(), e);
                    if sleep_or_cancel(self.config.retry_delay, cancel).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick(&mut resync) => {
                        self.resync(&selector, tx).await;
                        continue;
                    }
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        for work in self.translate(event) {
                            if tx.send(work).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{}: watch stream error: {}", self.handler.name(), e);
                        break;
                    }
                    None => {
                        debug!("{}: watch stream ended", self.handler.name());
                        break;
                    }
                }
            }

            if sleep_or_cancel(self.config.retry_delay, cancel).await {
                return;
            }
        }
    }

    /// Map a watch event onto handler events, dropping already-seen versions
    fn translate(&self, event: WatchEvent<K>) -> Vec<Work<K>> {
        let work = |event, object| Work {
            event,
            object,
            attempt: 1,
        };

        match event {
            WatchEvent::Applied(object) => self
                .observe(&object)
                .map(|event| work(event, object))
                .into_iter()
                .collect(),
            WatchEvent::Deleted(object) => {
                self.seen.remove(&object.name_any());
                vec![work(EventType::Delete, object)]
            }
            WatchEvent::Restarted(objects) => {
                let present: BTreeSet<String> = objects.iter().map(|o| o.name_any()).collect();
                let gone: Vec<String> = self
                    .seen
                    .iter()
                    .map(|entry| entry.key().clone())
                    .filter(|name| !present.contains(name))
                    .collect();

                let mut batch = Vec::new();
                for name in gone {
                    if let Some((_, object)) = self.seen.remove(&name) {
                        debug!("{}: {} vanished while not watching", self.handler.name(), name);
                        batch.push(work(EventType::Delete, object));
                    }
                }
                for object in objects {
                    if let Some(event) = self.observe(&object) {
                        batch.push(work(event, object));
                    }
                }
                batch
            }
        }
    }

    /// Record the object's version; None when it was already delivered
    fn observe(&self, object: &K) -> Option<EventType> {
        match self.seen.insert(object.name_any(), object.clone()) {
            None => Some(EventType::Add),
            Some(previous) if previous.resource_version() != object.resource_version() => {
                Some(EventType::Update)
            }
            Some(_) => None,
        }
    }

    async fn resync(&self, selector: &Selector, tx: &mpsc::Sender<Work<K>>) {
        let objects = match self.store.list(selector).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("{}: resync list failed: {}", self.handler.name(), e);
                return;
            }
        };
        debug!("{}: resyncing {} objects", self.handler.name(), objects.len());
        for object in objects {
            let work = Work {
                event: EventType::Sync,
                object,
                attempt: 1,
            };
            if tx.send(work).await.is_err() {
                return;
            }
        }
    }

    async fn worker(
        self: Arc<Self>,
        rx: Arc<Mutex<mpsc::Receiver<Work<K>>>>,
        tx: mpsc::Sender<Work<K>>,
        cancel: CancellationToken,
    ) {
        loop {
            let work = tokio::select! {
                _ = cancel.cancelled() => return,
                work = async { rx.lock().await.recv().await } => match work {
                    Some(work) => work,
                    None => return,
                },
            };
            self.process(work, &tx, &cancel).await;
        }
    }

    async fn process(&self, work: Work<K>, tx: &mpsc::Sender<Work<K>>, cancel: &CancellationToken) {
        let controller = self.handler.name().to_string();
        let name = work.object.name_any();
        if let Some(metrics) = &self.metrics {
            let event = work.event.to_string();
            metrics
                .controller_events
                .with_label_values(&[controller.as_str(), event.as_str()])
                .inc();
        }

        let err = match self.handler.handle(work.event, work.object.clone()).await {
            Ok(()) => return,
            Err(err) => err,
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .handler_failures
                .with_label_values(&[controller.as_str()])
                .inc();
        }

        let delay = match err.action() {
            ErrorAction::NoRequeue => {
                error!("{}: {} {} failed: {}", controller, work.event, name, err);
                return;
            }
            _ if work.attempt >= self.config.max_attempts => {
                error!(
                    "{}: {} {} failed after {} attempts: {}",
                    controller, work.event, name, work.attempt, err
                );
                return;
            }
            ErrorAction::RequeueAfter(delay) => delay,
            ErrorAction::RequeueWithBackoff => self.backoff(work.attempt),
        };

        warn!(
            "{}: {} {} failed (attempt {}), retrying in {:?}: {}",
            controller, work.event, name, work.attempt, delay, err
        );
        let retry = Work {
            attempt: work.attempt + 1,
            ..work
        };
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if !sleep_or_cancel(delay, &cancel).await {
                let _ = tx.send(retry).await;
            }
        });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.config
            .retry_delay
            .saturating_mul(factor)
            .min(MAX_REQUEUE_DELAY)
    }
}

/// Wait for the next resync tick, or forever when resync is disabled
async fn tick(resync: &mut Option<tokio::time::Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Sleep; true when cancelled first
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
