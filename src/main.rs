//! Smart Drive Agent
//!
//! Runs on every storage node: watches block device hotplug events, keeps the
//! node's Drive records current, answers InitRequests and publishes the
//! node's device inventory.
//!
//! ```text
//! netlink ──► Listener ──► UeventProcessor ──► Drive records
//! InitRequest watch ──► Controller ──► InitRequestHandler ──► mkfs / mount / Drive
//! StorageNode watch ──► Controller ──► NodeEventHandler ──► StorageNode inventory
//! ```

use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_drive_agent::consts::NODE_LABEL_KEY;
use smart_drive_agent::{
    AgentConfig, CapacityLedger, Clients, Controller, DriveEventHandler, Error, HostOpsRef,
    InitRequestHandler, LinuxHost, Listener, Metrics, NetlinkSocket, NodeEventHandler, NodeSync,
    Prober, ResourceStore, Result, Selector, UeventProcessor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Smart Drive Agent - node-local drive discovery and initialization
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Topology identity label
    #[arg(long, env = "IDENTITY", default_value = "smart-drive-agent")]
    identity: String,

    #[arg(long, env = "RACK", default_value = "default")]
    rack: String,

    #[arg(long, env = "ZONE", default_value = "default")]
    zone: String,

    #[arg(long, env = "REGION", default_value = "default")]
    region: String,

    #[arg(long, env = "SYSFS_DIR", default_value = "/sys")]
    sysfs_dir: PathBuf,

    #[arg(long, env = "PROCFS_DIR", default_value = "/proc")]
    procfs_dir: PathBuf,

    #[arg(long, env = "UDEV_DATA_DIR", default_value = "/run/udev/data")]
    udev_data_dir: PathBuf,

    #[arg(long, env = "DEV_DIR", default_value = "/dev")]
    dev_dir: PathBuf,

    /// Directory drives are mounted under
    #[arg(long, env = "MOUNT_ROOT", default_value = "/var/lib/smart-drive-agent/mnt")]
    mount_root: PathBuf,

    /// Format drives with XFS reflink support
    #[arg(long, env = "XFS_REFLINK", default_value_t = true, action = ArgAction::Set)]
    reflink: bool,

    /// Worker tasks per controller
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Controller resync period in seconds; 0 disables resync
    #[arg(long, env = "RESYNC_PERIOD", default_value = "300")]
    resync_period_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory stores, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Do not listen for hotplug events
    #[arg(long, env = "DISABLE_UEVENT")]
    disable_uevent: bool,
}

impl Args {
    fn config(&self) -> AgentConfig {
        AgentConfig {
            node_id: self.node_id.clone(),
            identity: self.identity.clone(),
            rack: self.rack.clone(),
            zone: self.zone.clone(),
            region: self.region.clone(),
            sysfs_dir: self.sysfs_dir.clone(),
            procfs_dir: self.procfs_dir.clone(),
            udev_data_dir: self.udev_data_dir.clone(),
            dev_dir: self.dev_dir.clone(),
            mount_root: self.mount_root.clone(),
            reflink: self.reflink,
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_period_secs),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = args.config();
    config.validate()?;

    info!("Starting Smart Drive Agent");
    info!("  Version: {}", smart_drive_agent::VERSION);
    info!("  Node: {}", config.node_id);
    info!("  Mount root: {}", config.mount_root.display());
    info!("  XFS reflink: {}", config.reflink);
    info!("  Standalone mode: {}", args.standalone);

    let clients = if args.standalone {
        Clients::in_memory()
    } else {
        Clients::kube(kube::Client::try_default().await?)
    };
    let metrics = Metrics::new()?;
    let host: HostOpsRef = Arc::new(LinuxHost::new(
        Prober::new(config.host_paths()),
        config.layout(),
        config.reflink,
    ));
    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Publish the inventory and settle capacity before taking requests
    let node_sync = NodeSync::new(&config.node_id, host.clone(), clients.clone());
    if let Err(e) = node_sync.sync().await {
        warn!("Initial node sync failed: {}", e);
    }
    repair_drives(&config.node_id, &clients).await;

    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

    if args.disable_uevent {
        info!("Hotplug event handling disabled");
    } else {
        let listener = Listener::new(NetlinkSocket::open()?);
        let handler = Arc::new(DriveEventHandler::new(
            &config.node_id,
            config.topology(),
            clients.clone(),
        ));
        let processor = UeventProcessor::new(&config.node_id, host.clone(), clients.clone(), handler)
            .with_metrics(metrics.clone());
        let (tx, rx) = mpsc::channel(1024);

        let listen_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { listener.run(listen_cancel, tx).await }));
        let process_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            processor.run(process_cancel, rx).await;
            Ok(())
        }));
    }

    let init_handler = InitRequestHandler::new(
        &config.node_id,
        config.topology(),
        host.clone(),
        clients.clone(),
    )
    .with_metrics(metrics.clone());
    let init_controller = Arc::new(
        Controller::new(
            clients.init_requests.clone(),
            Arc::new(init_handler),
            config.controller(),
        )
        .with_metrics(metrics.clone()),
    );
    tasks.push(tokio::spawn(init_controller.run(cancel.clone())));

    let node_controller = Arc::new(
        Controller::new(
            clients.nodes.clone(),
            Arc::new(NodeEventHandler::new(node_sync)),
            config.controller(),
        )
        .with_metrics(metrics.clone()),
    );
    tasks.push(tokio::spawn(node_controller.run(cancel.clone())));

    ready.store(true, Ordering::SeqCst);
    info!("Agent ready");

    shutdown_signal().await;
    info!("Shutting down");
    cancel.cancel();

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed: {}", e),
            Err(e) => error!("Task panicked: {}", e),
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Drop stale volume tokens left while the agent was down
async fn repair_drives(node_id: &str, clients: &Clients) {
    let drives = match clients
        .drives
        .list(&Selector::new().label(NODE_LABEL_KEY, node_id))
        .await
    {
        Ok(drives) => drives,
        Err(e) => {
            warn!("Unable to list drives for capacity repair: {}", e);
            return;
        }
    };

    let ledger = CapacityLedger::new(clients.clone());
    for drive in drives {
        let name = kube::ResourceExt::name_any(&drive);
        if let Err(e) = ledger.repair(&name).await {
            warn!("Capacity repair of drive {} failed: {}", name, e);
        }
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Unable to install SIGTERM handler: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Unable to listen for ctrl-c: {}", e);
            }
        }
        _ = terminate => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("invalid log directive {}: {}", directive, e)))?,
        );
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Metrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                warn!("{}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
