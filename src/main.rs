//! Ceph Orchestrator
//!
//! Process entry point. Joins the leader election for the configured
//! cluster, and while leading drives orchestration cycles: reload the node
//! inventory, fan configuration triggers out to per-node OSD agents, and
//! wait for completions. Health, metrics, and the admission webhook are
//! served regardless of leadership.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ceph_orchestrator::inventory::node::load_healthy_nodes;
use ceph_orchestrator::orchestration::events::OrchestrationEvent;
use ceph_orchestrator::orchestration::member::Leader;
use ceph_orchestrator::orchestration::refresher::{InventoryLoader, LeadershipProbe};
use ceph_orchestrator::orchestration::store::ConfigMapKvStore;
use ceph_orchestrator::orchestration::trigger::{
    trigger_agents_and_wait, DEFAULT_COMPLETION_WAIT,
};
use ceph_orchestrator::orchestration::{ClusterMember, EventBus, KvStore, MemberConfig, RefreshCoalescer};
use ceph_orchestrator::osd::agent::OSD_AGENT_NAME;
use ceph_orchestrator::{Error, Result};

use async_trait::async_trait;
use std::collections::BTreeMap;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ceph Orchestrator - cluster reconciliation and OSD lifecycle
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster name (also the lease this process competes for)
    #[arg(long, env = "CLUSTER_NAME", default_value = "ceph")]
    cluster: String,

    /// Namespace holding the orchestration state ConfigMap
    #[arg(long, env = "POD_NAMESPACE", default_value = "rook-ceph")]
    namespace: String,

    /// Stable machine identity for leader election
    #[arg(long, env = "NODE_NAME")]
    machine_id: String,

    /// Name of the state-store ConfigMap
    #[arg(long, env = "STATE_CONFIGMAP", default_value = "orchestration-state")]
    state_configmap: String,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: String,

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
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Leadership flag shared between the member callbacks and the coalescer.
struct LeaderFlag(Arc<AtomicBool>);

#[async_trait]
impl LeadershipProbe for LeaderFlag {
    async fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inventory loader reading healthy nodes from the state store.
struct StoreInventory {
    store: Arc<dyn KvStore>,
    cluster: String,
}

#[async_trait]
impl InventoryLoader for StoreInventory {
    async fn load_nodes(
        &self,
    ) -> Result<BTreeMap<String, ceph_orchestrator::inventory::NodeConfig>> {
        load_healthy_nodes(self.store.as_ref(), &self.cluster).await
    }
}

/// Leader-side orchestrator: reacts to leadership transitions and node
/// discovery by scheduling refresh cycles.
struct Orchestrator {
    cluster: String,
    leading: Arc<AtomicBool>,
    coalescer: OnceLock<Arc<RefreshCoalescer>>,
}

impl Orchestrator {
    fn coalescer(&self) -> &Arc<RefreshCoalescer> {
        // Set exactly once during wiring, before the member starts.
        self.coalescer
            .get()
            .unwrap_or_else(|| unreachable!("coalescer wired before election starts"))
    }
}

#[async_trait]
impl Leader for Orchestrator {
    fn lease_name(&self) -> String {
        self.cluster.clone()
    }

    async fn on_leadership_acquired(&self) -> Result<()> {
        info!("acquired leadership of cluster {}", self.cluster);
        self.leading.store(true, Ordering::SeqCst);
        self.coalescer().trigger_refresh().await;
        Ok(())
    }

    async fn on_leadership_lost(&self) -> Result<()> {
        warn!("lost leadership of cluster {}", self.cluster);
        self.leading.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_node_discovered(&self, node_id: &str) -> Result<()> {
        info!("node {} joined cluster {}", node_id, self.cluster);
        self.coalescer().trigger_node_added(node_id).await;
        Ok(())
    }
}

/// Consume orchestration events and drive the per-node OSD agent fan-out.
async fn run_event_loop(
    store: Arc<dyn KvStore>,
    cluster: String,
    mut rx: tokio::sync::mpsc::Receiver<OrchestrationEvent>,
) {
    while let Some(event) = rx.recv().await {
        let node_ids: Vec<String> = match &event {
            OrchestrationEvent::Refresh { nodes } => nodes.keys().cloned().collect(),
            OrchestrationEvent::AddNode { node_id }
            | OrchestrationEvent::UnhealthyNode { node_id } => vec![node_id.clone()],
            OrchestrationEvent::RemoveNode { .. } | OrchestrationEvent::StaleNode { .. } => {
                continue;
            }
        };
        if node_ids.is_empty() {
            continue;
        }

        metrics::cycles().inc();
        info!(
            "orchestration cycle ({}) across {} node(s)",
            event.name(),
            node_ids.len()
        );

        let required = node_ids.len();
        match trigger_agents_and_wait(
            store.clone(),
            &cluster,
            &node_ids,
            OSD_AGENT_NAME,
            required,
            DEFAULT_COMPLETION_WAIT,
        )
        .await
        {
            Ok(result) if result.met_threshold() => {
                metrics::cycle_successes().inc();
                info!("cycle complete: {} node(s) succeeded", result.succeeded);
            }
            Ok(result) => {
                metrics::cycle_failures().inc();
                warn!(
                    "cycle incomplete: {} of {} node(s) succeeded",
                    result.succeeded, required
                );
            }
            Err(e) => {
                metrics::cycle_failures().inc();
                error!("cycle aborted: {}", e);
            }
        }
    }
    info!("event channel closed, orchestration loop exiting");
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Ceph Orchestrator");
    info!("  Version: {}", ceph_orchestrator::VERSION);
    info!("  Cluster: {}", args.cluster);
    info!("  Machine: {}", args.machine_id);
    info!("  Namespace: {}", args.namespace);

    let kube_client = kube::Client::try_default().await?;
    let store: Arc<dyn KvStore> = Arc::new(ConfigMapKvStore::new(
        kube_client.clone(),
        &args.namespace,
        &args.state_configmap,
    ));

    // Leader-side wiring: flag -> probe, store -> inventory, bus -> agents.
    let leading = Arc::new(AtomicBool::new(false));
    let bus = EventBus::new();
    let orchestrator = Arc::new(Orchestrator {
        cluster: args.cluster.clone(),
        leading: leading.clone(),
        coalescer: OnceLock::new(),
    });
    let coalescer = RefreshCoalescer::new(
        Arc::new(LeaderFlag(leading.clone())),
        Arc::new(StoreInventory {
            store: store.clone(),
            cluster: args.cluster.clone(),
        }),
        bus.clone(),
    );
    let _ = orchestrator.coalescer.set(coalescer);

    tokio::spawn(run_event_loop(
        store.clone(),
        args.cluster.clone(),
        bus.register(OSD_AGENT_NAME),
    ));

    // Ancillary servers.
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });
    let webhook_addr = args.webhook_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_webhook_server(&webhook_addr).await {
            error!("Webhook server error: {}", e);
        }
    });

    // Election loop: one pass per interval until shutdown.
    let member = ClusterMember::new(
        &args.machine_id,
        store.clone(),
        orchestrator.clone(),
        MemberConfig::default(),
    );
    member.initialize().await?;

    let mut ticker = tokio::time::interval(MemberConfig::default().election_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = member.elect_leader().await {
                    warn!("election pass failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    member.shutdown().await?;
    info!("Orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

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
}

// =============================================================================
// Metrics
// =============================================================================

mod metrics {
    use prometheus::IntCounter;
    use std::sync::OnceLock;

    fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
        cell.get_or_init(|| {
            let c = IntCounter::new(name, help).unwrap();
            let _ = prometheus::register(Box::new(c.clone()));
            c
        })
    }

    pub fn cycles() -> &'static IntCounter {
        static CELL: OnceLock<IntCounter> = OnceLock::new();
        counter(
            &CELL,
            "orchestration_cycles_total",
            "Orchestration cycles started",
        )
    }

    pub fn cycle_successes() -> &'static IntCounter {
        static CELL: OnceLock<IntCounter> = OnceLock::new();
        counter(
            &CELL,
            "orchestration_cycle_successes_total",
            "Orchestration cycles where every node succeeded",
        )
    }

    pub fn cycle_failures() -> &'static IntCounter {
        static CELL: OnceLock<IntCounter> = OnceLock::new();
        counter(
            &CELL,
            "orchestration_cycle_failures_total",
            "Orchestration cycles that missed the completion threshold",
        )
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Webhook Server
// =============================================================================

async fn run_webhook_server(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid webhook address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admission webhook listening on {}", addr);
    axum::serve(listener, ceph_orchestrator::webhook::router())
        .await
        .map_err(|e| Error::Internal(format!("Webhook server error: {}", e)))?;
    Ok(())
}
