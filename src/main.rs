#[cfg(feature = "metrics")]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use replicadb_k8s::controller::{self, EngineConfig, HttpMemberAgent, MemberAgent, NoopMemberAgent};
use replicadb_k8s::{crd::Cluster, Error};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Count the managed clusters
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Engine configuration file (YAML)
    #[arg(long, env = "REPLICADB_CONFIG")]
    config: Option<PathBuf>,

    /// Recreate claims whose online expansion failed
    #[arg(long, env = "RECOVER_VOLUME_EXPANSION_FAILURE")]
    recover_volume_expansion_failure: bool,

    /// Never clone data through volume snapshots
    #[arg(long, env = "DISABLE_VOLUME_SNAPSHOT")]
    disable_volume_snapshot: bool,

    /// Only watch clusters in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Operator namespace, home of the leader lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Plan object graphs and log them without applying
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Port of the `/metrics` endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to count clusters in; all namespaces when omitted
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("ReplicaDB Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let api: Api<Cluster> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let clusters = api.list(&Default::default()).await?;
    println!("Managed Clusters: {}", clusters.items.len());
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}

fn load_config(args: &RunArgs) -> Result<EngineConfig, Error> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if args.recover_volume_expansion_failure {
        config.recover_volume_expansion_failure = true;
    }
    if args.disable_volume_snapshot {
        config.volume_snapshot_enabled = false;
    }
    Ok(config)
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);
    let config = load_config(&args)?;

    info!(
        "Starting ReplicaDB Operator v{} (dry_run={}, recover_volume_expansion_failure={}, volume_snapshot_enabled={})",
        env!("CARGO_PKG_VERSION"),
        args.dry_run,
        config.recover_volume_expansion_failure,
        config.volume_snapshot_enabled
    );

    let client = kube::Client::try_default().await?;

    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    {
        let leases: Api<Lease> = Api::namespaced(client.clone(), &args.namespace);
        let lease_ns = args.namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(leases, lease_ns, holder_identity, is_leader_bg).await;
        });
    }

    #[cfg(feature = "metrics")]
    tokio::spawn(serve_metrics(args.metrics_port));
    #[cfg(not(feature = "metrics"))]
    tracing::debug!("Built without metrics, ignoring port {}", args.metrics_port);

    let member_agent: Arc<dyn MemberAgent> = if args.dry_run {
        Arc::new(NoopMemberAgent)
    } else {
        Arc::new(HttpMemberAgent::new(
            config.member_agent_port,
            MEMBER_AGENT_TIMEOUT,
        )?)
    };

    let state = Arc::new(controller::ControllerState {
        client,
        config,
        member_agent,
        dry_run: args.dry_run,
        is_leader,
    });

    controller::run_controller(state, args.watch_namespace).await
}

const MEMBER_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(feature = "metrics")]
async fn serve_metrics(port: u16) {
    use axum::{http::StatusCode, routing::get, Router};

    async fn metrics_handler() -> Result<String, StatusCode> {
        controller::metrics::encode_registry().map_err(|e| {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Metrics server could not bind {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics server listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        warn!("Metrics server stopped: {}", e);
    }
}

const LEASE_NAME: &str = "replicadb-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    loop {
        match try_acquire_or_renew(&leases, &namespace, &identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get(LEASE_NAME).await {
        Ok(existing) => existing,
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            return Ok(true);
        }
        Err(e) => return Err(e),
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());
    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(i64::from(duration))
        })
        .unwrap_or(true);
    if !expired {
        return Ok(false);
    }

    info!("Lease held by {:?} has expired, taking over", current_holder);
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
