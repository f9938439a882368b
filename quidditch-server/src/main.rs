use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex as SyncMutex;
use quidditch_cluster::state::{ClusterCommand, ControlGroup, LocalControlPlane, NodeRecord, NodeRole, NodeStatus};
use quidditch_cluster::{
    ClusterClient, ControlConfig, Coordinator, CoordinatorConfig, HealthTracker,
    LocalShardTransport, NodeServer, ShardTransport,
};
use quidditch::shards::ShardManager;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "quidditch-server")]
#[command(about = "Quidditch search cluster node")]
#[command(version)]
struct Args {
    /// Configuration file path (env: QUIDDITCH_CONFIG_PATH)
    #[arg(short, long, default_value = "quidditch.toml", env = "QUIDDITCH_CONFIG_PATH")]
    config: String,

    /// Node id override (env: QUIDDITCH_NODE_ID)
    #[arg(long, env = "QUIDDITCH_NODE_ID")]
    node_id: Option<String>,

    /// Data directory override (env: QUIDDITCH_DATA_DIR)
    #[arg(long, env = "QUIDDITCH_DATA_DIR")]
    data_dir: Option<String>,

    /// RPC bind address (env: QUIDDITCH_BIND)
    #[arg(long, default_value = "127.0.0.1:9400", env = "QUIDDITCH_BIND")]
    bind: String,

    /// Remote data-node addresses to fan out to, in addition to the local
    /// shards (env: QUIDDITCH_PEERS, comma-separated)
    #[arg(long, env = "QUIDDITCH_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Disable the Prometheus recorder
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = quidditch::Config::load_or_create(std::path::Path::new(&args.config))?;
    if let Some(node_id) = &args.node_id {
        config.node.node_id = node_id.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir = data_dir.into();
    }

    // RUST_LOG overrides the configured level.
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.log_level.clone());
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_level));
    if config.logging.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if !args.no_metrics {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus metrics recorder");
        tracing::info!("Prometheus metrics recorder installed");
    }

    let node_id = config.node.node_id.clone();
    tracing::info!(node = %node_id, bind = %args.bind, "starting quidditch node");

    // Shard manager: load whatever is already on disk.
    let manager = Arc::new(ShardManager::new(
        &node_id,
        &config.node.data_dir,
        config.engine.to_engine_config(),
        None,
    ));
    let loaded = manager.start()?;
    tracing::info!(shards = loaded, "loaded shards from disk");

    // Control plane: this build runs the control group in-process; the
    // tarpc surface serves the data plane to remote coordinators.
    let control_config = ControlConfig::default();
    let group = Arc::new(SyncMutex::new(ControlGroup::new(
        &[node_id.as_str()],
        &control_config,
    )));
    let control = Arc::new(LocalControlPlane::new(Arc::clone(&group)));

    let mut roles: BTreeSet<NodeRole> = BTreeSet::new();
    for role in &config.node.roles {
        match role.as_str() {
            "control" => roles.insert(NodeRole::Control),
            "coordinator" => roles.insert(NodeRole::Coordinator),
            "data" => roles.insert(NodeRole::Data),
            other => {
                tracing::warn!(role = other, "ignoring unknown role");
                false
            }
        };
    }
    group.lock().submit_current(ClusterCommand::NodeJoin {
        expected_version: 0,
        node: NodeRecord {
            node_id: node_id.clone(),
            address: args.bind.clone(),
            roles,
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
            storage_tier: config.node.storage_tier.clone(),
        },
    })?;

    // Transport: local shards in-process, remote peers over tarpc.
    let local = Arc::new(LocalShardTransport::new());
    local.attach(args.bind.clone(), Arc::clone(&manager));
    let transport: Arc<dyn ShardTransport> = if args.peers.is_empty() {
        local
    } else {
        Arc::new(ClusterClient::new(CoordinatorConfig::default().timeout_ms))
    };

    let coordinator = Arc::new(Coordinator::new(
        control,
        transport,
        CoordinatorConfig::default(),
    ));
    coordinator.refresh_routing().await?;

    // Keep the coordinator's routing cache warm; the client-facing surface
    // (REST layer, embedded callers) hangs off this handle.
    let routing_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(2000));
        loop {
            ticker.tick().await;
            if let Err(e) = routing_coordinator.refresh_routing().await {
                tracing::warn!(error = %e, "routing refresh failed");
            }
        }
    });

    // RPC server for remote coordinators.
    let coordinator_cfg = CoordinatorConfig::default();
    let server = NodeServer::new(
        Arc::clone(&manager),
        coordinator_cfg.search_permits,
        coordinator_cfg.index_permits,
    );
    let bind = args.bind.parse()?;
    let server_task = tokio::spawn(server.run(bind));

    // Refresh driver: commit buffered writes and run the merge policy.
    let refresh_manager = Arc::clone(&manager);
    let refresh_interval = std::time::Duration::from_millis(1000);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_manager.refresh_all() {
                tracing::warn!(error = %e, "refresh pass failed");
            }
            if let Err(e) = refresh_manager.merge_pass() {
                tracing::warn!(error = %e, "merge pass failed");
            }
        }
    });

    // Heartbeat driver: feed local liveness into the control plane.
    let tracker = Arc::new(HealthTracker::new(control_config.node_timeout_ms));
    let hb_group = Arc::clone(&group);
    let hb_manager = Arc::clone(&manager);
    let hb_interval = std::time::Duration::from_millis(control_config.heartbeat_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hb_interval);
        loop {
            ticker.tick().await;
            let payload = hb_manager.heartbeat();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let mut transitions = Vec::new();
            if let Some(t) = tracker.record_heartbeat(&payload.node_id, now_ms) {
                transitions.push(t);
            }
            transitions.extend(tracker.sweep(now_ms));
            let mut group = hb_group.lock();
            for transition in transitions {
                let result = group.submit_current(ClusterCommand::NodeHealthReport {
                    expected_version: 0,
                    node_id: transition.node_id.clone(),
                    status: transition.status,
                    observed_at_ms: transition.observed_at_ms,
                });
                if let Err(e) = result {
                    tracing::warn!(error = %e, "health report failed");
                }
            }
            if let Err(e) = group.rebalance() {
                tracing::warn!(error = %e, "rebalance failed");
            }
            if let Ok(state) = group.state() {
                hb_manager.observe_state_version(state.version);
            }
        }
    });

    tracing::info!("node started");
    server_task.await??;
    Ok(())
}
