use std::sync::{Arc, Mutex};

use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::Role;
use crate::pods::{NodeDescriptor, PodEvent};
use crate::redirect::exec::OsExec;
use crate::redirect::reconciler::Reconciler;
use crate::redirect::RedirectConfig;
use crate::{config, metrics, offmesh, pods, readiness, signal};

/// Depth of the pod event queue; a slow kernel backpressures the source.
pub const POD_EVENT_QUEUE_DEPTH: usize = 1024;

/// Run the agent until `shutdown` fires. `events` is the receiving half of
/// the pod source contract; the embedding informer owns the sender.
pub async fn spawn(
    shutdown: signal::Shutdown,
    config: config::Config,
    events: mpsc::Receiver<PodEvent>,
) -> anyhow::Result<()> {
    // Setup a drain channel. drain_tx is used to trigger a drain, which will complete
    // once all drain_rx handlers are dropped.
    let (drain_tx, drain_rx) = drain::channel();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let mut registry = Registry::default();
    let metrics = metrics::Metrics::new(&mut registry);

    let ready = readiness::Ready::new();
    let block_ready = ready.register_task("reconciler");
    readiness::Service::new(&config, ready.clone(), drain_rx.clone())
        .await?
        .spawn();
    metrics::server::Server::new(&config, drain_rx.clone(), Mutex::new(registry))
        .await?
        .spawn();

    let redirect_config = build_redirect_config(&config).await?;
    info!(
        role = ?redirect_config.role,
        host_ip = %redirect_config.host_ip,
        "resolved node redirection configuration",
    );

    let exec = Arc::new(OsExec::default());
    let mut reconciler = Reconciler::new(
        redirect_config,
        config.iptables_cmd.clone(),
        exec,
        metrics.redirect.clone(),
    );
    // A node that cannot program the kernel must not report ready.
    reconciler.verify_capabilities()?;
    reconciler.install()?;
    if let Some(source) = &config.local_pod_config {
        let local = pods::read_local_pods(source).await?;
        info!("reconciling {} pods from local config", local.len());
        reconciler.reconcile_existing(&local);
    }
    drop(block_ready);

    tasks.push(tokio::spawn(reconciler.run(events, drain_rx)));

    tokio::spawn(async move {
        futures::future::join_all(tasks).await;
    });

    // Wait for a signal to shutdown
    shutdown.wait().await;

    // Start a drain; this will wait for all drain_rx handles to be dropped
    // before completing, allowing the reconciler to tear down kernel state.
    match time::timeout(config.termination_grace_period, drain_tx.drain()).await {
        Ok(()) => info!("Shutdown completed gracefully"),
        Err(_) => warn!(
            "Graceful shutdown did not complete in {:?}, terminating now",
            config.termination_grace_period
        ),
    }
    Ok(())
}

/// Resolve everything the redirection engine needs from config, host-IP
/// discovery and, in split mode, the node-pair table.
pub async fn build_redirect_config(config: &config::Config) -> anyhow::Result<RedirectConfig> {
    let host_ip = match config.host_ip {
        Some(ip) => ip,
        None => pods::discover_host_ip(&NodeDescriptor {
            name: config.node_name.clone(),
            pod_cidr: config.pod_cidr.clone(),
            internal_ip: config.internal_ip,
        })?,
    };
    let proxy_iface = match config.proxy_iface() {
        Ok(iface) => iface,
        // cpu mode can fall back to the interface holding the host IP
        Err(_) if config.role == Role::Cpu => pods::host_net_device(host_ip)?,
        Err(e) => return Err(e.into()),
    };
    let peer_ip = match config.role {
        Role::Collapsed => None,
        role => {
            let source = config
                .offmesh_config
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("split mode requires an offmesh cluster config"))?;
            let cluster = offmesh::OffmeshCluster::from_source(source).await?;
            let pair = cluster.pair_of(&config.node_name, role).ok_or_else(|| {
                anyhow::anyhow!("node {} has no pair in the offmesh cluster", config.node_name)
            })?;
            Some(pair.ip)
        }
    };
    Ok(RedirectConfig {
        role: config.role,
        node_name: config.node_name.clone(),
        host_ip,
        ztunnel_ip: config.require_ztunnel_ip()?,
        proxy_iface,
        capture_dns: config.capture_dns,
        peer_ip,
    })
}
