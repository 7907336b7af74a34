use ambient_agent::*;

use tracing::info;

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let _log_guard = telemetry::setup_logging();
    info!("starting {}", version::BuildInfo::new());
    let config = config::parse_config()?;
    // The Kubernetes informer owns the sending half of the pod event
    // channel; run standalone, pods come from LOCAL_POD_CONFIG and the
    // channel stays idle.
    let (_event_tx, event_rx) = tokio::sync::mpsc::channel(app::POD_EVENT_QUEUE_DEPTH);
    app::spawn(signal::Shutdown::new(), config, event_rx).await
}
