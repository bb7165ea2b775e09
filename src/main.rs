use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use supervisor::condition::{
    NETWORK_STATUS_KIND, NODENAME_ID, NODENAME_KIND, STATUS_ID, TIME_STATUS_KIND,
};
use supervisor::config::{MachineConfig, Opts};
use supervisor::image::DirectoryImageStore;
use supervisor::nodeip::HostInterfaces;
use supervisor::services::{Cri, Kubelet};
use supervisor::state::{ResourceKey, ResourceStore};
use supervisor::{webserver, Machine, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let opts = Opts::from_flags(env!("CARGO_PKG_VERSION"));
    let constants = opts.constants();
    let config = MachineConfig::from_path(&opts.config).await?;
    info!(config = %opts.config.display(), "Loaded machine configuration");

    let store = ResourceStore::new();
    publish_host_state(&store).await?;

    let images = DirectoryImageStore::new(
        &constants.image_dir,
        config.machine.images.pull_command.clone(),
    );
    let machine = Machine {
        constants,
        config,
        store,
        images: Arc::new(images),
        addresses: Arc::new(HostInterfaces),
    };

    let mut system = System::new(Arc::new(machine));
    system.register(Arc::new(Cri))?;
    system.register(Arc::new(Kubelet))?;
    let handle = system.start()?;

    let token = CancellationToken::new();
    let (_, server) = webserver::start(handle.clone(), opts.api_addr, token.clone())?;
    let server = tokio::spawn(server);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    token.cancel();
    handle.shutdown().await;
    if let Err(e) = server.await {
        warn!(error = %e, "API server task failed");
    }
    Ok(())
}

/// Publishes the node name, and marks time and network as ready. Nothing else
/// on this host produces these resources.
async fn publish_host_state(store: &ResourceStore) -> anyhow::Result<()> {
    let hostname = hostname::get()
        .context("failed to read hostname")?
        .to_string_lossy()
        .to_lowercase();
    info!(nodename = %hostname, "Publishing node name");
    store
        .put(
            ResourceKey::new(NODENAME_KIND, NODENAME_ID),
            json!({ "nodename": hostname }),
        )
        .await;
    store
        .put(
            ResourceKey::new(TIME_STATUS_KIND, STATUS_ID),
            json!({ "synced": true }),
        )
        .await;
    store
        .put(
            ResourceKey::new(NETWORK_STATUS_KIND, STATUS_ID),
            json!({
                "addressReady": true,
                "hostnameReady": true,
                "etcFilesReady": true,
                "connectivityReady": true,
            }),
        )
        .await;
    Ok(())
}
