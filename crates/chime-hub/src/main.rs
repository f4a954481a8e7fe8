//! The Chime hub daemon.
//!
//! Boots the message bus, supervises the Core processes in the data
//! directory, and runs the request pipeline until interrupted.

use base64::Engine;
use chime_core::bus::{BusHandle, LocalBus};
use chime_core::config::{self, HubConfig};
use chime_core::error::{HubError, HubResult};
use chime_core::intent::IntentRegistry;
use chime_core::orchestrator::{CueSounds, Orchestrator};
use chime_core::supervisor::Supervisor;
use chime_core::topics::TopicSpace;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "hub failed to start");
        std::process::exit(1);
    }
}

async fn run() -> HubResult<()> {
    let data_dir = config::data_dir();
    let cores_dir = data_dir.join("cores");
    let resources_dir = data_dir.join("resources");
    fs::create_dir_all(&cores_dir)?;
    fs::create_dir_all(&resources_dir)?;

    let config = HubConfig::load_or_default(&data_dir.join("config.json"))?;
    tracing::info!(
        instance = %config.instance_name,
        device_id = %config.device_id,
        data_dir = %data_dir.display(),
        "starting hub"
    );

    // The user needs to hear pipeline transitions; a silent hub is a broken
    // one, so missing cue sounds are fatal at boot.
    let cues = load_cues(&resources_dir)?;

    let bus = Arc::new(LocalBus::new());
    let handle = BusHandle::new(
        bus.clone(),
        TopicSpace::new(&config.device_id),
        &config.instance_name,
    );

    if config.orchestrator.show_remote_logs {
        spawn_remote_log_mirror(&handle, &config.instance_name).await?;
    }

    let registry = Arc::new(IntentRegistry::new());
    let orchestrator = Orchestrator::new(
        handle.clone(),
        registry,
        cues,
        Duration::from_secs(config.orchestrator.stage_timeout_secs),
    );

    let mut supervisor = Supervisor::new(handle.clone(), config);
    supervisor.start(&cores_dir).await?;

    let mut pipeline = tokio::spawn(orchestrator.run());

    tokio::select! {
        result = &mut pipeline => match result {
            Ok(Ok(())) => tracing::warn!("pipeline stopped on its own"),
            Ok(Err(e)) => tracing::error!(error = %e, "pipeline failed"),
            Err(e) => tracing::error!(error = %e, "pipeline task panicked"),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    pipeline.abort();
    supervisor.shutdown().await;
    tracing::info!("hub stopped");
    Ok(())
}

/// Read the feedback sounds from the resources directory, base64-encoded
/// the way they travel on the bus.
fn load_cues(resources_dir: &Path) -> HubResult<CueSounds> {
    Ok(CueSounds {
        begin: load_sound(resources_dir, "begin_listening.wav")?,
        stop: load_sound(resources_dir, "stop_listening.wav")?,
        error: load_sound(resources_dir, "error.wav")?,
        instant: load_sound(resources_dir, "instant_intent.wav")?,
    })
}

fn load_sound(resources_dir: &Path, name: &str) -> HubResult<String> {
    let path = resources_dir.join(name);
    let bytes = fs::read(&path)
        .map_err(|e| HubError::Resource(format!("cue sound {}: {e}", path.display())))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Mirror log lines other Cores publish on the bus to local output, skipping
/// our own so they do not appear twice.
async fn spawn_remote_log_mirror(handle: &BusHandle, instance_name: &str) -> HubResult<()> {
    let mut logs = handle.subscribe(&handle.topics().logs()).await?;
    let own_prefix = format!("[{instance_name}]");
    tokio::spawn(async move {
        while let Some(message) = logs.recv().await {
            let line = String::from_utf8_lossy(&message.payload);
            if !line.starts_with(&own_prefix) {
                tracing::info!(target: "chime::remote", "{line}");
            }
        }
    });
    Ok(())
}
