//! Stack updater agent
//!
//! Runs inside the compose stack it maintains. Watches a release feed for
//! new stack versions, downloads manifests and images on request, recreates
//! drifted services and publishes its lifecycle through the update entity.
//!
//! ## Architecture
//!
//! - **Updater**: Orchestrates check/download/update/restart operations
//! - **Compose Synchronizer**: Merges manifests into the service registry
//! - **Digest Reconciler**: Probes the runtime for image/container digests
//! - **Entity**: Publishes status attributes and receives command tokens

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stack_updater::entity::LocalEntity;
use stack_updater::release::HttpReleaseFeed;
use stack_updater::runtime::DockerRuntime;
use stack_updater::state::StatusStore;
use stack_updater::{Config, Updater};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stack updater");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            exit(1);
        }
    };
    info!(
        system_dir = %config.system_dir.display(),
        storage_url = %config.storage_url,
        service = %config.service_name,
        "Configuration loaded"
    );

    let runtime = match DockerRuntime::connect() {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Docker connection failed");
            exit(1);
        }
    };

    let store = StatusStore::new(config.state_file_path());
    let release = Arc::new(HttpReleaseFeed::new(&config));
    let (entity, mut signals) = LocalEntity::new();
    let entity = Arc::new(entity);

    let check_interval = Duration::from_secs(config.check_interval_secs);
    let mut updater = Updater::new(
        config,
        runtime,
        release,
        store,
        Arc::clone(&entity) as Arc<dyn stack_updater::entity::UpdateEntity>,
    );

    // A broken startup leaves the agent supervisor-restartable rather
    // than half-alive.
    if let Err(e) = updater.init().await {
        error!(error = %e, "Updater initialization failed");
        exit(1);
    }

    // Skip the immediate tick; init already leaves the status current.
    let mut check_timer = interval_at(Instant::now() + check_interval, check_interval);
    check_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = check_timer.tick() => {
                updater.handle_command("check").await;
            }
            token = signals.commands.recv() => {
                match token {
                    Some(token) => updater.handle_command(&token).await,
                    None => {
                        warn!("Command channel closed");
                        break;
                    }
                }
            }
            signal = signals.online.recv() => {
                if signal.is_some() {
                    info!("Transport reconnected, reconciling status");
                    if let Err(e) = updater.recover_status().await {
                        warn!(error = %e, "Status recovery failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Stack updater stopped");
}
