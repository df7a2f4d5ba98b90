/**
 * BINLINK KERNEL - Point d'entrée principal du serveur
 *
 * RÔLE : Orchestration de tous les modules : config, store, listener devices,
 * bridge, API admin. Bootstrap du système complet avec logging et arrêt propre.
 *
 * ARCHITECTURE : Listener TCP → Registry → Bridge → Store, télémétrie spontanée
 * poussée vers le bridge, API HTTP pour l'administration.
 */

mod bridge;
mod config;
mod device;
mod health;
mod http;
mod models;
mod protocol;
mod state;
mod store;

use crate::bridge::{spawn_telemetry_sink, BridgeSettings, DeviceBridge};
use crate::config::{load_config, KernelConfig};
use crate::device::{ConnectionRegistry, DeviceListener};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::store::MemoryStore;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binlink_kernel=info")))
        .init();

    let cfg: KernelConfig = load_config().await;

    // store embarqué, avec snapshot JSON si configuré
    let store = match &cfg.store.snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::with_snapshot(path)
                .await
                .with_context(|| format!("failed to load store snapshot {path}"))?,
        ),
        None => {
            warn!("no store.snapshot_path configured, bins live in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    spawn_store_flusher(store.clone(), Duration::from_secs(cfg.store.flush_interval_secs.max(1)));

    let registry = ConnectionRegistry::new();
    let health = HealthTracker::new();
    let settings = BridgeSettings {
        freshness_window: time::Duration::seconds(cfg.cache.freshness_window_secs as i64),
        simulated_ids: cfg.provisioning.simulated_range(),
    };
    let bridge = Arc::new(DeviceBridge::new(registry.clone(), store.clone(), health.clone(), settings));

    // télémétrie spontanée des devices → bridge
    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    spawn_telemetry_sink(bridge.clone(), telemetry_rx);

    // un échec de bind est fatal
    let listener = DeviceListener::bind(
        cfg.devices.addr(),
        registry.clone(),
        telemetry_tx,
        cfg.devices.request_timeout(),
        health.clone(),
        // les identités réelles ne croisent jamais celles des bins simulés
        cfg.provisioning.simulated_range(),
    )
    .await
    .with_context(|| format!("failed to bind device listener on {}", cfg.devices.addr()))?;
    tokio::spawn(listener.run());

    let app = http::build_router(AppState { bridge, registry: registry.clone(), health });
    let addr = cfg.http.addr();
    let http_listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http on {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    let closed = registry.close_all();
    info!(closed, "device connections closed");
    if let Err(e) = store.flush().await {
        error!(error = %e, "final store flush failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Écrit périodiquement le snapshot du store
fn spawn_store_flusher(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = store.flush().await {
                error!(error = %e, "failed to flush store snapshot");
            }
        }
    });
}
