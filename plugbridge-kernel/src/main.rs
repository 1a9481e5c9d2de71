/**
 * PLUGBRIDGE KERNEL - Point d'entrée du bridge MQTT ↔ HTTP
 *
 * RÔLE : Orchestration de tous les modules : config, session MQTT, worker
 * d'ingestion, dispatcher de commandes, API HTTP.
 *
 * ARCHITECTURE : broker → session MQTT → canal → worker → state store ← API REST
 *                API REST → dispatcher → session MQTT → broker
 * UTILITÉ : Découverte des prises Tasmota, suivi de la consommation,
 * commandes POWER temporisées pour un moteur de workflow (CPEE).
 */

mod config;
mod decoder;
mod dispatcher;
mod error;
mod health;
mod http;
mod ingest;
mod mqtt;
mod state;

use crate::config::{load_config, KernelConfig};
use crate::dispatcher::CommandDispatcher;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::state::StateStore;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg: KernelConfig = load_config().await;

    // état partagé, vide à chaque démarrage
    let store = StateStore::new();
    let health = HealthTracker::new();

    // connexion broker : échec = arrêt du process
    info!("connecting to MQTT broker {}:{}", cfg.mqtt.host, cfg.mqtt.port);
    let (broker, session) = match mqtt::connect(&cfg.mqtt).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    // MQTT → canal → worker unique qui remplit le store
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    ingest::spawn_ingest_worker(store.clone(), inbound_rx);
    mqtt::spawn_broker_session(session, inbound_tx, health.clone());

    let app_state = AppState {
        store,
        dispatcher: CommandDispatcher::new(broker),
        health,
    };

    // HTTP
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
