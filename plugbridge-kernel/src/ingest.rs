use crate::decoder::decode;
use crate::error::Result;
use crate::mqtt::InboundMessage;
use crate::state::StateStore;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

/// Applique un message entrant : l'appareil est toujours enregistré,
/// la lecture seulement pour la classification SENSOR.
pub fn apply(store: &StateStore, msg: &InboundMessage) -> Result<()> {
    let decoded = decode(&msg.topic, &msg.payload)?;
    debug!(topic = ?decoded.segments, payload = %decoded.payload, "message received");

    store.observe_device(&decoded.device_id);

    if decoded.is_sensor() {
        let current = store.observe_reading(&decoded.device_id, &decoded.payload)?;
        debug!(device = %decoded.device_id, current = %current, "energy reading stored");
    }
    Ok(())
}

/// Seul consommateur du canal : toutes les mutations MQTT passent par ici
pub fn spawn_ingest_worker(
    store: StateStore,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if let Err(e) = apply(&store, &msg) {
                warn!("dropping message: {e}");
            }
            debug!(devices = ?store.devices(), counts = ?store.counts(), "state after message");
        }
        debug!("inbound channel closed, ingest worker stopping");
    })
}
