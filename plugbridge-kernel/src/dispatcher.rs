/**
 * DISPATCHER DE COMMANDES - Séquences POWER temporisées
 *
 * RÔLE :
 * - toggle_for_duration : TOGGLE, attente, TOGGLE
 * - toggle_wait_notify  : même séquence puis PUT sans corps sur l'URL de callback
 *   (moteur de workflow CPEE qui attend la fin de la tâche)
 *
 * MODÈLE :
 * Une tâche tokio détachée par séquence, sans suivi ni annulation.
 * Deux séquences sur le même appareil ne sont pas sérialisées.
 * Idle → ToggledOn → Waiting → ToggledOff → [Notifying] → Done
 */

use crate::error::{BridgeError, Result};
use crate::mqtt::BrokerHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const TOGGLE: &str = "TOGGLE";

pub fn power_topic(device_id: &str) -> String {
    format!("cmnd/{device_id}/POWER")
}

pub fn rename_topic(device_id: &str) -> String {
    format!("cmnd/{device_id}/Topic")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    ToggledOn,
    Waiting,
    ToggledOff,
    Notifying,
    Done,
}

struct Sequence<'a> {
    device_id: &'a str,
    phase: DispatchPhase,
}

impl<'a> Sequence<'a> {
    fn new(device_id: &'a str) -> Self {
        Self { device_id, phase: DispatchPhase::Idle }
    }

    fn enter(&mut self, next: DispatchPhase) {
        debug!(device = self.device_id, from = ?self.phase, to = ?next, "dispatch phase");
        self.phase = next;
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    broker: BrokerHandle,
    http: reqwest::Client,
}

impl CommandDispatcher {
    pub fn new(broker: BrokerHandle) -> Self {
        Self {
            broker,
            http: reqwest::Client::new(),
        }
    }

    pub async fn toggle_power(&self, device_id: &str) -> Result<()> {
        self.broker.publish(&power_topic(device_id), TOGGLE).await
    }

    pub async fn rename(&self, device_id: &str, new_topic: &str) -> Result<()> {
        self.broker.publish(&rename_topic(device_id), new_topic).await
    }

    async fn toggle_sequence(&self, seq: &mut Sequence<'_>, seconds: u64) -> Result<()> {
        self.toggle_power(seq.device_id).await?;
        seq.enter(DispatchPhase::ToggledOn);

        seq.enter(DispatchPhase::Waiting);
        tokio::time::sleep(Duration::from_secs(seconds)).await;

        self.toggle_power(seq.device_id).await?;
        seq.enter(DispatchPhase::ToggledOff);
        Ok(())
    }

    pub async fn toggle_for_duration(&self, device_id: &str, seconds: u64) -> Result<()> {
        let mut seq = Sequence::new(device_id);
        self.toggle_sequence(&mut seq, seconds).await?;
        seq.enter(DispatchPhase::Done);
        info!("device {device_id} toggled for {seconds}s");
        Ok(())
    }

    pub async fn toggle_wait_notify(&self, device_id: &str, seconds: u64, callback_url: &str) -> Result<()> {
        let mut seq = Sequence::new(device_id);
        self.toggle_sequence(&mut seq, seconds).await?;

        seq.enter(DispatchPhase::Notifying);
        self.notify(callback_url).await?;

        seq.enter(DispatchPhase::Done);
        info!("device {device_id} toggled for {seconds}s, callback {callback_url} notified");
        Ok(())
    }

    async fn notify(&self, callback_url: &str) -> Result<()> {
        let callback_failure = |reason: String| BridgeError::Callback {
            url: callback_url.to_string(),
            reason,
        };

        self.http
            .put(callback_url)
            .send()
            .await
            .map_err(|e| callback_failure(e.to_string()))?
            .error_for_status()
            .map_err(|e| callback_failure(e.to_string()))?;
        Ok(())
    }

    pub fn spawn_toggle_for_duration(&self, device_id: String, seconds: u64) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.toggle_for_duration(&device_id, seconds).await {
                error!("duration sequence for {device_id} aborted: {e}");
            }
        })
    }

    pub fn spawn_toggle_wait_notify(&self, device_id: String, seconds: u64, callback_url: String) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher
                .toggle_wait_notify(&device_id, seconds, &callback_url)
                .await
            {
                error!("wait sequence for {device_id} aborted: {e}");
            }
        })
    }
}
