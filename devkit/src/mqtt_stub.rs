/*!
Mock MQTT Client pour tester sans broker

Enregistre tous les messages publiés avec leur instant de publication,
ce qui permet de vérifier l'écart entre deux commandes temporisées.
*/

use anyhow::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Instant de réception par le mock
    pub at: Instant,
}

/// Mock MQTT Client : enregistre les publications sortantes du bridge (QoS 0, non retenues)
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simule la publication d'un message
    pub async fn publish<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            at: Instant::now(),
        };

        log::info!("[MOCK] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages
            .lock()
            .map_err(|_| anyhow::anyhow!("mock state poisoned"))?
            .push(message);
        Ok(())
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }
}

/// Helper pour créer des messages de télémétrie au format Tasmota
pub struct TasmotaMessageBuilder;

impl TasmotaMessageBuilder {
    /// Ex: tele_topic("delock", "SENSOR") -> "tele/delock/SENSOR"
    pub fn tele_topic(device_id: &str, kind: &str) -> String {
        format!("tele/{device_id}/{kind}")
    }

    fn now() -> String {
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Crée un message tele/<id>/SENSOR d'une prise avec mesure d'énergie
    pub fn sensor(current: f64) -> Value {
        let voltage = 230.0;
        let power = (current * voltage).round();
        serde_json::json!({
            "Time": Self::now(),
            "ENERGY": {
                "TotalStartTime": "2023-01-01T00:00:00",
                "Total": 12.345,
                "Yesterday": 0.5,
                "Today": 0.125,
                "Power": power,
                "ApparentPower": power,
                "ReactivePower": 0.0,
                "Factor": 1.0,
                "Voltage": voltage,
                "Current": current
            }
        })
    }

    /// Crée un message tele/<id>/STATE
    pub fn state(power_on: bool) -> Value {
        serde_json::json!({
            "Time": Self::now(),
            "Uptime": "0T01:00:00",
            "POWER": if power_on { "ON" } else { "OFF" },
            "Wifi": { "SSId": "lab", "RSSI": 80 }
        })
    }
}
