use crate::error::{BridgeError, Result};

/// Classification des messages de télémétrie porteurs de mesures
pub const SENSOR_CLASSIFICATION: &str = "SENSOR";

/// Message MQTT entrant découpé
/// Ex: "tele/delock/SENSOR" -> device "delock", classification "SENSOR"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub device_id: String,
    pub classification: String,
    pub segments: Vec<String>,
    pub payload: String,
}

impl DecodedMessage {
    pub fn is_sensor(&self) -> bool {
        self.classification == SENSOR_CLASSIFICATION
    }
}

pub fn decode(topic: &str, payload: &[u8]) -> Result<DecodedMessage> {
    let segments: Vec<String> = topic.split('/').map(str::to_string).collect();

    let Some(device_id) = segments.get(1).cloned() else {
        return Err(BridgeError::Decode {
            topic: topic.to_string(),
            reason: "topic has no device segment".into(),
        });
    };
    // split() renvoie toujours au moins un segment
    let classification = segments.last().cloned().unwrap_or_default();

    let payload = std::str::from_utf8(payload)
        .map_err(|e| BridgeError::Decode {
            topic: topic.to_string(),
            reason: format!("payload is not valid UTF-8: {e}"),
        })?
        .to_string();

    Ok(DecodedMessage {
        device_id,
        classification,
        segments,
        payload,
    })
}
