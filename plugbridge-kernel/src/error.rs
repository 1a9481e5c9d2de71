/**
 * ERREURS DU BRIDGE - Taxonomie unique kernel
 *
 * RÔLE :
 * Regroupe toutes les erreurs que le kernel sait produire, de la connexion
 * au broker jusqu'au callback HTTP de fin de séquence.
 *
 * POLITIQUE :
 * - Connect       : fatal au démarrage (exit 1)
 * - Decode        : message MQTT ignoré, la connexion reste ouverte
 * - PayloadShape  : lecture capteur ignorée, l'appareil reste connu
 * - NotFound      : 404 côté HTTP
 * - Publish       : loggé, jamais rejoué
 * - Callback      : loggé seulement (la requête HTTP d'origine a déjà répondu)
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("could not connect to MQTT broker {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("cannot decode message on '{topic}': {reason}")]
    Decode { topic: String, reason: String },

    #[error("unexpected payload shape from '{device}': {reason}")]
    PayloadShape { device: String, reason: String },

    #[error("{kind} not found for device '{device}'")]
    NotFound { kind: &'static str, device: String },

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("callback to '{url}' failed: {reason}")]
    Callback { url: String, reason: String },
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            BridgeError::Publish { .. } | BridgeError::Connect { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Decode { .. } | BridgeError::PayloadShape { .. } => {
                StatusCode::BAD_REQUEST
            }
            BridgeError::Callback { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
