use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    /// Aléatoire par défaut, comme un client paho sans identifiant
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Taille des files de requêtes (rumqttc + handle de publication)
    pub request_capacity: usize,
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: format!("plugbridge-{}", uuid::Uuid::new_v4().simple()),
            keep_alive_secs: 60,
            request_capacity: 64,
            publish_timeout_secs: 10,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Surcharges par variables d'environnement (PLUGBRIDGE_MQTT_HOST, ...)
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = var("PLUGBRIDGE_MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = var("PLUGBRIDGE_MQTT_PORT") {
        match port.parse() {
            Ok(port) => cfg.mqtt.port = port,
            Err(e) => warn!("ignoring PLUGBRIDGE_MQTT_PORT={port}: {e}"),
        }
    }
    if let Some(bind) = var("PLUGBRIDGE_HTTP_BIND") {
        cfg.http.bind = bind;
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("PLUGBRIDGE_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        info!("no {path} found, using default config");
        KernelConfig::default()
    };

    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}
