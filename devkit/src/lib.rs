/*!
# PlugBridge DevKit - Stubs et utilitaires pour les tests du kernel

Bibliothèque facilitant les tests du bridge sans broker ni moteur de workflow:
- Stub MQTT qui enregistre les publications horodatées
- Builders de télémétrie au format Tasmota (SENSOR, STATE)
- Sink HTTP qui enregistre les callbacks reçus
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient, TasmotaMessageBuilder};
pub use test_utils::{CallbackSink, ReceivedCall};
