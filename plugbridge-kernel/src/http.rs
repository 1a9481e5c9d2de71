/**
 * API REST PLUGBRIDGE - Façade HTTP du bridge
 *
 * RÔLE :
 * Expose l'état collecté depuis MQTT et permet de piloter les prises.
 *
 * ROUTES :
 * - GET/DELETE  /, /statistics/, /energyConsumption/ (collections entières)
 * - GET/DELETE  /{id}/statistics/, /{id}/energyConsumption/, DELETE /{id}/
 * - PUT /{id}/          : renommage (cmnd/{id}/Topic)
 * - PUT /{id}/state/    : TOGGLE immédiat (cmnd/{id}/POWER)
 * - PUT /{id}/duration/ : TOGGLE, attente, TOGGLE en tâche détachée
 * - PUT /{id}/wait/     : idem + callback CPEE, réponse immédiate avec CPEE-CALLBACK: true
 * - GET /health         : état du kernel
 *
 * ERREURS :
 * 404 pour un appareil absent en lecture, 503 si une publication n'est pas
 * confirmée. Les suppressions d'entrées absentes répondent 200.
 */

use crate::dispatcher::CommandDispatcher;
use crate::error::BridgeError;
use crate::health::{HealthTracker, KernelHealth};
use crate::state::{EnergyLog, EnergySeries, LatestReadings, StateStore};
use axum::extract::{Form, FromRequest, Multipart, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// En-tête portant l'URL de callback du moteur CPEE
pub const CALLBACK_HEADER: &str = "cpee-callback";

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub dispatcher: CommandDispatcher,
    pub health: HealthTracker,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    #[serde(rename = "newTopic")]
    new_topic: String,
}

#[derive(Debug, Deserialize)]
struct DurationRequest {
    duration: u64,
}

/// Corps de PUT /{id}/wait/, urlencoded ou multipart/form-data
#[derive(Debug, Deserialize)]
struct WaitForm {
    duration: u64,
}

impl<S: Send + Sync> FromRequest<S> for WaitForm {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let Form(form) = Form::<WaitForm>::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            return Ok(form);
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;
        while let Some(field) = multipart.next_field().await.map_err(IntoResponse::into_response)? {
            if field.name() != Some("duration") {
                continue;
            }
            let text = field.text().await.map_err(IntoResponse::into_response)?;
            return text
                .trim()
                .parse()
                .map(|duration| WaitForm { duration })
                .map_err(|e| bad_request(format!("invalid duration '{text}': {e}")));
        }
        Err(bad_request("missing duration field".into()))
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(get_devices).delete(clear_devices))
        .route("/health", get(get_health))
        .route("/statistics/", get(get_statistics).delete(clear_statistics))
        .route("/energyConsumption/", get(get_energy).delete(clear_energy))
        .route("/{id}/", put(rename_device).delete(remove_device))
        .route(
            "/{id}/statistics/",
            get(get_device_statistics).delete(remove_device_statistics),
        )
        .route(
            "/{id}/energyConsumption/",
            get(get_device_energy).delete(remove_device_energy),
        )
        .route("/{id}/state/", put(toggle_power))
        .route("/{id}/duration/", put(set_duration))
        .route("/{id}/wait/", put(set_wait))
        .with_state(app_state)
}

// Corps vide côté client : `null`
fn done() -> Json<Value> {
    Json(Value::Null)
}

fn bad_request(detail: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "detail": detail }))).into_response()
}

// ============ LECTURES ============

// GET / (appareils connus)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.store.devices())
}

// GET /statistics/
async fn get_statistics(State(app): State<AppState>) -> Json<LatestReadings> {
    Json(app.store.readings())
}

// GET /{id}/statistics/
async fn get_device_statistics(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, BridgeError> {
    app.store.reading(&id).map(Json)
}

// GET /energyConsumption/
async fn get_energy(State(app): State<AppState>) -> Json<EnergyLog> {
    Json(app.store.energy())
}

// GET /{id}/energyConsumption/
async fn get_device_energy(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EnergySeries>, BridgeError> {
    app.store.energy_for(&id).map(Json)
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.store))
}

// ============ SUPPRESSIONS ============

async fn clear_devices(State(app): State<AppState>) -> Json<Value> {
    app.store.clear_devices();
    done()
}

async fn remove_device(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    app.store.remove_device(&id);
    done()
}

async fn clear_statistics(State(app): State<AppState>) -> Json<Value> {
    app.store.clear_readings();
    done()
}

async fn remove_device_statistics(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    app.store.remove_reading(&id);
    done()
}

async fn clear_energy(State(app): State<AppState>) -> Json<Value> {
    app.store.clear_energy();
    done()
}

async fn remove_device_energy(State(app): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    app.store.remove_energy(&id);
    done()
}

// ============ COMMANDES ============

// PUT /{id}/ {"newTopic": "..."}
async fn rename_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<Value>, BridgeError> {
    app.dispatcher
        .rename(&id, &body.new_topic)
        .await
        .inspect_err(|e| error!("rename of {id} failed: {e}"))?;
    Ok(done())
}

// PUT /{id}/state/
async fn toggle_power(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, BridgeError> {
    app.dispatcher
        .toggle_power(&id)
        .await
        .inspect_err(|e| error!("toggle of {id} failed: {e}"))?;
    Ok(done())
}

// PUT /{id}/duration/ {"duration": 10}
async fn set_duration(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DurationRequest>,
) -> Json<Value> {
    info!("toggling {id} for {}s", body.duration);
    // détaché : la requête répond sans attendre la fin
    let _ = app.dispatcher.spawn_toggle_for_duration(id, body.duration);
    done()
}

// PUT /{id}/wait/ (form: duration, header: cpee-callback)
async fn set_wait(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    form: WaitForm,
) -> Response {
    let callback = match headers.get(CALLBACK_HEADER).map(|v| v.to_str()) {
        Some(Ok(url)) => url,
        Some(Err(_)) => {
            warn!("wait request for {id} with a non-ASCII {CALLBACK_HEADER} header");
            return bad_request(format!("invalid {CALLBACK_HEADER} header: not visible ASCII"));
        }
        None => {
            warn!("wait request for {id} without {CALLBACK_HEADER} header");
            return bad_request(format!("missing {CALLBACK_HEADER} header"));
        }
    };

    info!("toggling {id} for {}s, then calling back {callback}", form.duration);
    let _ = app
        .dispatcher
        .spawn_toggle_wait_notify(id, form.duration, callback.to_string());

    ([(CALLBACK_HEADER, "true")], done()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::recording_broker;
    use crate::mqtt::BrokerHandle;
    use chrono::NaiveTime;
    use plugbridge_devkit::{CallbackSink, MockMqttClient, TasmotaMessageBuilder};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    struct TestApp {
        base: String,
        store: StateStore,
        client: reqwest::Client,
    }

    impl TestApp {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    async fn spawn_app(broker: BrokerHandle) -> TestApp {
        let store = StateStore::new();
        let app_state = AppState {
            store: store.clone(),
            dispatcher: CommandDispatcher::new(broker),
            health: HealthTracker::new(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(app_state)).await.unwrap();
        });
        TestApp {
            base: format!("http://{addr}"),
            store,
            client: reqwest::Client::new(),
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_devices_list_and_clear() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;
        app.store.observe_device("plug1");
        app.store.observe_device("plug2");

        let devices: Vec<String> = app.client.get(app.url("/")).send().await.unwrap().json().await.unwrap();
        assert_eq!(devices, vec!["plug1", "plug2"]);

        let resp = app.client.delete(app.url("/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let devices: Vec<String> = app.client.get(app.url("/")).send().await.unwrap().json().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_remove_single_device() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;
        app.store.observe_device("plug1");
        app.store.observe_device("plug2");

        let resp = app.client.delete(app.url("/plug1/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.client.delete(app.url("/ghost/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(app.store.devices(), vec!["plug2"]);
    }

    #[tokio::test]
    async fn test_device_statistics_not_found_then_found() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app.client.get(app.url("/plug1/statistics/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let payload = TasmotaMessageBuilder::sensor(1.5);
        app.store
            .observe_reading_at("plug1", &payload.to_string(), at(8, 30, 0))
            .unwrap();

        let resp = app.client.get(app.url("/plug1/statistics/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, payload);

        let all: Value = app.client.get(app.url("/statistics/")).send().await.unwrap().json().await.unwrap();
        assert_eq!(all["plug1"], payload);
    }

    #[tokio::test]
    async fn test_energy_consumption_endpoints() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;
        app.store
            .observe_reading_at("plug1", r#"{"ENERGY":{"Current":0.25}}"#, at(8, 30, 0))
            .unwrap();

        let series: Value = app
            .client
            .get(app.url("/plug1/energyConsumption/"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(series, serde_json::json!({"08:30:00": 0.25}));

        let all: Value = app.client.get(app.url("/energyConsumption/")).send().await.unwrap().json().await.unwrap();
        assert_eq!(all, serde_json::json!({"plug1": {"08:30:00": 0.25}}));

        let resp = app.client.get(app.url("/plug2/energyConsumption/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        app.client.delete(app.url("/plug1/energyConsumption/")).send().await.unwrap();
        assert!(app.store.energy().is_empty());
    }

    #[tokio::test]
    async fn test_deletes_of_absent_entries_are_ok() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        for path in ["/ghost/statistics/", "/ghost/energyConsumption/", "/statistics/", "/energyConsumption/"] {
            let resp = app.client.delete(app.url(path)).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "DELETE {path}");
        }
    }

    #[tokio::test]
    async fn test_toggle_power_publishes_once() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app.client.put(app.url("/plug1/state/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let sent = mock.find_messages_by_topic("cmnd/plug1/POWER");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"TOGGLE");
    }

    #[tokio::test]
    async fn test_rename_publishes_new_topic() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/delock/"))
            .json(&serde_json::json!({"newTopic": "delock1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let sent = mock.find_messages_by_topic("cmnd/delock/Topic");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"delock1");
    }

    #[tokio::test]
    async fn test_toggle_with_unavailable_broker_is_503() {
        let (broker, requests) = BrokerHandle::channel(4, Duration::from_secs(1));
        drop(requests);
        let app = spawn_app(broker).await;

        let resp = app.client.put(app.url("/plug1/state/")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_duration_returns_before_sequence_ends() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let started = Instant::now();
        let resp = app
            .client
            .put(app.url("/plug1/duration/"))
            .json(&serde_json::json!({"duration": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(mock.find_messages_by_topic("cmnd/plug1/POWER").len(), 2);
    }

    #[tokio::test]
    async fn test_duration_rejects_non_integer() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/duration/"))
            .json(&serde_json::json!({"duration": "soon"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert!(mock.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_wait_marks_async_completion_and_calls_back() {
        let mock = MockMqttClient::new();
        let sink = CallbackSink::start().await.unwrap();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/wait/"))
            .header(CALLBACK_HEADER, sink.url("/instances/7/callbacks/abc"))
            .form(&[("duration", "0")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CALLBACK_HEADER).unwrap(), "true");

        let calls = sink.wait_for_calls(1, Duration::from_secs(5)).await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/instances/7/callbacks/abc");
        assert_eq!(mock.find_messages_by_topic("cmnd/plug1/POWER").len(), 2);
    }

    #[tokio::test]
    async fn test_wait_without_callback_header_is_rejected() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/wait/"))
            .form(&[("duration", "1")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_wait_accepts_multipart_form() {
        let mock = MockMqttClient::new();
        let sink = CallbackSink::start().await.unwrap();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/wait/"))
            .header(CALLBACK_HEADER, sink.url("/callbacks/9"))
            .multipart(reqwest::multipart::Form::new().text("duration", "0"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let calls = sink.wait_for_calls(1, Duration::from_secs(5)).await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/callbacks/9");
    }

    #[tokio::test]
    async fn test_wait_multipart_without_duration_is_rejected() {
        let mock = MockMqttClient::new();
        let sink = CallbackSink::start().await.unwrap();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/wait/"))
            .header(CALLBACK_HEADER, sink.url("/callbacks/9"))
            .multipart(reqwest::multipart::Form::new().text("delay", "3"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(mock.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_wait_with_non_ascii_callback_header_is_rejected() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;

        let resp = app
            .client
            .put(app.url("/plug1/wait/"))
            .header(
                CALLBACK_HEADER,
                reqwest::header::HeaderValue::from_bytes(b"http://cpee/caf\xe9").unwrap(),
            )
            .form(&[("duration", "1")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["detail"].as_str().unwrap().starts_with("invalid cpee-callback header"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mock = MockMqttClient::new();
        let app = spawn_app(recording_broker(&mock)).await;
        app.store.observe_device("plug1");

        let health: Value = app.client.get(app.url("/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["mqtt_status"], "connecting");
        assert_eq!(health["tracked"]["devices"], 1);
    }
}
