use crate::db;
use crate::errors::Error;
use crate::model::RecordsResponse;
use crate::mqtt::Delivery;
use crate::service::IrrigationHub;
use crate::validate::{
    validate_pump_request, validate_qos, validate_topic_filter, validate_topic_name,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

/// Soil moisture below this raises a dashboard warning.
const LOW_SOIL_PCT: f64 = 10.0;

/// Read-back window cap: ten years.
const MAX_RECORD_HOURS: u32 = 24 * 365 * 10;
const MAX_RECORD_LIMIT: usize = 1000;

type HubState = State<Arc<IrrigationHub>>;

pub fn create_router(hub: Arc<IrrigationHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/irrigation/devices", get(list_devices))
        .route("/api/irrigation/devices/:device_id", get(get_device))
        .route("/api/irrigation/telemetry", get(latest_telemetry))
        .route("/api/irrigation/telemetry/:device_id", get(device_telemetry))
        .route("/api/irrigation/history/:device_id", get(device_history))
        .route("/api/irrigation/pump/:device_id", post(pump_command))
        .route("/api/irrigation/dashboard", get(dashboard))
        .route("/api/mqtt/status", get(mqtt_status))
        .route("/api/mqtt/publish", post(mqtt_publish))
        .route("/api/mqtt/subscribe", post(mqtt_subscribe))
        .route("/api/mqtt/unsubscribe", post(mqtt_unsubscribe))
        .with_state(hub)
}

/// Error body with a status code. Service errors map onto it via `From`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn not_found(error: &str, device_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            json!({ "error": error, "deviceId": device_id }),
        )
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotConnected => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "MQTT client is not connected" }),
            ),
            Error::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, json!({ "error": msg })),
            other => {
                error!("API error: {}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": other.to_string() }),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn health(State(hub): HubState) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "message": "Server is running",
        "services": { "mqtt": hub.connection_status() },
        "devices": hub.list_devices().len(),
        "timestamp": Utc::now(),
    }))
}

async fn list_devices(State(hub): HubState) -> Json<Value> {
    let devices = hub.list_devices();
    Json(json!({
        "message": "Irrigation devices",
        "count": devices.len(),
        "devices": devices,
        "timestamp": Utc::now(),
    }))
}

async fn get_device(State(hub): HubState, Path(device_id): Path<String>) -> ApiResult {
    let device = hub
        .get_device(&device_id)
        .ok_or_else(|| ApiError::not_found("Device not found", &device_id))?;

    Ok(Json(json!({
        "message": format!("Device {} details", device_id),
        "device": device,
        "timestamp": Utc::now(),
    })))
}

async fn latest_telemetry(State(hub): HubState) -> Json<Value> {
    Json(json!({
        "message": "Latest telemetry data",
        "telemetry": hub.latest_telemetry_all(),
        "timestamp": Utc::now(),
    }))
}

async fn device_telemetry(State(hub): HubState, Path(device_id): Path<String>) -> ApiResult {
    let device = hub
        .get_device(&device_id)
        .ok_or_else(|| ApiError::not_found("Device not found", &device_id))?;

    Ok(Json(json!({
        "message": format!("Latest telemetry for {}", device_id),
        "deviceId": device_id,
        "telemetry": device.latest_telemetry,
        "timestamp": Utc::now(),
    })))
}

async fn device_history(State(hub): HubState, Path(device_id): Path<String>) -> ApiResult {
    let history = hub.history_of(&device_id);
    if history.is_empty() {
        return Err(ApiError::not_found(
            "No telemetry history found for device",
            &device_id,
        ));
    }

    Ok(Json(json!({
        "message": format!("Telemetry history for {}", device_id),
        "deviceId": device_id,
        "count": history.len(),
        "history": history,
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct PumpRequest {
    action: Option<String>,
    duration: Option<i64>,
}

async fn pump_command(
    State(hub): HubState,
    Path(device_id): Path<String>,
    Json(request): Json<PumpRequest>,
) -> ApiResult {
    let (action, duration) =
        validate_pump_request(request.action.as_deref(), request.duration).map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": e.to_string(),
                    "example": { "action": "start", "duration": 5000 },
                }),
            )
        })?;

    let sent = hub.send_pump_command(&device_id, action, duration)?;

    Ok(Json(json!({
        "message": format!("Pump {} command sent to {}", action, device_id),
        "deviceId": sent.device_id,
        "action": sent.action,
        "duration": sent.duration,
        "topic": sent.topic,
        "payload": sent.payload,
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Serialize)]
struct Alert {
    #[serde(rename = "type")]
    kind: &'static str,
    device: String,
    message: String,
}

async fn dashboard(State(hub): HubState) -> Json<Value> {
    let devices = hub.list_devices();
    let telemetry = hub.latest_telemetry_all();

    let online_devices = devices.iter().filter(|d| d.status.is_online()).count();

    let mut alerts = Vec::new();
    for (device_id, reading) in &telemetry {
        if let Some(soil) = reading.soil_pct.filter(|pct| *pct < LOW_SOIL_PCT) {
            alerts.push(Alert {
                kind: "warning",
                device: device_id.clone(),
                message: format!("Low soil moisture: {}%", soil),
            });
        }
        if reading.pump_running == Some(true) {
            alerts.push(Alert {
                kind: "info",
                device: device_id.clone(),
                message: "Pump is running".to_string(),
            });
        }
    }

    Json(json!({
        "message": "Irrigation system dashboard",
        "summary": {
            "totalDevices": devices.len(),
            "onlineDevices": online_devices,
            "devicesWithTelemetry": telemetry.len(),
            "alertCount": alerts.len(),
        },
        "devices": devices,
        "latestTelemetry": telemetry,
        "alerts": alerts,
        "timestamp": Utc::now(),
    }))
}

async fn mqtt_status(State(hub): HubState) -> Json<Value> {
    Json(json!({
        "message": "MQTT connection status",
        "status": hub.connection_status(),
        "timestamp": Utc::now(),
    }))
}

/// `qos` and `retain` as sent by API clients.
#[derive(Debug, Default, Deserialize)]
pub struct MessageOptions {
    qos: Option<u8>,
    retain: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    topic: Option<String>,
    /// `null` is a message; only a missing field is rejected.
    #[serde(default, deserialize_with = "present")]
    message: Option<Value>,
    #[serde(default)]
    options: Option<MessageOptions>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

async fn mqtt_publish(State(hub): HubState, Json(request): Json<PublishRequest>) -> ApiResult {
    let (Some(topic), Some(message)) = (request.topic, request.message) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Topic and message are required",
                "example": { "topic": "my/test/topic", "message": "Hello World" },
            }),
        ));
    };
    validate_topic_name(&topic)?;
    let options = request.options.unwrap_or_default();
    let delivery = Delivery {
        qos: validate_qos(options.qos)?,
        retain: options.retain.unwrap_or(false),
    };

    hub.publish(&topic, &message, delivery)?;

    Ok(Json(json!({
        "message": "Message published successfully",
        "topic": topic,
        "data": message,
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TopicRequest {
    topic: Option<String>,
    #[serde(default)]
    options: Option<MessageOptions>,
}

fn required_topic(topic: Option<String>) -> Result<String, ApiError> {
    let topic = topic.unwrap_or_default();
    validate_topic_filter(&topic)?;
    Ok(topic)
}

async fn mqtt_subscribe(State(hub): HubState, Json(request): Json<TopicRequest>) -> ApiResult {
    let topic = required_topic(request.topic)?;
    let qos = validate_qos(request.options.unwrap_or_default().qos)?;
    hub.subscribe(&topic, qos)?;

    Ok(Json(json!({
        "message": "Subscribed to topic successfully",
        "topic": topic,
        "timestamp": Utc::now(),
    })))
}

async fn mqtt_unsubscribe(State(hub): HubState, Json(request): Json<TopicRequest>) -> ApiResult {
    let topic = required_topic(request.topic)?;
    hub.unsubscribe(&topic)?;

    Ok(Json(json!({
        "message": "Unsubscribed from topic successfully",
        "topic": topic,
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Clone)]
struct RecordsState {
    pool: PgPool,
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    device_id: Option<String>,
    hours: Option<u32>,
    limit: Option<usize>,
}

impl RecordsQuery {
    fn hours(&self) -> u32 {
        self.hours.unwrap_or(24).min(MAX_RECORD_HOURS)
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(100).min(MAX_RECORD_LIMIT)
    }
}

/// Read-back of persisted history.
pub fn records_router(pool: PgPool) -> Router {
    let state = RecordsState { pool };

    Router::new()
        .route("/api/records/telemetry", get(telemetry_records))
        .route("/api/records/status", get(status_records))
        .route("/api/records/pump-events", get(pump_event_records))
        .with_state(state)
}

async fn telemetry_records(
    State(state): State<RecordsState>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse<crate::model::TelemetryRecord>>, AppError> {
    let data = db::query_telemetry(
        &state.pool,
        params.device_id.as_deref(),
        params.hours(),
        params.limit(),
    )
    .await?;
    Ok(Json(records_response(data, &params)))
}

async fn status_records(
    State(state): State<RecordsState>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse<crate::model::StatusRecord>>, AppError> {
    let data = db::query_status(
        &state.pool,
        params.device_id.as_deref(),
        params.hours(),
        params.limit(),
    )
    .await?;
    Ok(Json(records_response(data, &params)))
}

async fn pump_event_records(
    State(state): State<RecordsState>,
    Query(params): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse<crate::model::PumpEventRecord>>, AppError> {
    let data = db::query_pump_events(
        &state.pool,
        params.device_id.as_deref(),
        params.hours(),
        params.limit(),
    )
    .await?;
    Ok(Json(records_response(data, &params)))
}

fn records_response<T>(data: Vec<T>, params: &RecordsQuery) -> RecordsResponse<T> {
    RecordsResponse {
        total: data.len(),
        data,
        hours: params.hours(),
        limit: params.limit(),
    }
}

/// Serves `app` until the shutdown flag flips to true, then stops accepting
/// and waits for in-flight requests to finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandPublisher;
    use crate::forward::Forwarder;
    use crate::model::DeviceStatus;
    use crate::mqtt::fake::FakeSession;
    use crate::mqtt::ConnectionState;
    use crate::store::DeviceStore;
    use tokio::sync::mpsc;

    struct Fixture {
        hub: Arc<IrrigationHub>,
        store: Arc<DeviceStore>,
        session: Arc<FakeSession>,
    }

    fn fixture(state: ConnectionState) -> Fixture {
        let store = Arc::new(DeviceStore::new());
        let session = Arc::new(FakeSession::with_state(state));
        let (tx, _rx) = mpsc::channel(16);
        let forwarder = Forwarder::new(tx);
        let commands = CommandPublisher::new(session.clone(), forwarder);
        let hub = Arc::new(IrrigationHub::new(store.clone(), session.clone(), commands));
        Fixture {
            hub,
            store,
            session,
        }
    }

    fn reading(soil_pct: f64, pump_running: bool) -> crate::model::TelemetryReading {
        crate::model::TelemetryReading {
            soil_mv: None,
            soil_pct: Some(soil_pct),
            light_mv: None,
            light_pct: None,
            temp_c: Some(20.0),
            humidity_pct: None,
            pump_running: Some(pump_running),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_device_not_found() {
        let f = fixture(ConnectionState::Connected);

        let err = get_device(State(f.hub), Path("nope".to_string()))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body["deviceId"], "nope");
    }

    #[tokio::test]
    async fn test_get_device_found() {
        let f = fixture(ConnectionState::Connected);
        f.store.record_status("DEV1", DeviceStatus::Online, Utc::now());

        let Json(body) = get_device(State(f.hub), Path("DEV1".to_string()))
            .await
            .unwrap();

        assert_eq!(body["device"]["id"], "DEV1");
        assert_eq!(body["device"]["status"], "online");
    }

    #[tokio::test]
    async fn test_history_empty_is_not_found() {
        let f = fixture(ConnectionState::Connected);
        f.store.record_status("DEV1", DeviceStatus::Online, Utc::now());

        let err = device_history(State(f.hub), Path("DEV1".to_string()))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pump_start_publishes() {
        let f = fixture(ConnectionState::Connected);
        let request = PumpRequest {
            action: Some("start".to_string()),
            duration: Some(3000),
        };

        let Json(body) = pump_command(State(f.hub), Path("DEV1".to_string()), Json(request))
            .await
            .unwrap();

        assert_eq!(body["topic"], "irrig/DEV1/cmd");
        assert_eq!(body["duration"], 3000);
        assert_eq!(f.session.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_rejects_bad_action_and_duration() {
        let f = fixture(ConnectionState::Connected);

        let bad_action = PumpRequest {
            action: Some("pause".to_string()),
            duration: None,
        };
        let err = pump_command(State(f.hub.clone()), Path("DEV1".to_string()), Json(bad_action))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let bad_duration = PumpRequest {
            action: Some("start".to_string()),
            duration: Some(0),
        };
        let err = pump_command(State(f.hub), Path("DEV1".to_string()), Json(bad_duration))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(f.session.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pump_when_disconnected() {
        let f = fixture(ConnectionState::Disconnected);
        let request = PumpRequest {
            action: Some("stop".to_string()),
            duration: None,
        };

        let err = pump_command(State(f.hub), Path("DEV1".to_string()), Json(request))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(f.session.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dashboard_alerts() {
        let f = fixture(ConnectionState::Connected);
        let now = Utc::now();
        f.store.record_status("dry", DeviceStatus::Online, now);
        f.store.record_telemetry("dry", reading(4.0, false));
        f.store.record_status("watering", DeviceStatus::Offline, now);
        f.store.record_telemetry("watering", reading(55.0, true));
        f.store.record_status("quiet", DeviceStatus::Online, now);

        let Json(body) = dashboard(State(f.hub)).await;

        assert_eq!(body["summary"]["totalDevices"], 3);
        assert_eq!(body["summary"]["onlineDevices"], 2);
        assert_eq!(body["summary"]["devicesWithTelemetry"], 2);
        assert_eq!(body["summary"]["alertCount"], 2);
        let alerts = body["alerts"].as_array().unwrap();
        assert!(alerts
            .iter()
            .any(|a| a["type"] == "warning" && a["device"] == "dry"));
        assert!(alerts
            .iter()
            .any(|a| a["type"] == "info" && a["device"] == "watering"));
    }

    fn body<T: serde::de::DeserializeOwned>(value: Value) -> Json<T> {
        Json(serde_json::from_value(value).unwrap())
    }

    #[tokio::test]
    async fn test_publish_requires_topic_and_message() {
        let f = fixture(ConnectionState::Connected);

        let err = mqtt_publish(State(f.hub), body(json!({ "topic": "my/test/topic" })))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(f.session.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_null_message() {
        let f = fixture(ConnectionState::Connected);

        let Json(response) = mqtt_publish(
            State(f.hub),
            body(json!({ "topic": "my/test/topic", "message": null })),
        )
        .await
        .unwrap();

        assert_eq!(response["data"], Value::Null);
        let published = f.session.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, b"null".to_vec());
    }

    #[tokio::test]
    async fn test_publish_string_message_is_sent_raw() {
        let f = fixture(ConnectionState::Connected);

        let Json(response) = mqtt_publish(
            State(f.hub),
            body(json!({ "topic": "my/test/topic", "message": "Hello World" })),
        )
        .await
        .unwrap();

        assert_eq!(response["topic"], "my/test/topic");
        let published = f.session.published.lock();
        assert_eq!(published[0].0, "my/test/topic");
        assert_eq!(published[0].1, b"Hello World".to_vec());
        assert_eq!(published[0].2, Delivery::default());
    }

    #[tokio::test]
    async fn test_publish_options_are_passed_through() {
        let f = fixture(ConnectionState::Connected);

        let Json(response) = mqtt_publish(
            State(f.hub.clone()),
            body(json!({
                "topic": "irrig/DEV1/config",
                "message": { "interval": 30 },
                "options": { "qos": 0, "retain": true },
            })),
        )
        .await
        .unwrap();
        assert_eq!(response["data"]["interval"], 30);

        let err = mqtt_publish(
            State(f.hub),
            body(json!({ "topic": "a/b", "message": 1, "options": { "qos": 5 } })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let published = f.session.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].2,
            Delivery {
                qos: rumqttc::QoS::AtMostOnce,
                retain: true,
            }
        );
    }

    #[tokio::test]
    async fn test_subscribe_validates_and_requires_connection() {
        let f = fixture(ConnectionState::Disconnected);

        let bad_filter = body(json!({ "topic": "irrig/#/status" }));
        let err = mqtt_subscribe(State(f.hub.clone()), bad_filter)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = mqtt_subscribe(State(f.hub), body(json!({ "topic": "irrig/+/status" })))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_subscribe_with_qos() {
        let f = fixture(ConnectionState::Connected);

        let Json(response) = mqtt_subscribe(
            State(f.hub),
            body(json!({ "topic": "garden/#", "options": { "qos": 2 } })),
        )
        .await
        .unwrap();

        assert_eq!(response["topic"], "garden/#");
        assert_eq!(
            f.session.subscribed.lock().as_slice(),
            &[("garden/#".to_string(), rumqttc::QoS::ExactlyOnce)]
        );
    }

    #[test]
    fn test_records_query_is_clamped() {
        let query: RecordsQuery =
            serde_json::from_value(json!({ "hours": u32::MAX, "limit": 50_000 })).unwrap();
        assert_eq!(query.hours(), MAX_RECORD_HOURS);
        assert_eq!(query.limit(), MAX_RECORD_LIMIT);
        assert!(i32::try_from(query.hours()).is_ok());

        let defaults: RecordsQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(defaults.hours(), 24);
        assert_eq!(defaults.limit(), 100);
    }

    #[tokio::test]
    async fn test_mqtt_status_reports_state() {
        let f = fixture(ConnectionState::Connected);

        let Json(body) = mqtt_status(State(f.hub)).await;

        assert_eq!(body["status"]["connected"], true);
        assert_eq!(body["status"]["state"], "connected");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let f = fixture(ConnectionState::Connected);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, create_router(f.hub.clone()), shutdown_rx));

        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server stopped");
        assert!(result.unwrap().is_ok());
        // the router and its hub have been released
        assert_eq!(Arc::strong_count(&f.hub), 1);
    }
}
