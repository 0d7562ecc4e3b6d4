//! Node assembly and HTTP endpoints.
//!
//! `run_node` builds the ecology from the configuration, starts its
//! connectors and loop, then serves a small JSON API next to it:
//!
//! - `GET /health`
//! - `GET /devices`
//! - `GET /data`, `GET|PUT|DELETE /data/:key`
//! - `POST /rooms/:room/events/:event` with a JSON array body

use crate::config::{Config, RoomConfig};
use crate::json::{from_json, to_json};
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ecology_core::{
    DataSyncListener, Ecology, EcologyError, EcologyFactory, EcologyHandle, EcologyRuntime,
    EventReceiver,
};
use ecology_protocol::Value;
use ecology_transport::WebSocketConnector;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How often connector and store gauges are refreshed.
const GAUGE_INTERVAL: Duration = Duration::from_secs(5);

/// Shared HTTP state.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the running ecology loop.
    pub handle: EcologyHandle,
    /// Whether this node holds the reference store.
    pub is_reference: bool,
}

/// Error returned by the HTTP endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
        }
    }
}

impl From<EcologyError> for ApiError {
    fn from(e: EcologyError) -> Self {
        let status = match e {
            EcologyError::Event(_) => StatusCode::BAD_REQUEST,
            EcologyError::LoopClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        metrics::record_error("api");
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the ecology described by `config`, without starting it.
///
/// # Errors
///
/// Returns an error if a configured room or event name is invalid.
pub fn build_ecology(factory: &EcologyFactory, config: &Config) -> Result<Ecology> {
    let mut ecology = factory.create(config.ecology_config())?;

    for connector in &config.connectors {
        let id = ecology.add_connector(Box::new(WebSocketConnector::new(
            connector.role,
            connector.websocket_config(),
        )));
        debug!(connector = id, role = %connector.role, address = %connector.address, "Connector added");
    }

    for room in &config.rooms {
        watch_room(&mut ecology, room)?;
    }

    let listener: Arc<dyn DataSyncListener> =
        Arc::new(|key: &str, new: Option<&Value>, _old: Option<&Value>| {
            metrics::record_data_change(new.is_none());
            debug!(key = %key, deleted = new.is_none(), "Data changed");
        });
    ecology.data_sync_mut().add_listener(listener);

    if config.is_reference {
        for (key, value) in config.seed_data() {
            ecology.set_data(&key, value);
        }
        info!(keys = ecology.data_sync().len(), "Reference store seeded");
    } else if !config.data.is_empty() {
        warn!("Ignoring [data] seed on a non-reference node");
    }

    Ok(ecology)
}

/// Log and count every configured event of a room.
fn watch_room(ecology: &mut Ecology, config: &RoomConfig) -> Result<()> {
    let room_name = config.name.clone();
    let receiver: Arc<dyn EventReceiver> = Arc::new(move |event: &str, data: &[Value]| {
        metrics::record_event(&room_name, event);
        info!(room = %room_name, event = %event, args = data.len(), "Event");
    });

    let room = ecology.room(&config.name)?;
    for event in &config.events {
        room.event_broadcaster_mut()
            .subscribe(event, Arc::clone(&receiver))?;
    }
    debug!(room = %config.name, events = config.events.len(), "Watching room");
    Ok(())
}

/// HTTP routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/devices", get(devices_handler))
        .route("/data", get(list_data_handler))
        .route(
            "/data/:key",
            get(get_data_handler)
                .put(put_data_handler)
                .delete(delete_data_handler),
        )
        .route("/rooms/:room/events/:event", post(publish_handler))
        .with_state(state)
}

/// Run a node until interrupted.
///
/// # Errors
///
/// Returns an error if the ecology cannot be built or the HTTP listener
/// cannot be bound.
pub async fn run_node(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let factory = EcologyFactory::new();
    let mut ecology = build_ecology(&factory, &config)?;

    if let Err(e) = ecology.connect_all().await {
        // the loop still runs the connectors that did start
        metrics::record_error("connect");
        error!(error = %e, "Connector failed to start");
    }

    let (handle, join) = EcologyRuntime::spawn(ecology);
    tokio::spawn(update_gauges(handle.clone()));

    let state = AppState {
        handle: handle.clone(),
        is_reference: config.is_reference,
    };

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(device = %handle.device_id(), "Ecology node listening on {}", addr);

    let shutdown_handle = handle.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = shutdown_handle.cancelled() => {}
            }
        })
        .await?;

    handle.shutdown();
    let ecology = join.await?;
    info!(device = %ecology.device_id(), "Ecology node stopped");
    Ok(())
}

async fn update_gauges(handle: EcologyHandle) {
    let mut interval = tokio::time::interval(GAUGE_INTERVAL);
    loop {
        tokio::select! {
            _ = handle.cancelled() => break,
            _ = interval.tick() => {
                let counts = handle
                    .request(|ecology| (ecology.connected_connectors(), ecology.connector_count()))
                    .await;
                match counts {
                    Ok((connected, configured)) => {
                        metrics::set_node_state(connected, configured, handle.data().len());
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "device_id": state.handle.device_id().as_str(),
        "is_reference": state.is_reference,
        "synchronized": state.handle.is_synchronized(),
    }))
}

async fn devices_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let (connected, devices) = state
        .handle
        .request(|ecology| {
            let devices: Vec<String> = ecology
                .connected_devices()
                .into_iter()
                .map(|d| d.0)
                .collect();
            (ecology.is_connected(), devices)
        })
        .await?;
    Ok(Json(json!({ "connected": connected, "devices": devices })))
}

async fn list_data_handler(State(state): State<AppState>) -> impl IntoResponse {
    let object: Map<String, serde_json::Value> = state
        .handle
        .data()
        .snapshot()
        .iter()
        .map(|(k, v)| (k.clone(), to_json(v)))
        .collect();
    Json(serde_json::Value::Object(object))
}

async fn get_data_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let value = state
        .handle
        .get_data(&key)
        .ok_or_else(|| ApiError::not_found(format!("no such key: {key}")))?;
    Ok(Json(json!({ "key": key, "value": to_json(&value) })))
}

async fn put_data_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let value = from_json(&body);
    let changed = state
        .handle
        .request(move |ecology| ecology.set_data(&key, value))
        .await?;
    Ok(Json(json!({ "changed": changed })))
}

async fn delete_data_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let changed = state
        .handle
        .request(move |ecology| ecology.set_data(&key, Value::Null))
        .await?;
    Ok(Json(json!({ "changed": changed })))
}

async fn publish_handler(
    State(state): State<AppState>,
    Path((room, event)): Path<(String, String)>,
    Json(body): Json<Vec<serde_json::Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let data: Vec<Value> = body.iter().map(from_json).collect();
    state.handle.publish(&room, &event, data)?;
    Ok(StatusCode::ACCEPTED)
}
