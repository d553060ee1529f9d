//! HTTP API for the web client.
//!
//! JSON endpoints over the orchestrator and command executor. Errors render
//! as `{"detail": ...}` with the status code from the service taxonomy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atomic_config::atomic_update_device_metadata;
use crate::doser_storage::{DeviceMetadata, DoserDevice, DoserHead};
use crate::error::ServiceError;
use crate::executor::{CommandExecutor, CommandRecord, CommandRequest};
use crate::light_storage::{LightDevice, Profile};
use crate::service::BleService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BleService>,
    pub executor: Arc<CommandExecutor>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/debug/live-status", post(live_status))
        .route("/api/scan", get(scan))
        .route("/api/devices/:address/status", post(device_status))
        .route("/api/devices/:address/connect", post(device_connect))
        .route("/api/devices/:address/disconnect", post(device_disconnect))
        .route(
            "/api/devices/:address/commands",
            post(post_command).get(list_commands),
        )
        .route("/api/devices/:address/commands/:id", get(get_command))
        .route("/api/configurations", get(list_configurations))
        .route("/api/device-metadata", get(list_device_metadata))
        .route(
            "/api/configurations/:address",
            get(get_configuration)
                .put(put_configuration)
                .delete(delete_configuration),
        )
        .route(
            "/api/configurations/:address/configurations",
            get(list_device_configurations).post(create_device_configuration),
        )
        .route(
            "/api/configurations/:address/revisions",
            post(add_configuration_revision),
        )
        .route(
            "/api/configurations/:address/activate",
            post(activate_configuration),
        )
        .route(
            "/api/configurations/:address/metadata",
            get(get_device_metadata).put(put_device_metadata),
        )
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<HashMap<String, Value>> {
    Json(state.service.status_dtos().await)
}

async fn live_status(State(state): State<AppState>) -> Json<Value> {
    let (statuses, errors) = state.service.get_live_statuses().await;
    let mut dtos = Vec::with_capacity(statuses.len());
    for status in &statuses {
        dtos.push(state.service.status_to_dto(status).await);
    }
    Json(json!({ "statuses": dtos, "errors": errors }))
}

#[derive(Deserialize)]
struct ScanParams {
    #[serde(default)]
    timeout: Option<f64>,
}

async fn scan(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<Json<Value>, ServiceError> {
    let timeout = Duration::from_secs_f64(params.timeout.unwrap_or(5.0).clamp(0.0, 60.0));
    let results = state.service.scan_devices(timeout).await?;
    Ok(Json(serde_json::to_value(results).unwrap_or_default()))
}

async fn device_status(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    let status = state.service.request_status(&address).await?;
    Ok(Json(state.service.status_to_dto(&status).await))
}

async fn device_connect(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    let status = state.service.connect_device(&address, None).await?;
    Ok(Json(state.service.status_to_dto(&status).await))
}

async fn device_disconnect(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    state.service.disconnect_device(&address).await?;
    Ok(Json(json!({ "detail": "disconnected" })))
}

async fn post_command(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandRecord> {
    Json(state.executor.execute_command(&address, request).await)
}

#[derive(Deserialize)]
struct CommandListParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_commands(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<CommandListParams>,
) -> Json<Vec<Value>> {
    Json(state.service.get_commands(&address, params.limit.unwrap_or(20)))
}

async fn get_command(
    State(state): State<AppState>,
    Path((address, id)): Path<(String, String)>,
) -> Response {
    match state.service.get_command(&address, &id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Command not found" })),
        )
            .into_response(),
    }
}

async fn list_configurations(State(state): State<AppState>) -> Json<Value> {
    let dosers: Vec<Value> = state
        .service
        .doser_storage()
        .list_devices()
        .iter()
        .filter_map(|device| serde_json::to_value(device).ok())
        .collect();
    let lights: Vec<Value> = state
        .service
        .light_storage()
        .list_devices()
        .iter()
        .filter_map(|device| serde_json::to_value(device).ok())
        .collect();
    Json(json!({ "dosers": dosers, "lights": lights }))
}

async fn get_configuration(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    if let Some(device) = state.service.doser_storage().get_device(&address)? {
        return Ok(Json(json!({ "device_type": "doser", "device": device })));
    }
    if let Some(device) = state.service.light_storage().get_device(&address)? {
        return Ok(Json(json!({ "device_type": "light", "device": device })));
    }
    Err(ServiceError::DeviceNotFound(None))
}

async fn put_configuration(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServiceError> {
    let device_type = body
        .get("device_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::InvalidArgs("device_type is required".to_string()))?;
    let document = body
        .get("device")
        .cloned()
        .ok_or_else(|| ServiceError::InvalidArgs("device is required".to_string()))?;

    match device_type {
        "doser" => {
            let mut device: DoserDevice = serde_json::from_value(document)
                .map_err(|e| ServiceError::InvalidArgs(e.to_string()))?;
            device.id = address;
            let stored = state.service.doser_storage().upsert_device(device)?;
            Ok(Json(json!({ "device_type": "doser", "device": stored })))
        }
        "light" => {
            let mut device: LightDevice = serde_json::from_value(document)
                .map_err(|e| ServiceError::InvalidArgs(e.to_string()))?;
            device.id = address;
            let stored = state.service.light_storage().upsert_device(device)?;
            Ok(Json(json!({ "device_type": "light", "device": stored })))
        }
        other => Err(ServiceError::InvalidArgs(format!(
            "unknown device_type '{other}'"
        ))),
    }
}

async fn list_device_configurations(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    if state.service.doser_storage().get_device(&address)?.is_some() {
        let configurations = state.service.doser_storage().list_configurations(&address)?;
        return Ok(Json(serde_json::to_value(configurations).unwrap_or_default()));
    }
    if state.service.light_storage().get_device(&address)?.is_some() {
        let configurations = state.service.light_storage().list_configurations(&address)?;
        return Ok(Json(serde_json::to_value(configurations).unwrap_or_default()));
    }
    Err(ServiceError::DeviceNotFound(None))
}

#[derive(Deserialize)]
struct NewConfigurationBody {
    name: String,
    heads: Vec<DoserHead>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    saved_by: Option<String>,
    #[serde(default)]
    set_active: bool,
}

/// Create a named doser configuration. Light documents are replaced
/// wholesale through PUT since their profile shape differs per revision.
async fn create_device_configuration(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<NewConfigurationBody>,
) -> Result<Json<Value>, ServiceError> {
    let configuration = state.service.doser_storage().create_configuration(
        &address,
        &body.name,
        body.heads,
        crate::doser_storage::NewConfiguration {
            description: body.description,
            configuration_id: None,
            saved_by: body.saved_by,
            note: body.note,
            saved_at: None,
            set_active: body.set_active,
        },
    )?;
    Ok(Json(serde_json::to_value(configuration).unwrap_or_default()))
}

#[derive(Deserialize)]
struct NewRevisionBody {
    device_type: String,
    #[serde(default)]
    configuration_id: Option<String>,
    #[serde(default)]
    heads: Option<Vec<DoserHead>>,
    #[serde(default)]
    profile: Option<Profile>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    saved_by: Option<String>,
}

async fn add_configuration_revision(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<NewRevisionBody>,
) -> Result<Json<Value>, ServiceError> {
    match body.device_type.as_str() {
        "doser" => {
            let storage = state.service.doser_storage();
            let configuration_id = match body.configuration_id {
                Some(id) => id,
                None => active_doser_configuration_id(&state, &address)?,
            };
            let heads = body
                .heads
                .ok_or_else(|| ServiceError::InvalidArgs("heads are required".to_string()))?;
            let revision =
                storage.add_revision(&address, &configuration_id, heads, body.note, body.saved_by)?;
            Ok(Json(serde_json::to_value(revision).unwrap_or_default()))
        }
        "light" => {
            let storage = state.service.light_storage();
            let configuration_id = match body.configuration_id {
                Some(id) => id,
                None => active_light_configuration_id(&state, &address)?,
            };
            let profile = body
                .profile
                .ok_or_else(|| ServiceError::InvalidArgs("profile is required".to_string()))?;
            let revision = storage.add_revision(
                &address,
                &configuration_id,
                profile,
                body.note,
                body.saved_by,
            )?;
            Ok(Json(serde_json::to_value(revision).unwrap_or_default()))
        }
        other => Err(ServiceError::InvalidArgs(format!(
            "unknown device_type '{other}'"
        ))),
    }
}

fn active_doser_configuration_id(state: &AppState, address: &str) -> Result<String, ServiceError> {
    let device = state
        .service
        .doser_storage()
        .get_device(address)?
        .ok_or(ServiceError::DeviceNotFound(None))?;
    device
        .active_configuration_id
        .ok_or_else(|| ServiceError::InvalidArgs("device has no active configuration".to_string()))
}

fn active_light_configuration_id(state: &AppState, address: &str) -> Result<String, ServiceError> {
    let device = state
        .service
        .light_storage()
        .get_device(address)?
        .ok_or(ServiceError::DeviceNotFound(None))?;
    device
        .active_configuration_id
        .ok_or_else(|| ServiceError::InvalidArgs("device has no active configuration".to_string()))
}

#[derive(Deserialize)]
struct ActivateBody {
    device_type: String,
    configuration_id: String,
}

async fn activate_configuration(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<ActivateBody>,
) -> Result<Json<Value>, ServiceError> {
    match body.device_type.as_str() {
        "doser" => {
            let configuration = state
                .service
                .doser_storage()
                .set_active_configuration(&address, &body.configuration_id)?;
            Ok(Json(serde_json::to_value(configuration).unwrap_or_default()))
        }
        "light" => {
            let configuration = state
                .service
                .light_storage()
                .set_active_configuration(&address, &body.configuration_id)?;
            Ok(Json(serde_json::to_value(configuration).unwrap_or_default()))
        }
        other => Err(ServiceError::InvalidArgs(format!(
            "unknown device_type '{other}'"
        ))),
    }
}

async fn get_device_metadata(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    let metadata = state
        .service
        .doser_storage()
        .get_device_metadata(&address)?
        .ok_or(ServiceError::DeviceNotFound(None))?;
    Ok(Json(serde_json::to_value(metadata).unwrap_or_default()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    head_names: Option<std::collections::BTreeMap<u8, String>>,
}

async fn put_device_metadata(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<MetadataBody>,
) -> Result<Json<Value>, ServiceError> {
    if let Some(timezone) = &body.timezone {
        if !crate::timezone::is_valid_iana_timezone(timezone) {
            return Err(ServiceError::InvalidArgs(format!(
                "Invalid IANA timezone identifier: {timezone}"
            )));
        }
    }
    let storage = state.service.doser_storage();
    let current = storage
        .get_device_metadata(&address)?
        .unwrap_or(DeviceMetadata {
            id: address.clone(),
            name: None,
            timezone: state.service.display_timezone(),
            head_names: None,
            auto_reconnect: false,
            created_at: None,
            updated_at: None,
        });
    let updated =
        atomic_update_device_metadata(&current, body.name, body.timezone, body.head_names);
    let stored = storage.upsert_device_metadata(updated)?;
    Ok(Json(serde_json::to_value(stored).unwrap_or_default()))
}

async fn list_device_metadata(State(state): State<AppState>) -> Json<Value> {
    let metadata = state.service.doser_storage().list_device_metadata();
    Json(serde_json::to_value(metadata).unwrap_or_default())
}

async fn delete_configuration(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    let removed = state.service.doser_storage().delete_device(&address)?
        || state.service.light_storage().delete_device(&address)?;
    if removed {
        Ok(Json(json!({ "detail": "deleted" })))
    } else {
        Err(ServiceError::DeviceNotFound(None))
    }
}
