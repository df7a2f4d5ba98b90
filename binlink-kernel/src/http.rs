/**
 * API ADMIN - Surface HTTP minimale du kernel
 *
 * RÔLE :
 * Expose l'interface amont du bridge (lecture de mesures, création et mise à jour
 * de bins, télémétrie) pour l'administration et le debug. La vraie couche REST
 * métier (utilisateurs, sessions) reste un collaborateur externe.
 *
 * ROUTES :
 * - /health, /system/health
 * - /devices, /devices/{id}/telemetry
 * - /bins, /bins/{id}, /bins/{id}/readings/{kind}
 * - /bins/{id}/status, /bins/{id}/calibrate, /bins/{id}/buzzer
 */

use crate::bridge::{BinSpec, BinUpdate, BridgeError, CurrentReading, DeviceBridge};
use crate::device::ConnectionRegistry;
use crate::health::HealthTracker;
use crate::models::{BinId, DeviceId, Location, MeasurementKind};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<DeviceBridge>,
    pub registry: ConnectionRegistry,
    pub health: HealthTracker,
}

#[derive(Serialize)]
struct DeviceView {
    device_id: DeviceId,
    peer: String,
    connected_since: String, // RFC3339
    alive: bool,
}

#[derive(Serialize)]
struct MeasurementView {
    bin_id: BinId,
    kind: MeasurementKind,
    value: f64,
    timestamp: String,
    simulated: bool,
}

#[derive(Serialize)]
struct ReadingView {
    status: &'static str,
    measurement: Option<MeasurementView>,
}

#[derive(Debug, Deserialize)]
struct CreateBinBody {
    longitude: f64,
    latitude: f64,
    capacity: f64,
    fill_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct UpdateBinBody {
    longitude: f64,
    latitude: f64,
    fill_threshold: f64,
}

pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::BinNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::InvalidField { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::DeviceUnavailable(_) | BridgeError::MalformedReply(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::SimulatedRangeExhausted => StatusCode::CONFLICT,
            BridgeError::Storage(e) => {
                tracing::error!(error = %e, "storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn reading_view(reading: &CurrentReading) -> ReadingView {
    let status = match reading {
        CurrentReading::Cached(_) => "cached",
        CurrentReading::Fetched(_) => "fetched",
        CurrentReading::NoData => "no_data",
        CurrentReading::Unavailable => "unavailable",
    };
    ReadingView {
        status,
        measurement: reading.measurement().map(|m| MeasurementView {
            bin_id: m.bin_id,
            kind: m.kind,
            value: m.value,
            timestamp: m.timestamp.format(&Rfc3339).unwrap_or_default(),
            simulated: m.provenance == crate::models::Provenance::Simulated,
        }),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/{id}/telemetry", post(post_telemetry))
        .route("/bins", get(list_bins).post(create_bin))
        .route("/bins/{id}", get(get_bin).put(update_bin).delete(delete_bin))
        .route("/bins/{id}/readings/{kind}", get(get_reading))
        .route("/bins/{id}/status", get(get_status))
        .route("/bins/{id}/calibrate", post(calibrate))
        .route("/bins/{id}/buzzer", post(buzzer))
        .with_state(app_state)
}

async fn get_system_health(State(state): State<AppState>) -> Result<Json<crate::health::KernelHealth>, ApiError> {
    let bins = state.bridge.list_bins().await?.len();
    Ok(Json(state.health.get_health(state.registry.len(), bins)))
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceView>> {
    let devices = state
        .registry
        .list_all()
        .into_iter()
        .map(|c| DeviceView {
            device_id: c.id(),
            peer: c.peer().to_string(),
            connected_since: c.connected_at().format(&Rfc3339).unwrap_or_default(),
            alive: c.is_alive(),
        })
        .collect();
    Json(devices)
}

async fn post_telemetry(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Response, ApiError> {
    match state.bridge.record_reading(DeviceId(id), &body).await? {
        Some(m) => Ok((StatusCode::CREATED, Json(json!({ "bin_id": m.bin_id, "kind": m.kind, "value": m.value }))).into_response()),
        None => Ok(StatusCode::ACCEPTED.into_response()),
    }
}

async fn list_bins(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.bridge.list_bins().await?).into_response())
}

async fn get_bin(State(state): State<AppState>, Path(id): Path<BinId>) -> Result<Response, ApiError> {
    Ok(Json(state.bridge.get_bin(id).await?).into_response())
}

async fn create_bin(State(state): State<AppState>, Json(body): Json<CreateBinBody>) -> Result<Response, ApiError> {
    let spec = BinSpec {
        location: Location { longitude: body.longitude, latitude: body.latitude },
        capacity: body.capacity,
        fill_threshold: body.fill_threshold,
    };
    let bin = state.bridge.create_bin(spec).await?;
    Ok((StatusCode::CREATED, Json(bin)).into_response())
}

async fn update_bin(
    State(state): State<AppState>,
    Path(id): Path<BinId>,
    Json(body): Json<UpdateBinBody>,
) -> Result<Response, ApiError> {
    let update = BinUpdate { longitude: body.longitude, latitude: body.latitude, fill_threshold: body.fill_threshold };
    Ok(Json(state.bridge.update_bin(id, update).await?).into_response())
}

async fn delete_bin(State(state): State<AppState>, Path(id): Path<BinId>) -> Result<StatusCode, ApiError> {
    state.bridge.delete_bin(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_reading(
    State(state): State<AppState>,
    Path((id, kind)): Path<(BinId, String)>,
) -> Result<Response, ApiError> {
    let Some(kind) = MeasurementKind::parse(&kind) else {
        return Ok((StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown measurement kind {kind}") }))).into_response());
    };
    let reading = state.bridge.current_reading(id, kind).await?;
    let status = match reading {
        CurrentReading::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((status, Json(reading_view(&reading))).into_response())
}

async fn get_status(State(state): State<AppState>, Path(id): Path<BinId>) -> Result<Response, ApiError> {
    let status = state.bridge.device_status(id).await?;
    let serial = state.bridge.serial_number(id).await?;
    Ok(Json(json!({ "status": status, "serial_number": serial })).into_response())
}

async fn calibrate(State(state): State<AppState>, Path(id): Path<BinId>) -> Result<StatusCode, ApiError> {
    state.bridge.calibrate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn buzzer(State(state): State<AppState>, Path(id): Path<BinId>) -> Result<StatusCode, ApiError> {
    state.bridge.activate_buzzer(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Measurement, Provenance};
    use time::OffsetDateTime;

    #[test]
    fn test_reading_view() {
        let m = Measurement {
            bin_id: 3,
            kind: MeasurementKind::Humidity,
            value: 25.0,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            provenance: Provenance::Simulated,
        };
        let view = reading_view(&CurrentReading::Fetched(m));
        assert_eq!(view.status, "fetched");
        let mv = view.measurement.unwrap();
        assert_eq!(mv.timestamp, "1970-01-01T00:00:00Z");
        assert!(mv.simulated);

        assert!(reading_view(&CurrentReading::Unavailable).measurement.is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: BridgeError| ApiError(e).into_response().status();
        assert_eq!(status(BridgeError::BinNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(BridgeError::InvalidField { field: "latitude", reason: "out of range".into() }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status(BridgeError::DeviceUnavailable(1)), StatusCode::SERVICE_UNAVAILABLE);
    }
}
