//! Defines the Axum API routes and handlers.

use crate::coordinator::device::DeviceStatus;
use crate::coordinator::{CoordinatorError, DeviceCoordinator, SubmitError};
use crate::gcode::MacroError;
use crate::web::models::{
    json_error, ApiError, CancelResponse, CommandRequest, LineError, MacroBody, MacroListResponse,
    ParseErrorsResponse, RegisterDeviceRequest, SubmitProgramRequest, SubmitProgramResponse,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use modax_shared::{CommandResult, ControlCommand};

pub type AppState = DeviceCoordinator;

/// Creates the Axum router with all the API endpoints.
pub fn create_router(coordinator: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices).post(register_device))
        .route("/api/v1/devices/{id}", axum::routing::delete(deregister_device))
        .route("/api/v1/devices/{id}/status", get(device_status))
        .route("/api/v1/devices/{id}/programs", post(submit_program).delete(cancel_program))
        .route("/api/v1/devices/{id}/commands", post(execute_command))
        .route("/api/v1/macros", get(list_macros))
        .route("/api/v1/macros/{number}", put(define_macro).get(get_macro).delete(delete_macro))
        .with_state(coordinator)
}

fn coordinator_error(e: CoordinatorError) -> ApiError {
    let status = match e {
        CoordinatorError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        CoordinatorError::AlreadyRegistered(_) | CoordinatorError::Busy(_) => StatusCode::CONFLICT,
        CoordinatorError::WorkerGone(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_error(status, e)
}

/// Handler to get the statuses of all devices.
async fn list_devices(State(coordinator): State<AppState>) -> Json<Vec<DeviceStatus>> {
    Json(coordinator.statuses().await)
}

async fn register_device(
    State(coordinator): State<AppState>,
    Json(payload): Json<RegisterDeviceRequest>,
) -> Result<StatusCode, ApiError> {
    coordinator
        .register(&payload.id, payload.address.as_deref())
        .await
        .map_err(coordinator_error)?;
    Ok(StatusCode::CREATED)
}

async fn deregister_device(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    coordinator.deregister(&id).await.map_err(coordinator_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler to get the current status of one device.
async fn device_status(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceStatus>, ApiError> {
    coordinator.status(&id).await.map(Json).map_err(coordinator_error)
}

/// Handler to submit a program. Rejected programs answer 422 with every line-numbered error.
async fn submit_program(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitProgramRequest>,
) -> Response {
    match coordinator.submit_program(&id, &payload.program).await {
        Ok(handle) => {
            (StatusCode::ACCEPTED, Json(SubmitProgramResponse { handle })).into_response()
        }
        Err(SubmitError::Parse(errors)) => {
            let errors = errors.iter().map(LineError::from).collect();
            (StatusCode::UNPROCESSABLE_ENTITY, Json(ParseErrorsResponse { errors })).into_response()
        }
        Err(e @ SubmitError::UnknownDevice(_)) => {
            json_error(StatusCode::NOT_FOUND, e).into_response()
        }
        Err(e @ SubmitError::Busy(_)) => json_error(StatusCode::CONFLICT, e).into_response(),
        Err(SubmitError::Unavailable(e)) => coordinator_error(e).into_response(),
    }
}

async fn cancel_program(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = coordinator.cancel_program(&id).await.map_err(coordinator_error)?;
    Ok(Json(CancelResponse { cancelled }))
}

/// Handler to execute a single command. Blocked and failed commands are still 200: the
/// outcome is in the body.
async fn execute_command(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CommandRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    if !coordinator.device_ids().await.contains(&id) {
        return Err(coordinator_error(CoordinatorError::UnknownDevice(id)));
    }
    let command = ControlCommand::new(id, payload.origin, payload.kind);
    Ok(Json(coordinator.execute(command).await))
}

fn macro_error(e: MacroError) -> ApiError {
    match e {
        MacroError::NotFound(_) => json_error(StatusCode::NOT_FOUND, e),
        MacroError::Invalid { .. } => json_error(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

async fn list_macros(State(coordinator): State<AppState>) -> Json<MacroListResponse> {
    Json(MacroListResponse { subprograms: coordinator.macros().list().await })
}

async fn define_macro(
    State(coordinator): State<AppState>,
    Path(number): Path<u32>,
    Json(payload): Json<MacroBody>,
) -> Result<StatusCode, ApiError> {
    coordinator.macros().define(number, &payload.body).await.map_err(macro_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_macro(
    State(coordinator): State<AppState>,
    Path(number): Path<u32>,
) -> Result<Json<MacroBody>, ApiError> {
    let body = coordinator.macros().get(number).await.map_err(macro_error)?;
    Ok(Json(MacroBody { body }))
}

async fn delete_macro(
    State(coordinator): State<AppState>,
    Path(number): Path<u32>,
) -> Result<StatusCode, ApiError> {
    coordinator.macros().delete(number).await.map_err(macro_error)?;
    Ok(StatusCode::NO_CONTENT)
}
