//! Contains the data models for API requests and responses.

use crate::gcode::ParseError;
use crate::job::ProgramHandle;
use axum::http::StatusCode;
use axum::Json;
use modax_shared::{CommandKind, CommandOrigin};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    pub id: String,
    /// `host:port` or `loopback`; omitted for telemetry-only devices.
    pub address: Option<String>,
}

#[derive(Deserialize)]
pub struct SubmitProgramRequest {
    pub program: String,
}

/// A command as posted by an operator: `{"kind": "feed_hold", "origin": "operator"}`.
#[derive(Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub origin: CommandOrigin,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Serialize)]
pub struct SubmitProgramResponse {
    pub handle: ProgramHandle,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LineError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl From<&ParseError> for LineError {
    fn from(e: &ParseError) -> Self {
        Self { line: e.line, column: e.column, message: e.kind.to_string() }
    }
}

#[derive(Serialize)]
pub struct ParseErrorsResponse {
    pub errors: Vec<LineError>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct MacroListResponse {
    pub subprograms: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct MacroBody {
    pub body: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn json_error(status: StatusCode, message: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: message.to_string() }))
}
