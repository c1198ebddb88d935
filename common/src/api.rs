//! DTOs HTTP entre el master y el host de funciones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Grupo de logs de una función.
pub fn log_group_for(function_name: &str) -> String {
    format!("/ecco/functions/{}", function_name)
}

/* --------- Funciones --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionState {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfiguration {
    pub name: String,
    pub memory_size: u32,
    pub image_ref: String,
    pub last_modified: DateTime<Utc>,
    pub state: FunctionState,
    #[serde(default)]
    pub state_reason: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunctionRequest {
    pub name: String,
    pub memory_size: u32,
    pub image_ref: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFunctionRequest {
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub memory_size: Option<u32>,
}

impl UpdateFunctionRequest {
    pub fn is_empty(&self) -> bool {
        self.image_ref.is_none() && self.memory_size.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub image_ref: String,
    pub last_pushed: DateTime<Utc>,
    #[serde(default)]
    pub digest: Option<String>,
}

/* --------- Logs --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStream {
    pub name: String,
    /// ms desde epoch
    pub last_event_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStreamsResponse {
    pub streams: Vec<LogStream>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub stream: String,
    pub timestamp_ms: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterEventsRequest {
    pub group: String,
    /// Vacío = todos los streams del grupo
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub pattern: String,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterEventsResponse {
    pub events: Vec<LogEvent>,
    #[serde(default)]
    pub next_token: Option<String>,
}
