use crate::db_types::{CallId, CallRecord, UserId};
use crate::error::AppError;
use crate::gateway::TelephonyGateway;
use crate::pipeline::Orchestrator;
use crate::recording_store::RecordingStore;
use crate::store::CallStore;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the id of the user the upstream proxy authenticated.
pub const ACTOR_HEADER: &str = "x-user-id";

pub struct AppState {
    pub store: Arc<dyn CallStore>,
    pub gateway: Arc<dyn TelephonyGateway>,
    pub recordings: RecordingStore,
    pub orchestrator: Orchestrator,
    /// Spoken to the callee once the call is answered.
    pub greeting: String,
}

/// Every JSON body this service returns.
#[derive(Serialize, Debug)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Success { status_code: u16, data: T },
    Error { status_code: u16, message: String },
}

impl<T> Envelope<T> {
    pub fn success(status: StatusCode, data: T) -> Self {
        Envelope::Success {
            status_code: status.as_u16(),
            data,
        }
    }

    pub fn error(status: StatusCode, message: String) -> Self {
        Envelope::Error {
            status_code: status.as_u16(),
            message,
        }
    }

    fn status(&self) -> StatusCode {
        let code = match self {
            Envelope::Success { status_code, .. } | Envelope::Error { status_code, .. } => {
                *status_code
            }
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// The authenticated caller. Inactive accounts are treated as anonymous.
#[derive(Clone, Copy, Debug)]
pub struct Actor(pub UserId);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .ok_or(AppError::Unauthorized)?;
        if !state.store.owner_is_active(user_id).await? {
            return Err(AppError::Unauthorized);
        }
        Ok(Actor(user_id))
    }
}

#[derive(Serialize, Debug)]
pub struct CallView {
    #[serde(flatten)]
    pub call: CallRecord,
    pub duration_formatted: String,
}

impl From<CallRecord> for CallView {
    fn from(call: CallRecord) -> Self {
        let duration_formatted = call.duration_formatted();
        Self {
            call,
            duration_formatted,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct TriggerAccepted {
    pub call_id: CallId,
    pub message: &'static str,
    /// True when the call already had a job running and this request joined it.
    pub already_running: bool,
}

#[derive(Deserialize, Debug)]
pub struct InitiateCallRequest {
    pub phone_number: String,
    #[serde(default)]
    pub lead_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
pub struct EndCallRequest {
    pub duration: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct NotesRequest {
    #[serde(default)]
    pub notes: String,
}
