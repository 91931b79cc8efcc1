use crate::db_types::{CallId, CallRecord, CallStatus, NewCall, UserId};
use crate::error::AppError;
use crate::pipeline::{Enqueued, Entry};
use crate::twilio_types::{
    parse_duration, wrap_twiml, PauseAction, RecordingCallbackPayload, RecordingStatus, Response,
    ResponseAction, SayAction, StatusCallbackPayload,
};
use crate::types::{
    Actor, AppState, CallView, EndCallRequest, Envelope, InitiateCallRequest, NotesRequest,
    TriggerAccepted, ACTOR_HEADER,
};

use axum::{
    body::StreamBody,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, trace, warn};

const MAX_PHONE_NUMBER_LEN: usize = 20;

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/calls/history", get(call_history))
        .route("/calls/initiate", post(initiate_call))
        .route("/calls/:id", get(call_detail).delete(delete_call))
        .route("/calls/:id/end", post(end_call))
        .route("/calls/:id/notes", patch(update_notes))
        .route("/calls/:id/status", get(call_status))
        .route("/calls/:id/download-recording", post(download_recording))
        .route("/calls/:id/transcribe", post(transcribe_recording))
        .route("/calls/:id/summarize", post(summarize_call))
        .route("/calls/:id/audio", get(serve_audio))
        .route("/twilio/status", post(twilio_status_callback))
        .route("/twilio/recording", post(twilio_recording_callback))
        .route("/twilio/twiml/voice", post(twiml_voice))
        .route("/", get(|| async { "Hello, World!" }))
        .with_state(state)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AppError::Validation(e.to_string()))
}

async fn owned_call(state: &AppState, id: CallId, owner: UserId) -> Result<CallRecord, AppError> {
    state
        .store
        .get_call_for_owner(id, owner)
        .await?
        .ok_or_else(|| AppError::NotFound("Call not found".to_string()))
}

async fn fresh_view(state: &AppState, id: CallId) -> Result<CallView, AppError> {
    state
        .store
        .get_call(id)
        .await?
        .map(CallView::from)
        .ok_or_else(|| AppError::NotFound("Call not found".to_string()))
}

/// Failures here are logged; the pipeline records its own outcome on the call.
async fn enqueue_pipeline(state: &AppState, call_id: CallId) {
    match state.orchestrator.trigger(call_id, Entry::Full).await {
        Ok(queued) => debug!(call_id, ?queued, "post-call pipeline requested"),
        Err(e) => error!(call_id, error=%e, "could not queue post-call pipeline"),
    }
}

pub async fn call_history(
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<Vec<CallView>>, AppError> {
    let calls = state.store.list_calls_for_owner(user).await?;
    Ok(Envelope::success(
        StatusCode::OK,
        calls.into_iter().map(CallView::from).collect(),
    ))
}

pub async fn initiate_call(
    State(state): State<SharedState>,
    Actor(user): Actor,
    payload: Result<Json<InitiateCallRequest>, JsonRejection>,
) -> Result<Envelope<CallView>, AppError> {
    let request = json_body(payload)?;
    let phone_number = request.phone_number.trim().to_string();
    if phone_number.is_empty() {
        return Err(AppError::Validation("Phone number is required.".to_string()));
    }
    if phone_number.len() > MAX_PHONE_NUMBER_LEN {
        return Err(AppError::Validation(format!(
            "Phone number must be at most {MAX_PHONE_NUMBER_LEN} characters."
        )));
    }
    if let Some(lead_id) = request.lead_id {
        if state.store.lead_for_owner(lead_id, user).await?.is_none() {
            return Err(AppError::NotFound("Lead not found".to_string()));
        }
    }

    let call = state
        .store
        .create_call(NewCall {
            user_id: user,
            lead_id: request.lead_id,
            phone_number: phone_number.clone(),
        })
        .await?;
    info!(call_id = call.id, user_id = user, "initiating call");

    match state.gateway.dial(&phone_number, None).await {
        Ok(dialed) => {
            state
                .store
                .set_provider_call(call.id, &dialed.provider_call_id, CallStatus::Ringing)
                .await?;
            Ok(Envelope::success(
                StatusCode::CREATED,
                fresh_view(&state, call.id).await?,
            ))
        }
        Err(e) => {
            warn!(call_id = call.id, error=%e, "dial failed");
            state
                .store
                .update_status(call.id, CallStatus::Failed, None)
                .await?;
            Err(e)
        }
    }
}

pub async fn call_detail(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<CallView>, AppError> {
    let call = owned_call(&state, id, user).await?;
    Ok(Envelope::success(StatusCode::OK, call.into()))
}

pub async fn delete_call(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<serde_json::Value>, AppError> {
    owned_call(&state, id, user).await?;
    if !state.store.delete_call(id).await? {
        return Err(AppError::NotFound("Call not found".to_string()));
    }
    info!(call_id = id, "call deleted");
    Ok(Envelope::success(
        StatusCode::OK,
        serde_json::json!({ "id": id, "deleted": true }),
    ))
}

pub async fn end_call(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
    payload: Result<Json<EndCallRequest>, JsonRejection>,
) -> Result<Envelope<CallView>, AppError> {
    let request = json_body(payload)?;
    if request.duration < 0 {
        return Err(AppError::Validation(
            "duration must be zero or more seconds".to_string(),
        ));
    }
    let call = owned_call(&state, id, user).await?;
    if let Some(sid) = call.provider_call_id.as_deref() {
        // The local record is closed either way; the provider hangs up on its own eventually.
        if let Err(e) = state.gateway.terminate(sid).await {
            warn!(call_id = id, call_sid=%sid, error=%e, "provider hang-up failed");
        }
    }
    let call = state
        .store
        .end_call(id, request.duration, request.notes)
        .await?;
    info!(call_id = id, duration = request.duration, "call ended");
    enqueue_pipeline(&state, id).await;
    Ok(Envelope::success(StatusCode::OK, call.into()))
}

pub async fn update_notes(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
    payload: Result<Json<NotesRequest>, JsonRejection>,
) -> Result<Envelope<CallView>, AppError> {
    let request = json_body(payload)?;
    owned_call(&state, id, user).await?;
    state.store.update_notes(id, &request.notes).await?;
    Ok(Envelope::success(
        StatusCode::OK,
        fresh_view(&state, id).await?,
    ))
}

/// Refreshes the call from the provider.
pub async fn call_status(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<CallView>, AppError> {
    let call = owned_call(&state, id, user).await?;
    let Some(sid) = call.provider_call_id.as_deref() else {
        return Ok(Envelope::success(StatusCode::OK, call.into()));
    };
    let provider = state.gateway.fetch_status(sid).await?;
    let changed = state
        .store
        .update_status(id, provider.status, provider.duration)
        .await?;
    debug!(call_id = id, status=%provider.status, changed, "refreshed call status");
    let view = fresh_view(&state, id).await?;
    if view.call.status.is_terminal() {
        enqueue_pipeline(&state, id).await;
    }
    Ok(Envelope::success(StatusCode::OK, view))
}

async fn trigger(
    state: &AppState,
    id: CallId,
    user: UserId,
    entry: Entry,
    message: &'static str,
) -> Result<Envelope<TriggerAccepted>, AppError> {
    owned_call(state, id, user).await?;
    let queued = state.orchestrator.trigger(id, entry).await?;
    Ok(Envelope::success(
        StatusCode::ACCEPTED,
        TriggerAccepted {
            call_id: id,
            message,
            already_running: queued == Enqueued::AlreadyRunning,
        },
    ))
}

pub async fn download_recording(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<TriggerAccepted>, AppError> {
    trigger(&state, id, user, Entry::Download, "Recording download started").await
}

pub async fn transcribe_recording(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<TriggerAccepted>, AppError> {
    trigger(&state, id, user, Entry::Transcribe, "Transcription started").await
}

pub async fn summarize_call(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<Envelope<TriggerAccepted>, AppError> {
    trigger(&state, id, user, Entry::Summarize, "Summary generation started").await
}

pub async fn serve_audio(
    Path(id): Path<CallId>,
    State(state): State<SharedState>,
    Actor(user): Actor,
) -> Result<impl IntoResponse, AppError> {
    let call = owned_call(&state, id, user).await?;
    let path = call
        .recording_path
        .ok_or_else(|| AppError::NotFound("No recording file found for this call".to_string()))?;
    let file = state.recordings.open(&path).await?;
    let len = file.metadata().await?.len();

    let headers = [
        (header::CONTENT_TYPE, "audio/mpeg".to_string()),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"call_{id}.mp3\""),
        ),
        (header::CACHE_CONTROL, "no-cache".to_string()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
        // Played straight from the browser's <audio> element.
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET".to_string()),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            format!("Authorization, Content-Type, {ACTOR_HEADER}"),
        ),
    ];
    Ok((headers, StreamBody::new(ReaderStream::new(file))))
}

pub async fn twilio_status_callback(
    State(state): State<SharedState>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "status callback body");
    let payload = match serde_urlencoded::from_str::<StatusCallbackPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio status callback");
            return (StatusCode::BAD_REQUEST, "Bad request");
        }
    };
    let result = async {
        let Some(call) = state.store.get_call_by_provider_id(&payload.call_sid).await? else {
            warn!(
                call_sid=%payload.call_sid,
                from=?payload.from,
                to=?payload.to,
                "status callback for unknown call"
            );
            return Ok::<_, AppError>(());
        };
        let status = CallStatus::from(payload.call_status);
        let duration = parse_duration(payload.call_duration.as_deref());
        let changed = state.store.update_status(call.id, status, duration).await?;
        debug!(call_id = call.id, account_sid=%payload.account_sid, %status, changed, "status callback applied");
        if status.is_terminal() {
            enqueue_pipeline(&state, call.id).await;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => (StatusCode::NO_CONTENT, ""),
        Err(e) => {
            error!(call_sid=%payload.call_sid, error=%e, "status callback failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

pub async fn twilio_recording_callback(
    State(state): State<SharedState>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "recording callback body");
    let payload = match serde_urlencoded::from_str::<RecordingCallbackPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio recording callback");
            return (StatusCode::BAD_REQUEST, "Bad request");
        }
    };
    if payload.recording_status != RecordingStatus::Completed {
        debug!(recording_sid=%payload.recording_sid, status=?payload.recording_status, "recording not ready");
        return (StatusCode::NO_CONTENT, "");
    }
    match state.store.get_call_by_provider_id(&payload.call_sid).await {
        Ok(Some(call)) => {
            info!(
                call_id = call.id,
                account_sid=%payload.account_sid,
                recording_sid=%payload.recording_sid,
                secs=?parse_duration(payload.recording_duration.as_deref()),
                "recording ready"
            );
            enqueue_pipeline(&state, call.id).await;
            (StatusCode::NO_CONTENT, "")
        }
        Ok(None) => {
            warn!(call_sid=%payload.call_sid, "recording callback for unknown call");
            (StatusCode::NO_CONTENT, "")
        }
        Err(e) => {
            error!(call_sid=%payload.call_sid, error=%e, "recording callback failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// TwiML played once the callee answers.
pub async fn twiml_voice(State(state): State<SharedState>) -> impl IntoResponse {
    let response = Response {
        actions: vec![
            ResponseAction::Say(SayAction {
                text: state.greeting.clone(),
                ..Default::default()
            }),
            ResponseAction::Pause(PauseAction { length: Some(1) }),
        ],
    };
    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}
