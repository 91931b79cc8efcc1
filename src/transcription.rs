use crate::deepgram_types::PrerecordedResponse;
use crate::error::AppError;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

/// Speech-to-text for a finished recording.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AppError>;
}

fn transport_error(e: reqwest::Error) -> AppError {
    AppError::Transcription {
        retryable: true,
        message: e.to_string(),
    }
}

fn reject_empty(audio: &[u8]) -> Result<(), AppError> {
    if audio.is_empty() {
        return Err(AppError::Transcription {
            retryable: false,
            message: "Audio file is empty".to_string(),
        });
    }
    Ok(())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AppError::transcription(
        Some(status.as_u16()),
        format!("HTTP {status}: {body}"),
    ))
}

/// OpenAI Whisper (`audio/transcriptions`).
pub struct WhisperTranscriber {
    http_client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(http_client: reqwest::Client, api_key: String, api_base: String) -> Self {
        Self {
            http_client,
            api_key,
            api_base,
            model: "whisper-1".to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AppError> {
        reject_empty(audio)?;
        let part = Part::bytes(audio.to_vec())
            .file_name("recording.mp3")
            .mime_str("audio/mpeg")
            .map_err(transport_error)?;
        let form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        debug!(bytes = audio.len(), model=%self.model, "sending recording to whisper");
        let resp = self
            .http_client
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let text = check_status(resp)
            .await?
            .text()
            .await
            .map_err(transport_error)?;
        info!(chars = text.len(), "whisper transcription completed");
        Ok(text.trim().to_string())
    }
}

/// Deepgram prerecorded transcription (`/v1/listen`).
pub struct DeepgramTranscriber {
    http_client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl DeepgramTranscriber {
    pub fn new(http_client: reqwest::Client, api_key: String, api_base: String) -> Self {
        Self {
            http_client,
            api_key,
            api_base,
        }
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AppError> {
        reject_empty(audio)?;
        let uri = format!(
            "{}/v1/listen\
             ?punctuate=true\
             &smart_format=true",
            self.api_base
        );
        let resp = self
            .http_client
            .post(uri)
            .header(
                http::header::AUTHORIZATION,
                format!("Token {}", self.api_key),
            )
            .header(http::header::CONTENT_TYPE, "audio/mpeg")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: PrerecordedResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| AppError::Transcription {
                retryable: false,
                message: format!("unreadable deepgram response: {e}"),
            })?;
        info!(
            request_id=%parsed.metadata.request_id,
            audio_secs = parsed.metadata.duration,
            confidence = ?parsed.confidence(),
            "deepgram transcription completed"
        );
        Ok(parsed.transcript())
    }
}
