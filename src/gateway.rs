use crate::config::TwilioConfig;
use crate::db_types::CallStatus;
use crate::error::AppError;
use crate::twilio_types::{
    parse_duration, CallResource, RecordingList, RecordingStatus, TwilioErrorBody,
};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Clone, PartialEq, Debug)]
pub struct DialResult {
    pub provider_call_id: String,
    pub status: CallStatus,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ProviderCallState {
    pub status: CallStatus,
    pub duration: Option<i32>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct RecordingInfo {
    pub recording_id: String,
    pub duration: Option<i32>,
    pub status: RecordingStatus,
    pub created_at: String,
}

/// Outbound telephony. Errors carry the provider's HTTP status so callers can tell a rejected
/// request from a flaky network.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    async fn dial(&self, to: &str, from: Option<&str>) -> Result<DialResult, AppError>;

    async fn fetch_status(&self, provider_call_id: &str) -> Result<ProviderCallState, AppError>;

    /// Succeeds for a call that has already ended.
    async fn terminate(&self, provider_call_id: &str) -> Result<CallStatus, AppError>;

    async fn list_recordings(&self, provider_call_id: &str)
        -> Result<Vec<RecordingInfo>, AppError>;

    async fn download_recording(&self, recording_id: &str) -> Result<Vec<u8>, AppError>;
}

pub struct TwilioGateway {
    http_client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioGateway {
    pub fn new(http_client: reqwest::Client, config: TwilioConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{path}",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
    }

    async fn send(&self, rb: RequestBuilder) -> Result<reqwest::Response, AppError> {
        let resp = self.authed(rb).send().await.map_err(|e| {
            warn!(error=%e, "twilio request did not complete");
            AppError::gateway(None, e.to_string())
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<TwilioErrorBody>(&body)
            .map(|e| match e.code {
                Some(code) => format!("{} (code {code})", e.message),
                None => e.message,
            })
            .unwrap_or(body);
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(message));
        }
        Err(AppError::gateway(Some(status.as_u16()), message))
    }

    async fn json<T: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<T, AppError> {
        self.send(rb)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AppError::gateway(None, format!("unreadable twilio response: {e}")))
    }
}

#[async_trait]
impl TelephonyGateway for TwilioGateway {
    async fn dial(&self, to: &str, from: Option<&str>) -> Result<DialResult, AppError> {
        let mut form = HashMap::new();
        form.insert("To", to.to_string());
        form.insert(
            "From",
            from.unwrap_or(&self.config.phone_number).to_string(),
        );
        form.insert("Url", self.config.voice_url.clone());
        form.insert("Record", "true".to_string());
        if let Some(base) = &self.config.public_base_url {
            form.insert("StatusCallback", format!("{base}/twilio/status"));
            form.insert("RecordingStatusCallback", format!("{base}/twilio/recording"));
        }
        let call: CallResource = self
            .json(self.http_client.post(self.account_url("Calls.json")).form(&form))
            .await?;
        info!(call_sid=%call.sid, status=?call.status, "call initiated with recording");
        Ok(DialResult {
            provider_call_id: call.sid,
            status: call.status.into(),
        })
    }

    async fn fetch_status(&self, provider_call_id: &str) -> Result<ProviderCallState, AppError> {
        let url = self.account_url(&format!("Calls/{provider_call_id}.json"));
        let call: CallResource = self.json(self.http_client.get(url)).await?;
        Ok(ProviderCallState {
            status: call.status.into(),
            duration: parse_duration(call.duration.as_deref()),
        })
    }

    async fn terminate(&self, provider_call_id: &str) -> Result<CallStatus, AppError> {
        let url = self.account_url(&format!("Calls/{provider_call_id}.json"));
        let mut form = HashMap::new();
        form.insert("Status", "completed");
        match self
            .json::<CallResource>(self.http_client.post(url).form(&form))
            .await
        {
            Ok(call) => Ok(call.status.into()),
            // Twilio refuses to update a call that is no longer in progress.
            Err(AppError::Gateway {
                status: Some(code),
                message,
            }) if (400..500).contains(&code) => {
                let state = self.fetch_status(provider_call_id).await?;
                if state.status.is_terminal() {
                    debug!(call_sid=%provider_call_id, status=%state.status, "call already ended");
                    Ok(state.status)
                } else {
                    Err(AppError::gateway(Some(code), message))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn list_recordings(
        &self,
        provider_call_id: &str,
    ) -> Result<Vec<RecordingInfo>, AppError> {
        let url = self.account_url(&format!("Calls/{provider_call_id}/Recordings.json"));
        let list: RecordingList = self.json(self.http_client.get(url)).await?;
        Ok(list
            .recordings
            .into_iter()
            .map(|r| RecordingInfo {
                duration: parse_duration(r.duration.as_deref()),
                recording_id: r.sid,
                status: r.status,
                created_at: r.date_created,
            })
            .collect())
    }

    async fn download_recording(&self, recording_id: &str) -> Result<Vec<u8>, AppError> {
        let url = self.account_url(&format!("Recordings/{recording_id}.mp3"));
        let bytes = self
            .send(self.http_client.get(url))
            .await?
            .bytes()
            .await
            .map_err(|e| AppError::gateway(None, format!("recording download interrupted: {e}")))?;
        debug!(recording_sid=%recording_id, bytes=bytes.len(), "downloaded recording");
        Ok(bytes.to_vec())
    }
}
