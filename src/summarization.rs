use crate::error::AppError;
use crate::openai_types::{
    OpenAIBatchResponse, OpenAIErrorResponse, OpenAIMessage, OpenAIPayload, OpenAIRole,
};

use async_trait::async_trait;
use tracing::{debug, info};

pub const TRANSCRIPTION_PLACEHOLDER: &str = "{transcription}";

pub const DEFAULT_SUMMARY_PROMPT: &str = "Please provide a concise and professional summary of the \
following phone call transcription. Focus on key points, decisions made, and important \
information discussed:

Transcription:
{transcription}

Summary:";

#[derive(Clone, PartialEq, Debug)]
pub struct CallSummary {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, prompt_template: &str)
        -> Result<CallSummary, AppError>;
}

pub fn render_prompt(prompt_template: &str, text: &str) -> String {
    if prompt_template.contains(TRANSCRIPTION_PLACEHOLDER) {
        prompt_template.replace(TRANSCRIPTION_PLACEHOLDER, text)
    } else {
        format!("{prompt_template}\n\n{text}")
    }
}

pub struct OpenAISummarizer {
    http_client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAISummarizer {
    pub fn new(
        http_client: reqwest::Client,
        api_key: String,
        api_base: String,
        model: String,
    ) -> Self {
        Self {
            http_client,
            api_key,
            api_base,
            model,
        }
    }
}

#[async_trait]
impl Summarizer for OpenAISummarizer {
    async fn summarize(
        &self,
        text: &str,
        prompt_template: &str,
    ) -> Result<CallSummary, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::Summarization {
                retryable: false,
                message: "Transcription text is empty".to_string(),
            });
        }
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: OpenAIRole::User,
                content: render_prompt(prompt_template, text),
            }],
            temperature: Some(0.7),
        };
        debug!(model=%self.model, chars=text.len(), "requesting call summary");
        let resp = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::summarization(None, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OpenAIErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(AppError::summarization(Some(status.as_u16()), message));
        }

        let batch: OpenAIBatchResponse = resp
            .json()
            .await
            .map_err(|e| AppError::summarization(None, format!("unreadable response: {e}")))?;
        let choice = batch.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let content = choice
            .map(|c| c.message.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Summarization {
                retryable: true,
                message: "model returned no summary".to_string(),
            })?;
        info!(completion_id=%batch.id, tokens=?batch.usage.map(|u| u.total_tokens), finish_reason=?finish_reason, "call summary generated");
        Ok(CallSummary {
            content,
            model: batch.model,
        })
    }
}
