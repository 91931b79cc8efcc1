use crate::error::AppError;

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_DEEPGRAM_API_BASE: &str = "https://api.deepgram.com";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TranscriptionProvider {
    Whisper,
    Deepgram,
}

impl FromStr for TranscriptionProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(TranscriptionProvider::Whisper),
            "deepgram" => Ok(TranscriptionProvider::Deepgram),
            other => Err(format!("unknown transcription provider '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
    pub voice_url: String,
    pub api_base: String,
    /// Externally reachable base URL of this service; when set, Twilio is asked to post status
    /// and recording callbacks to it.
    pub public_base_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a terminal call may go without a listed recording before the download stage
    /// gives up.
    pub recording_wait: Duration,
    pub vendor_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            base_backoff: Duration::from_millis(2_000),
            max_backoff: Duration::from_millis(60_000),
            recording_wait: Duration::from_secs(600),
            vendor_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub twilio: TwilioConfig,
    pub openai_api_key: String,
    pub deepgram_api_key: Option<String>,
    pub transcription_provider: TranscriptionProvider,
    pub summary_model: String,
    pub recordings_dir: PathBuf,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, AppError> {
        let vars = Vars(vars);
        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            workers: vars.parse_or("PIPELINE_WORKERS", defaults.workers)?,
            max_attempts: vars.parse_or("PIPELINE_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_backoff: Duration::from_millis(vars.parse_or("PIPELINE_BACKOFF_MS", 2_000)?),
            max_backoff: Duration::from_millis(vars.parse_or("PIPELINE_MAX_BACKOFF_MS", 60_000)?),
            recording_wait: Duration::from_secs(vars.parse_or("RECORDING_WAIT_SECS", 600)?),
            vendor_timeout: Duration::from_secs(vars.parse_or("VENDOR_TIMEOUT_SECS", 120)?),
        };
        if pipeline.workers == 0 || pipeline.max_attempts == 0 {
            return Err(AppError::Config(
                "PIPELINE_WORKERS and PIPELINE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let transcription_provider =
            vars.parse_or("TRANSCRIPTION_PROVIDER", TranscriptionProvider::Whisper)?;
        let deepgram_api_key = vars.optional("DEEPGRAM_API_KEY");
        if transcription_provider == TranscriptionProvider::Deepgram && deepgram_api_key.is_none()
        {
            return Err(AppError::Config(
                "DEEPGRAM_API_KEY not set but TRANSCRIPTION_PROVIDER=deepgram".to_string(),
            ));
        }

        Ok(Config {
            bind_addr: vars.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            database_url: vars.required("DATABASE_URL")?,
            twilio: TwilioConfig {
                account_sid: vars.required("TWILIO_ACCOUNT_SID")?,
                auth_token: vars.required("TWILIO_AUTH_TOKEN")?,
                phone_number: vars.required("TWILIO_PHONE_NUMBER")?,
                voice_url: vars.required("TWILIO_VOICE_URL")?,
                api_base: vars
                    .optional("TWILIO_API_BASE")
                    .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
                public_base_url: vars
                    .optional("PUBLIC_BASE_URL")
                    .map(|u| u.trim_end_matches('/').to_string()),
            },
            openai_api_key: vars.required("OPENAI_API_KEY")?,
            deepgram_api_key,
            transcription_provider,
            summary_model: vars
                .optional("SUMMARY_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            recordings_dir: vars
                .optional("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            pipeline,
        })
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn optional(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, AppError> {
        self.optional(key)
            .ok_or_else(|| AppError::Config(format!("{key} not set")))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| AppError::Config(format!("{key}='{raw}': {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        [
            ("DATABASE_URL", "postgres://localhost/outreach"),
            ("TWILIO_ACCOUNT_SID", "test-sid"),
            ("TWILIO_AUTH_TOKEN", "test-token"),
            ("TWILIO_PHONE_NUMBER", "+1234567890"),
            ("TWILIO_VOICE_URL", "https://example.com/twilio/twiml/voice"),
            ("OPENAI_API_KEY", "test-key"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_vars(base_vars()).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.transcription_provider, TranscriptionProvider::Whisper);
        assert_eq!(config.summary_model, "gpt-4o-mini");
        assert_eq!(config.recordings_dir, PathBuf::from("recordings"));
        assert_eq!(config.pipeline.max_attempts, 5);
        assert_eq!(config.twilio.api_base, DEFAULT_TWILIO_API_BASE);
        assert!(config.twilio.public_base_url.is_none());
    }

    #[test]
    fn missing_required_key_is_named() {
        let mut vars = base_vars();
        vars.remove("TWILIO_AUTH_TOKEN");
        let err = Config::from_vars(vars).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: TWILIO_AUTH_TOKEN not set");
    }

    #[test]
    fn deepgram_requires_its_key() {
        let mut vars = base_vars();
        vars.insert("TRANSCRIPTION_PROVIDER".into(), "deepgram".into());
        assert!(Config::from_vars(vars.clone()).is_err());
        vars.insert("DEEPGRAM_API_KEY".into(), "dg-key".into());
        let config = Config::from_vars(vars).unwrap();
        assert_eq!(config.transcription_provider, TranscriptionProvider::Deepgram);
    }

    #[test]
    fn pipeline_tuning_parses() {
        let mut vars = base_vars();
        vars.insert("PIPELINE_WORKERS".into(), "8".into());
        vars.insert("PIPELINE_BACKOFF_MS".into(), "250".into());
        vars.insert("PUBLIC_BASE_URL".into(), "https://calls.example.com/".into());
        let config = Config::from_vars(vars).unwrap();
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.base_backoff, Duration::from_millis(250));
        assert_eq!(
            config.twilio.public_base_url.as_deref(),
            Some("https://calls.example.com")
        );

        let mut vars = base_vars();
        vars.insert("PIPELINE_WORKERS".into(), "many".into());
        assert!(Config::from_vars(vars).is_err());
    }
}
