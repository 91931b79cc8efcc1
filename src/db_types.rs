use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub type CallId = i64;
pub type UserId = i64;

/// Lifecycle of a call as reported by the telephony provider.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Busy => "busy",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::NoAnswer | CallStatus::Busy
        )
    }

    fn rank(&self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            _ => 3,
        }
    }

    /// Whether a provider-reported `next` may replace `self`. Status only moves forward and a
    /// terminal status is final.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "ringing" => Ok(CallStatus::Ringing),
            "in_progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "no_answer" => Ok(CallStatus::NoAnswer),
            "busy" => Ok(CallStatus::Busy),
            other => Err(format!("unknown call status '{other}'")),
        }
    }
}

/// Progress of one post-call processing stage.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    None,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::None => "none",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(StageStatus::None),
            "processing" => Ok(StageStatus::Processing),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(format!("unknown stage status '{other}'")),
        }
    }
}

/// The post-call stages, in execution order.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Transcription,
    Summary,
}

impl Stage {
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Transcription),
            Stage::Transcription => Some(Stage::Summary),
            Stage::Summary => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Stage::Download => "download",
            Stage::Transcription => "transcription",
            Stage::Summary => "summary",
        };
        f.write_str(label)
    }
}

/// Where a call sits in post-call processing. Derived from the record, never stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipelineState {
    NeedsDownload,
    NeedsTranscription,
    NeedsSummary,
    Done,
    Failed(Stage),
}

/// Result of a stage, committed to the record by the store.
#[derive(Clone, PartialEq, Debug)]
pub enum StageOutcome {
    Downloaded {
        recording_id: String,
        path: String,
        duration: Option<i32>,
    },
    Transcribed(String),
    Summarized(String),
    Failed { stage: Stage, error: String },
}

impl StageOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutcome::Downloaded { .. } => Stage::Download,
            StageOutcome::Transcribed(_) => Stage::Transcription,
            StageOutcome::Summarized(_) => Stage::Summary,
            StageOutcome::Failed { stage, .. } => *stage,
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct CallRecord {
    pub id: CallId,
    pub user_id: UserId,
    pub lead_id: Option<i64>,
    pub phone_number: String,
    pub provider_call_id: Option<String>,
    pub provider_recording_id: Option<String>,
    pub status: CallStatus,
    pub recording_status: StageStatus,
    pub recording_path: Option<String>,
    pub transcribe_status: StageStatus,
    pub transcribe_content: Option<String>,
    pub summary_status: StageStatus,
    pub summary_content: Option<String>,
    pub pipeline_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration: Option<i32>,
    pub notes: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CallRecord {
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Download => self.recording_status,
            Stage::Transcription => self.transcribe_status,
            Stage::Summary => self.summary_status,
        }
    }

    pub fn pipeline_state(&self) -> PipelineState {
        for stage in [Stage::Download, Stage::Transcription, Stage::Summary] {
            match self.stage_status(stage) {
                StageStatus::Completed => continue,
                StageStatus::Failed => return PipelineState::Failed(stage),
                StageStatus::None | StageStatus::Processing => {
                    return match stage {
                        Stage::Download => PipelineState::NeedsDownload,
                        Stage::Transcription => PipelineState::NeedsTranscription,
                        Stage::Summary => PipelineState::NeedsSummary,
                    }
                }
            }
        }
        PipelineState::Done
    }

    /// Whether the inputs `stage` works from are in place: a finished call for the download, a
    /// stored recording for the transcription, a transcript for the summary.
    pub fn stage_ready(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => self.status.is_terminal(),
            Stage::Transcription => {
                self.recording_status == StageStatus::Completed && self.recording_path.is_some()
            }
            Stage::Summary => self.transcribe_status == StageStatus::Completed,
        }
    }

    /// Whether `stage` may move to `processing`. A stage already being processed can't be
    /// entered twice. The in-memory store applies this directly; `PgCallStore` renders the
    /// same rule as SQL.
    #[cfg(test)]
    pub fn can_begin(&self, stage: Stage) -> bool {
        self.stage_status(stage) != StageStatus::Processing && self.stage_ready(stage)
    }

    /// "MM:SS", the way the call list displays durations.
    pub fn duration_formatted(&self) -> String {
        let secs = self.duration.unwrap_or(0).max(0);
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct Lead {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub created_by: UserId,
}

#[derive(Clone, Debug)]
pub struct NewCall {
    pub user_id: UserId,
    pub lead_id: Option<i64>,
    pub phone_number: String,
}

#[cfg(test)]
pub(crate) fn sample_record(id: CallId) -> CallRecord {
    let now = OffsetDateTime::now_utc();
    CallRecord {
        id,
        user_id: 1,
        lead_id: None,
        phone_number: "+15550100".to_string(),
        provider_call_id: Some(format!("CA{id}")),
        provider_recording_id: None,
        status: CallStatus::Initiated,
        recording_status: StageStatus::None,
        recording_path: None,
        transcribe_status: StageStatus::None,
        transcribe_content: None,
        summary_status: StageStatus::None,
        summary_content: None,
        pipeline_error: None,
        start_time: now,
        end_time: None,
        duration: None,
        notes: String::new(),
        created_at: now,
        updated_at: now,
    }
}
