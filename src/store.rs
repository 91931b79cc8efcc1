use crate::db_types::{
    CallId, CallRecord, CallStatus, Lead, NewCall, Stage, StageOutcome, StageStatus, UserId,
};
use crate::error::AppError;

use async_trait::async_trait;
use sqlx::{FromRow, Pool, Postgres};
use time::OffsetDateTime;

/// Durable call state. Pipeline writes go through `begin_stage`/`finish_stage`, which only apply
/// when the stage is in the expected state, so a stale job can't clobber newer results.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call(&self, new: NewCall) -> Result<CallRecord, AppError>;

    async fn get_call(&self, id: CallId) -> Result<Option<CallRecord>, AppError>;

    async fn get_call_for_owner(
        &self,
        id: CallId,
        owner: UserId,
    ) -> Result<Option<CallRecord>, AppError>;

    async fn get_call_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, AppError>;

    /// Newest first.
    async fn list_calls_for_owner(&self, owner: UserId) -> Result<Vec<CallRecord>, AppError>;

    async fn set_provider_call(
        &self,
        id: CallId,
        provider_call_id: &str,
        status: CallStatus,
    ) -> Result<(), AppError>;

    /// Applies a provider-reported status if it moves the call forward; stamps the end time when
    /// the call turns terminal. Returns whether the status changed.
    async fn update_status(
        &self,
        id: CallId,
        status: CallStatus,
        duration: Option<i32>,
    ) -> Result<bool, AppError>;

    /// Explicit hang-up by the user.
    async fn end_call(
        &self,
        id: CallId,
        duration: i32,
        notes: Option<String>,
    ) -> Result<CallRecord, AppError>;

    async fn update_notes(&self, id: CallId, notes: &str) -> Result<(), AppError>;

    async fn delete_call(&self, id: CallId) -> Result<bool, AppError>;

    /// Moving a stage to `processing` clears every later stage back to `none`.
    async fn begin_stage(&self, id: CallId, stage: Stage) -> Result<bool, AppError>;

    async fn finish_stage(&self, id: CallId, outcome: StageOutcome) -> Result<bool, AppError>;

    /// Marks a stage failed that never reached `processing`, such as a download given up on
    /// while the call was still live. Leaves a stage that is running or completed alone.
    async fn fail_unstarted_stage(
        &self,
        id: CallId,
        stage: Stage,
        error: &str,
    ) -> Result<bool, AppError>;

    /// Crash recovery: stages left `processing` by a dead process go back to `none`.
    async fn reset_in_flight(&self) -> Result<u64, AppError>;

    /// Terminal calls whose pipeline neither finished nor failed.
    async fn list_resumable(&self) -> Result<Vec<CallId>, AppError>;

    async fn lead_for_owner(&self, lead_id: i64, owner: UserId)
        -> Result<Option<Lead>, AppError>;

    async fn owner_is_active(&self, owner: UserId) -> Result<bool, AppError>;
}

const CALL_COLUMNS: &str = "id, user_id, lead_id, phone_number, provider_call_id, \
     provider_recording_id, status, recording_status, recording_path, transcribe_status, \
     transcribe_content, summary_status, summary_content, pipeline_error, start_time, end_time, \
     duration, notes, created_at, updated_at";

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'no_answer', 'busy')";

const STAGES: [Stage; 3] = [Stage::Download, Stage::Transcription, Stage::Summary];

/// A condition on a call row. Stage writes only land on rows meeting all of their guards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Guard {
    CallTerminal,
    HasProviderCall,
    HasRecordingFile,
    StageIs(Stage, StageStatus),
    StageIsNot(Stage, StageStatus),
    /// Some stage has not completed.
    Unfinished,
    /// The first stage that has not completed is not `failed`.
    NotFailed,
}

impl Guard {
    fn sql(&self) -> String {
        match self {
            Guard::CallTerminal => format!("status IN {TERMINAL_STATUSES}"),
            Guard::HasProviderCall => "provider_call_id IS NOT NULL".to_string(),
            Guard::HasRecordingFile => "recording_path IS NOT NULL".to_string(),
            Guard::StageIs(stage, status) => {
                format!("{} = '{}'", status_column(*stage), status.as_str())
            }
            Guard::StageIsNot(stage, status) => {
                format!("{} <> '{}'", status_column(*stage), status.as_str())
            }
            Guard::Unfinished => {
                let done: Vec<String> = STAGES
                    .iter()
                    .map(|s| Guard::StageIs(*s, StageStatus::Completed).sql())
                    .collect();
                format!("NOT ({})", done.join(" AND "))
            }
            Guard::NotFailed => {
                let mut done_before = Vec::new();
                let mut failed_at = Vec::new();
                for stage in STAGES {
                    let mut terms = done_before.clone();
                    terms.push(Guard::StageIs(stage, StageStatus::Failed).sql());
                    failed_at.push(format!("({})", terms.join(" AND ")));
                    done_before.push(Guard::StageIs(stage, StageStatus::Completed).sql());
                }
                format!("NOT ({})", failed_at.join(" OR "))
            }
        }
    }

    #[cfg(test)]
    fn holds(&self, call: &CallRecord) -> bool {
        match self {
            Guard::CallTerminal => call.status.is_terminal(),
            Guard::HasProviderCall => call.provider_call_id.is_some(),
            Guard::HasRecordingFile => call.recording_path.is_some(),
            Guard::StageIs(stage, status) => call.stage_status(*stage) == *status,
            Guard::StageIsNot(stage, status) => call.stage_status(*stage) != *status,
            Guard::Unfinished => STAGES
                .iter()
                .any(|s| call.stage_status(*s) != StageStatus::Completed),
            Guard::NotFailed => !matches!(
                call.pipeline_state(),
                crate::db_types::PipelineState::Failed(_)
            ),
        }
    }
}

fn where_clause(guards: &[Guard]) -> String {
    guards
        .iter()
        .map(Guard::sql)
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn begin_guards(stage: Stage) -> Vec<Guard> {
    let mut guards = vec![Guard::StageIsNot(stage, StageStatus::Processing)];
    match stage {
        Stage::Download => guards.push(Guard::CallTerminal),
        Stage::Transcription => guards.extend([
            Guard::StageIs(Stage::Download, StageStatus::Completed),
            Guard::HasRecordingFile,
        ]),
        Stage::Summary => guards.push(Guard::StageIs(Stage::Transcription, StageStatus::Completed)),
    }
    guards
}

fn finish_guards(stage: Stage) -> Vec<Guard> {
    vec![Guard::StageIs(stage, StageStatus::Processing)]
}

fn fail_unstarted_guards(stage: Stage) -> Vec<Guard> {
    vec![
        Guard::StageIsNot(stage, StageStatus::Processing),
        Guard::StageIsNot(stage, StageStatus::Completed),
    ]
}

/// Terminal calls whose pipeline neither finished nor failed.
fn resumable_guards() -> Vec<Guard> {
    vec![
        Guard::CallTerminal,
        Guard::HasProviderCall,
        Guard::NotFailed,
        Guard::Unfinished,
    ]
}

fn later_stages(stage: Stage) -> impl Iterator<Item = Stage> {
    std::iter::successors(stage.next(), Stage::next)
}

/// `SET` assignments putting every stage after `stage` back to `none`, each ending in ", ".
fn clear_later_stages(stage: Stage) -> String {
    later_stages(stage)
        .map(|later| {
            format!(
                "{} = 'none', {} = NULL, ",
                status_column(later),
                content_column(later)
            )
        })
        .collect()
}

#[derive(FromRow)]
struct CallRow {
    id: i64,
    user_id: i64,
    lead_id: Option<i64>,
    phone_number: String,
    provider_call_id: Option<String>,
    provider_recording_id: Option<String>,
    status: String,
    recording_status: String,
    recording_path: Option<String>,
    transcribe_status: String,
    transcribe_content: Option<String>,
    summary_status: String,
    summary_content: Option<String>,
    pipeline_error: Option<String>,
    start_time: OffsetDateTime,
    end_time: Option<OffsetDateTime>,
    duration: Option<i32>,
    notes: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

fn decode_err(e: String) -> AppError {
    AppError::Database(sqlx::Error::Decode(e.into()))
}

impl TryFrom<CallRow> for CallRecord {
    type Error = AppError;

    fn try_from(row: CallRow) -> Result<Self, Self::Error> {
        Ok(CallRecord {
            id: row.id,
            user_id: row.user_id,
            lead_id: row.lead_id,
            phone_number: row.phone_number,
            provider_call_id: row.provider_call_id,
            provider_recording_id: row.provider_recording_id,
            status: row.status.parse().map_err(decode_err)?,
            recording_status: row.recording_status.parse().map_err(decode_err)?,
            recording_path: row.recording_path,
            transcribe_status: row.transcribe_status.parse().map_err(decode_err)?,
            transcribe_content: row.transcribe_content,
            summary_status: row.summary_status.parse().map_err(decode_err)?,
            summary_content: row.summary_content,
            pipeline_error: row.pipeline_error,
            start_time: row.start_time,
            end_time: row.end_time,
            duration: row.duration,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LeadRow {
    id: i64,
    name: String,
    phone: String,
    email: String,
    created_by: i64,
}

pub struct PgCallStore {
    pool: Pool<Postgres>,
}

impl PgCallStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn create_call(&self, new: NewCall) -> Result<CallRecord, AppError> {
        let sql = format!(
            "INSERT INTO calls (user_id, lead_id, phone_number) VALUES ($1, $2, $3) \
             RETURNING {CALL_COLUMNS}"
        );
        let row = sqlx::query_as::<_, CallRow>(&sql)
            .bind(new.user_id)
            .bind(new.lead_id)
            .bind(&new.phone_number)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_call(&self, id: CallId) -> Result<Option<CallRecord>, AppError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = $1");
        sqlx::query_as::<_, CallRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(CallRecord::try_from)
            .transpose()
    }

    async fn get_call_for_owner(
        &self,
        id: CallId,
        owner: UserId,
    ) -> Result<Option<CallRecord>, AppError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = $1 AND user_id = $2");
        sqlx::query_as::<_, CallRow>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?
            .map(CallRecord::try_from)
            .transpose()
    }

    async fn get_call_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, AppError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE provider_call_id = $1");
        sqlx::query_as::<_, CallRow>(&sql)
            .bind(provider_call_id)
            .fetch_optional(&self.pool)
            .await?
            .map(CallRecord::try_from)
            .transpose()
    }

    async fn list_calls_for_owner(&self, owner: UserId) -> Result<Vec<CallRecord>, AppError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE user_id = $1 ORDER BY start_time DESC, id DESC"
        );
        sqlx::query_as::<_, CallRow>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CallRecord::try_from)
            .collect()
    }

    async fn set_provider_call(
        &self,
        id: CallId,
        provider_call_id: &str,
        status: CallStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE calls SET provider_call_id = $2, status = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(provider_call_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: CallId,
        status: CallStatus,
        duration: Option<i32>,
    ) -> Result<bool, AppError> {
        // Row lock so concurrent callbacks can't both pass the monotonicity check.
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM calls WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut tx)
                .await?;
        let Some((current,)) = current else {
            return Err(AppError::NotFound("Call not found".to_string()));
        };
        let current: CallStatus = current.parse().map_err(decode_err)?;
        let advance = current.can_advance_to(status);
        if advance {
            sqlx::query(
                "UPDATE calls SET status = $2, \
                 end_time = CASE WHEN $3 THEN COALESCE(end_time, now()) ELSE end_time END, \
                 updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(status.is_terminal())
            .execute(&mut tx)
            .await?;
        }
        if let Some(duration) = duration {
            sqlx::query("UPDATE calls SET duration = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(duration)
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await?;
        Ok(advance)
    }

    async fn end_call(
        &self,
        id: CallId,
        duration: i32,
        notes: Option<String>,
    ) -> Result<CallRecord, AppError> {
        let sql = format!(
            "UPDATE calls SET \
             status = CASE WHEN status IN {TERMINAL_STATUSES} THEN status ELSE 'completed' END, \
             end_time = COALESCE(end_time, now()), duration = $2, \
             notes = COALESCE($3, notes), updated_at = now() \
             WHERE id = $1 RETURNING {CALL_COLUMNS}"
        );
        sqlx::query_as::<_, CallRow>(&sql)
            .bind(id)
            .bind(duration)
            .bind(notes)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Call not found".to_string()))?
            .try_into()
    }

    async fn update_notes(&self, id: CallId, notes: &str) -> Result<(), AppError> {
        let res = sqlx::query("UPDATE calls SET notes = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(notes)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::NotFound("Call not found".to_string()));
        }
        Ok(())
    }

    async fn delete_call(&self, id: CallId) -> Result<bool, AppError> {
        let res = sqlx::query("DELETE FROM calls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn begin_stage(&self, id: CallId, stage: Stage) -> Result<bool, AppError> {
        let sql = format!(
            "UPDATE calls SET {} = 'processing', {}updated_at = now() WHERE id = $1 AND {}",
            status_column(stage),
            clear_later_stages(stage),
            where_clause(&begin_guards(stage))
        );
        let res = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(res.rows_affected() == 1)
    }

    async fn finish_stage(&self, id: CallId, outcome: StageOutcome) -> Result<bool, AppError> {
        let guard = where_clause(&finish_guards(outcome.stage()));
        let res = match outcome {
            StageOutcome::Downloaded {
                recording_id,
                path,
                duration,
            } => {
                let sql = format!(
                    "UPDATE calls SET recording_status = 'completed', \
                     provider_recording_id = $2, recording_path = $3, \
                     duration = COALESCE(duration, $4), pipeline_error = NULL, \
                     updated_at = now() WHERE id = $1 AND {guard}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(recording_id)
                    .bind(path)
                    .bind(duration)
                    .execute(&self.pool)
                    .await?
            }
            StageOutcome::Transcribed(text) => {
                let sql = format!(
                    "UPDATE calls SET transcribe_status = 'completed', transcribe_content = $2, \
                     pipeline_error = NULL, updated_at = now() WHERE id = $1 AND {guard}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(text)
                    .execute(&self.pool)
                    .await?
            }
            StageOutcome::Summarized(text) => {
                let sql = format!(
                    "UPDATE calls SET summary_status = 'completed', summary_content = $2, \
                     pipeline_error = NULL, updated_at = now() WHERE id = $1 AND {guard}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(text)
                    .execute(&self.pool)
                    .await?
            }
            StageOutcome::Failed { stage, error } => {
                let column = status_column(stage);
                let sql = format!(
                    "UPDATE calls SET {column} = 'failed', pipeline_error = $2, \
                     updated_at = now() WHERE id = $1 AND {guard}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(format!("{stage}: {error}"))
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(res.rows_affected() == 1)
    }

    async fn fail_unstarted_stage(
        &self,
        id: CallId,
        stage: Stage,
        error: &str,
    ) -> Result<bool, AppError> {
        let sql = format!(
            "UPDATE calls SET {} = 'failed', {}pipeline_error = $2, updated_at = now() \
             WHERE id = $1 AND {}",
            status_column(stage),
            clear_later_stages(stage),
            where_clause(&fail_unstarted_guards(stage))
        );
        let res = sqlx::query(&sql)
            .bind(id)
            .bind(format!("{stage}: {error}"))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn reset_in_flight(&self) -> Result<u64, AppError> {
        let mut reset = 0;
        for stage in STAGES {
            let column = status_column(stage);
            let sql = format!(
                "UPDATE calls SET {column} = 'none', updated_at = now() \
                 WHERE {column} = 'processing'"
            );
            reset += sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        }
        Ok(reset)
    }

    async fn list_resumable(&self) -> Result<Vec<CallId>, AppError> {
        let sql = format!(
            "SELECT id FROM calls WHERE {} ORDER BY id",
            where_clause(&resumable_guards())
        );
        let ids: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn lead_for_owner(
        &self,
        lead_id: i64,
        owner: UserId,
    ) -> Result<Option<Lead>, AppError> {
        let row = sqlx::query_as::<_, LeadRow>(
            "SELECT id, name, phone, email, created_by FROM leads WHERE id = $1 AND created_by = $2",
        )
        .bind(lead_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Lead {
            id: r.id,
            name: r.name,
            phone: r.phone,
            email: r.email,
            created_by: r.created_by,
        }))
    }

    async fn owner_is_active(&self, owner: UserId) -> Result<bool, AppError> {
        let active: Option<(bool,)> = sqlx::query_as("SELECT is_active FROM users WHERE id = $1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(matches!(active, Some((true,))))
    }
}

fn status_column(stage: Stage) -> &'static str {
    match stage {
        Stage::Download => "recording_status",
        Stage::Transcription => "transcribe_status",
        Stage::Summary => "summary_status",
    }
}

fn content_column(stage: Stage) -> &'static str {
    match stage {
        Stage::Download => "recording_path",
        Stage::Transcription => "transcribe_content",
        Stage::Summary => "summary_content",
    }
}
