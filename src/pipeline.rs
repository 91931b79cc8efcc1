use crate::config::PipelineConfig;
use crate::db_types::{CallId, CallRecord, PipelineState, Stage, StageOutcome};
use crate::error::AppError;
use crate::gateway::TelephonyGateway;
use crate::recording_store::RecordingStore;
use crate::store::CallStore;
use crate::summarization::Summarizer;
use crate::transcription::Transcriber;
use crate::twilio_types::RecordingStatus;

use futures_util::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 1_024;

/// What asked for the job. `Full` and `Download` run through to the summary; the others run one
/// stage only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Entry {
    Full,
    Download,
    Transcribe,
    Summarize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Enqueued {
    Queued,
    /// Another job holds the call; this trigger was merged into it.
    AlreadyRunning,
    NothingToDo,
}

#[derive(Clone, PartialEq, Debug)]
pub enum PipelineEvent {
    StageCompleted {
        call_id: CallId,
        stage: Stage,
        attempts: u32,
    },
    StageFailed {
        call_id: CallId,
        stage: Stage,
        attempts: u32,
        error: String,
    },
    RetryScheduled {
        call_id: CallId,
        stage: Stage,
        attempt: u32,
        delay: Duration,
    },
    Deferred {
        call_id: CallId,
        reason: String,
        delay: Duration,
    },
    Merged {
        call_id: CallId,
    },
    Aborted {
        call_id: CallId,
        reason: String,
    },
    Finished {
        call_id: CallId,
    },
}

/// Totals over the event stream for the life of the process.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct PipelineTally {
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub retries: u64,
    pub deferrals: u64,
    pub merged: u64,
    pub aborted: u64,
    pub finished: u64,
}

impl PipelineTally {
    fn record(&mut self, event: &PipelineEvent) {
        let counter = match event {
            PipelineEvent::StageCompleted { .. } => &mut self.stages_completed,
            PipelineEvent::StageFailed { .. } => &mut self.stages_failed,
            PipelineEvent::RetryScheduled { .. } => &mut self.retries,
            PipelineEvent::Deferred { .. } => &mut self.deferrals,
            PipelineEvent::Merged { .. } => &mut self.merged,
            PipelineEvent::Aborted { .. } => &mut self.aborted,
            PipelineEvent::Finished { .. } => &mut self.finished,
        };
        *counter += 1;
    }
}

/// Everything the pipeline talks to.
pub struct PipelineDeps {
    pub store: Arc<dyn CallStore>,
    pub gateway: Arc<dyn TelephonyGateway>,
    pub transcriber: Arc<dyn Transcriber>,
    pub summarizer: Arc<dyn Summarizer>,
    pub recordings: RecordingStore,
    pub prompt_template: String,
}

#[derive(Default)]
struct InFlight {
    calls: Mutex<HashSet<CallId>>,
    idle: Notify,
}

impl InFlight {
    fn acquire(self: &Arc<Self>, call_id: CallId) -> Result<InFlightGuard, AppError> {
        let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
        if !calls.insert(call_id) {
            return Err(AppError::ConcurrencyConflict(call_id));
        }
        Ok(InFlightGuard {
            call_id,
            in_flight: self.clone(),
        })
    }

    fn is_empty(&self) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }
}

/// Ownership of a call id for the lifetime of a job, retries included.
struct InFlightGuard {
    call_id: CallId,
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut calls = self
            .in_flight
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        calls.remove(&self.call_id);
        if calls.is_empty() {
            self.in_flight.idle.notify_waiters();
        }
    }
}

pub struct PipelineJob {
    pub call_id: CallId,
    pub entry: Entry,
    pub stage: Stage,
    /// 1-based try number for `stage`.
    pub attempt: u32,
    pub last_error: Option<String>,
    deferrals: u32,
    waiting_since: Option<Instant>,
    stage_begun: bool,
    _guard: InFlightGuard,
}

impl PipelineJob {
    fn new(call_id: CallId, entry: Entry, stage: Stage, guard: InFlightGuard) -> Self {
        Self {
            call_id,
            entry,
            stage,
            attempt: 1,
            last_error: None,
            deferrals: 0,
            waiting_since: None,
            stage_begun: false,
            _guard: guard,
        }
    }

    fn advance_to(&mut self, stage: Stage) {
        self.stage = stage;
        self.attempt = 1;
        self.last_error = None;
        self.deferrals = 0;
        self.waiting_since = None;
        self.stage_begun = false;
    }
}

enum StageResult {
    Completed,
    /// Preconditions are not met yet; come back later without counting an attempt.
    Deferred(String),
    /// The stage can't be entered (another writer moved the record on).
    Skipped,
}

enum Step {
    Continue,
    Reschedule(Duration),
    Stop,
}

struct Inner {
    deps: PipelineDeps,
    config: PipelineConfig,
    tx: mpsc::Sender<PipelineJob>,
    in_flight: Arc<InFlight>,
    events: broadcast::Sender<PipelineEvent>,
    shutdown: CancellationToken,
}

/// Drives calls through download, transcription and summary on a pool of workers. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn start(deps: PipelineDeps, config: PipelineConfig) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(256);
        let workers = config.workers.max(1);
        let orchestrator = Orchestrator {
            inner: Arc::new(Inner {
                deps,
                config,
                tx,
                in_flight: Arc::new(InFlight::default()),
                events,
                shutdown: CancellationToken::new(),
            }),
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|worker| tokio::spawn(orchestrator.clone().work(worker, rx.clone())))
            .collect();
        info!(workers, "pipeline workers started");
        (orchestrator, handles)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Counts events until shutdown; the handle resolves with the totals.
    pub fn tally(&self) -> JoinHandle<PipelineTally> {
        let mut events = self.subscribe();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut tally = PipelineTally::default();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => tally.record(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "pipeline tally fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            while let Ok(event) = events.try_recv() {
                tally.record(&event);
            }
            tally
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolves once no call has a job queued, running or waiting to retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.in_flight.idle.notified();
            if self.inner.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Queues work for a call. Manual entries check their preconditions here so the caller gets
    /// a validation error right away; everything after that is recorded on the call.
    pub async fn trigger(&self, call_id: CallId, entry: Entry) -> Result<Enqueued, AppError> {
        let record = self
            .inner
            .deps
            .store
            .get_call(call_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Call not found".to_string()))?;
        let stage = match entry_stage(&record, entry)? {
            Some(stage) => stage,
            None => {
                debug!(call_id, ?entry, "pipeline has nothing to do");
                return Ok(Enqueued::NothingToDo);
            }
        };
        let guard = match self.inner.in_flight.acquire(call_id) {
            Ok(guard) => guard,
            Err(e) => {
                debug!(call_id, ?entry, error=%e, "trigger merged into running job");
                self.emit(PipelineEvent::Merged { call_id });
                return Ok(Enqueued::AlreadyRunning);
            }
        };
        let job = PipelineJob::new(call_id, entry, stage, guard);
        self.inner
            .tx
            .send(job)
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        info!(call_id, ?entry, %stage, "pipeline job queued");
        Ok(Enqueued::Queued)
    }

    /// Start-up recovery: stages interrupted by a crash are redone from the last committed one.
    pub async fn resume(&self) -> Result<usize, AppError> {
        let store = &self.inner.deps.store;
        let reset = store.reset_in_flight().await?;
        let mut queued = 0;
        for call_id in store.list_resumable().await? {
            if self.trigger(call_id, Entry::Full).await? == Enqueued::Queued {
                queued += 1;
            }
        }
        info!(reset, queued, "resumed interrupted pipelines");
        Ok(queued)
    }

    async fn work(self, worker: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PipelineJob>>>) {
        loop {
            let job = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                job = async { rx.lock().await.recv().await } => job,
            };
            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }
        debug!(worker, "pipeline worker stopped");
    }

    fn emit(&self, event: PipelineEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    async fn process(&self, mut job: PipelineJob) {
        let call_id = job.call_id;
        loop {
            let record = match self.load_live_record(&job).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(e) => {
                    warn!(call_id, error=%e, "could not load call for pipeline");
                    match self.handle_failure(&mut job, e).await {
                        Step::Reschedule(delay) => self.reschedule(job, delay),
                        Step::Continue | Step::Stop => {}
                    }
                    return;
                }
            };

            let stage = job.stage;
            if let Some(previous) = &job.last_error {
                debug!(call_id, %stage, attempt = job.attempt, previous=%previous, "retrying stage");
            }
            let outcome = AssertUnwindSafe(self.run_stage(&mut job, &record))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(call_id, %stage, panic=%message, "pipeline stage panicked");
                    Err(AppError::Validation(format!("internal error: {message}")))
                });

            let step = match outcome {
                Ok(StageResult::Completed) => {
                    info!(call_id, %stage, attempts = job.attempt, "pipeline stage completed");
                    self.emit(PipelineEvent::StageCompleted {
                        call_id,
                        stage,
                        attempts: job.attempt,
                    });
                    match (job.entry, stage.next()) {
                        (Entry::Full | Entry::Download, Some(next)) => {
                            job.advance_to(next);
                            Step::Continue
                        }
                        _ => Step::Stop,
                    }
                }
                Ok(StageResult::Deferred(reason)) => self.defer(&mut job, reason).await,
                Ok(StageResult::Skipped) => {
                    debug!(call_id, %stage, "stage cannot begin; leaving call as is");
                    Step::Stop
                }
                Err(e) => self.handle_failure(&mut job, e).await,
            };

            match step {
                Step::Continue => continue,
                Step::Reschedule(delay) => {
                    self.reschedule(job, delay);
                    return;
                }
                Step::Stop => {
                    self.emit(PipelineEvent::Finished { call_id });
                    return;
                }
            }
        }
    }

    /// Re-reads the call before a stage; a deleted call or a deactivated owner ends the job.
    async fn load_live_record(&self, job: &PipelineJob) -> Result<Option<CallRecord>, AppError> {
        let store = &self.inner.deps.store;
        let Some(record) = store.get_call(job.call_id).await? else {
            info!(call_id = job.call_id, "call deleted; pipeline aborted");
            self.emit(PipelineEvent::Aborted {
                call_id: job.call_id,
                reason: "call deleted".to_string(),
            });
            return Ok(None);
        };
        if !store.owner_is_active(record.user_id).await? {
            info!(call_id = job.call_id, user_id = record.user_id, "owner inactive; pipeline aborted");
            if job.stage_begun {
                let outcome = StageOutcome::Failed {
                    stage: job.stage,
                    error: "owner account is inactive".to_string(),
                };
                store.finish_stage(job.call_id, outcome).await?;
            }
            self.emit(PipelineEvent::Aborted {
                call_id: job.call_id,
                reason: "owner inactive".to_string(),
            });
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn run_stage(
        &self,
        job: &mut PipelineJob,
        record: &CallRecord,
    ) -> Result<StageResult, AppError> {
        match job.stage {
            Stage::Download => self.download(job, record).await,
            Stage::Transcription => self.transcribe(job, record).await,
            Stage::Summary => self.summarize(job, record).await,
        }
    }

    /// Moves the stage to `processing` on first entry.
    async fn begin(&self, job: &mut PipelineJob) -> Result<bool, AppError> {
        if job.stage_begun {
            return Ok(true);
        }
        let begun = self
            .inner
            .deps
            .store
            .begin_stage(job.call_id, job.stage)
            .await?;
        job.stage_begun = begun;
        Ok(begun)
    }

    async fn vendor<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.inner.config.vendor_timeout, call)
            .await
            .map_err(|_| AppError::Timeout(what))?
    }

    async fn download(
        &self,
        job: &mut PipelineJob,
        record: &CallRecord,
    ) -> Result<StageResult, AppError> {
        let deps = &self.inner.deps;
        let call_id = job.call_id;

        if !job.stage_begun && !record.status.is_terminal() {
            let Some(sid) = record.provider_call_id.as_deref() else {
                return Err(AppError::Validation(
                    "No Twilio call ID found for this call".to_string(),
                ));
            };
            let state = self
                .vendor("call status", deps.gateway.fetch_status(sid))
                .await?;
            deps.store
                .update_status(call_id, state.status, state.duration)
                .await?;
            if !state.status.is_terminal() {
                return Ok(StageResult::Deferred(format!(
                    "call still {}",
                    state.status
                )));
            }
        }
        if !self.begin(job).await? {
            return Ok(StageResult::Skipped);
        }
        let Some(sid) = record.provider_call_id.as_deref() else {
            return Err(AppError::Validation(
                "No Twilio call ID found for this call".to_string(),
            ));
        };

        let recordings = self
            .vendor("recording list", deps.gateway.list_recordings(sid))
            .await?;
        // Normally there is exactly one recording per call.
        let Some(recording) = recordings
            .into_iter()
            .find(|r| r.status == RecordingStatus::Completed)
        else {
            return Ok(StageResult::Deferred(
                "no completed recording listed yet".to_string(),
            ));
        };
        let bytes = match self
            .vendor(
                "recording download",
                deps.gateway.download_recording(&recording.recording_id),
            )
            .await
        {
            Ok(bytes) => bytes,
            Err(AppError::NotFound(_)) => {
                return Ok(StageResult::Deferred(format!(
                    "recording {} not downloadable yet",
                    recording.recording_id
                )))
            }
            Err(e) => return Err(e),
        };
        let path = deps.recordings.save(call_id, &bytes).await?;
        let outcome = StageOutcome::Downloaded {
            recording_id: recording.recording_id.clone(),
            path: path.clone(),
            duration: recording.duration,
        };
        if !deps.store.finish_stage(call_id, outcome).await? {
            warn!(call_id, path=%path, "recording saved but call moved on; result discarded");
            return Ok(StageResult::Skipped);
        }
        debug!(call_id, recording_sid=%recording.recording_id, created=%recording.created_at, path=%path, "recording stored");
        Ok(StageResult::Completed)
    }

    async fn transcribe(
        &self,
        job: &mut PipelineJob,
        record: &CallRecord,
    ) -> Result<StageResult, AppError> {
        if !self.begin(job).await? {
            return Ok(StageResult::Skipped);
        }
        let deps = &self.inner.deps;
        let path = record.recording_path.as_deref().ok_or_else(|| {
            AppError::Validation("No recording file found for this call".to_string())
        })?;
        let audio = match deps.recordings.read(path).await {
            Ok(audio) => audio,
            Err(AppError::NotFound(msg)) => {
                // A vanished file won't come back by retrying.
                return Err(AppError::Transcription {
                    retryable: false,
                    message: msg,
                });
            }
            Err(e) => return Err(e),
        };
        let text = self
            .vendor("transcription", deps.transcriber.transcribe(&audio))
            .await?;
        if !deps
            .store
            .finish_stage(job.call_id, StageOutcome::Transcribed(text))
            .await?
        {
            return Ok(StageResult::Skipped);
        }
        Ok(StageResult::Completed)
    }

    async fn summarize(
        &self,
        job: &mut PipelineJob,
        record: &CallRecord,
    ) -> Result<StageResult, AppError> {
        if !self.begin(job).await? {
            return Ok(StageResult::Skipped);
        }
        let deps = &self.inner.deps;
        let text = record.transcribe_content.as_deref().unwrap_or_default();
        let summary = self
            .vendor(
                "summary",
                deps.summarizer.summarize(text, &deps.prompt_template),
            )
            .await?;
        debug!(call_id = job.call_id, model=%summary.model, "summary received");
        if !deps
            .store
            .finish_stage(job.call_id, StageOutcome::Summarized(summary.content))
            .await?
        {
            return Ok(StageResult::Skipped);
        }
        Ok(StageResult::Completed)
    }

    fn backoff(&self, n: u32) -> Duration {
        let config = &self.inner.config;
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        config
            .base_backoff
            .saturating_mul(factor)
            .min(config.max_backoff)
    }

    async fn defer(&self, job: &mut PipelineJob, reason: String) -> Step {
        let waiting_since = *job.waiting_since.get_or_insert_with(Instant::now);
        if waiting_since.elapsed() >= self.inner.config.recording_wait {
            let error = format!(
                "No recordings found for this call after waiting {}s ({reason})",
                self.inner.config.recording_wait.as_secs()
            );
            return self.fail_stage(job, error).await;
        }
        job.deferrals += 1;
        let delay = self.backoff(job.deferrals);
        debug!(call_id = job.call_id, %reason, ?delay, "pipeline deferred");
        self.emit(PipelineEvent::Deferred {
            call_id: job.call_id,
            reason,
            delay,
        });
        Step::Reschedule(delay)
    }

    async fn handle_failure(&self, job: &mut PipelineJob, e: AppError) -> Step {
        let call_id = job.call_id;
        let stage = job.stage;
        job.last_error = Some(e.to_string());
        if e.is_retryable() && job.attempt < self.inner.config.max_attempts {
            let delay = self.backoff(job.attempt);
            warn!(call_id, %stage, attempt = job.attempt, ?delay, error=%e, "stage failed; retrying");
            self.emit(PipelineEvent::RetryScheduled {
                call_id,
                stage,
                attempt: job.attempt,
                delay,
            });
            job.attempt += 1;
            return Step::Reschedule(delay);
        }
        self.fail_stage(job, e.to_string()).await
    }

    /// Records a terminal failure for the current stage, begun or not. Earlier stages keep their
    /// results.
    async fn fail_stage(&self, job: &mut PipelineJob, error: String) -> Step {
        let call_id = job.call_id;
        let stage = job.stage;
        error!(call_id, %stage, attempts = job.attempt, error=%error, "pipeline stage failed");
        let store = &self.inner.deps.store;
        let begun = match self.begin(job).await {
            Ok(begun) => begun,
            Err(e) => {
                error!(call_id, error=%e, "could not mark stage failed");
                false
            }
        };
        let recorded = if begun {
            let outcome = StageOutcome::Failed {
                stage,
                error: error.clone(),
            };
            store.finish_stage(call_id, outcome).await
        } else {
            store.fail_unstarted_stage(call_id, stage, &error).await
        };
        match recorded {
            Ok(true) => {}
            Ok(false) => debug!(call_id, %stage, "stage moved on; failure not recorded"),
            Err(e) => error!(call_id, error=%e, "could not record stage failure"),
        }
        self.emit(PipelineEvent::StageFailed {
            call_id,
            stage,
            attempts: job.attempt,
            error,
        });
        Step::Stop
    }

    fn reschedule(&self, job: PipelineJob, delay: Duration) {
        let tx = self.inner.tx.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => {
                    if tx.send(job).await.is_err() {
                        debug!("pipeline queue closed; dropping rescheduled job");
                    }
                }
            }
        });
    }
}

/// The stage a trigger starts at, or `None` when there is nothing left to do.
fn entry_stage(record: &CallRecord, entry: Entry) -> Result<Option<Stage>, AppError> {
    match entry {
        Entry::Full => Ok(match record.pipeline_state() {
            PipelineState::NeedsDownload => Some(Stage::Download),
            PipelineState::NeedsTranscription => Some(Stage::Transcription),
            PipelineState::NeedsSummary => Some(Stage::Summary),
            PipelineState::Done | PipelineState::Failed(_) => None,
        }),
        Entry::Download => {
            if record.provider_call_id.is_none() {
                return Err(AppError::Validation(
                    "No Twilio call ID found for this call".to_string(),
                ));
            }
            Ok(Some(Stage::Download))
        }
        Entry::Transcribe => {
            if !record.stage_ready(Stage::Transcription) {
                return Err(AppError::Validation(
                    "No recording file found for this call".to_string(),
                ));
            }
            Ok(Some(Stage::Transcription))
        }
        Entry::Summarize => {
            if !record.stage_ready(Stage::Summary) {
                return Err(AppError::Validation(
                    "No transcription available for this call".to_string(),
                ));
            }
            Ok(Some(Stage::Summary))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::{sample_record, CallStatus, StageStatus};
    use crate::gateway::{DialResult, ProviderCallState, RecordingInfo};
    use crate::store::memory::MemoryCallStore;
    use crate::summarization::{CallSummary, DEFAULT_SUMMARY_PROMPT};

    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use time::OffsetDateTime;

    #[derive(Default)]
    struct FakeGateway {
        provider_status: Mutex<Option<CallStatus>>,
        recordings: Mutex<Vec<RecordingInfo>>,
        fail_listing: bool,
        download_delay: Duration,
        list_calls: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl FakeGateway {
        fn with_recording(recording_id: &str) -> Self {
            let gateway = Self::default();
            gateway.recordings.lock().unwrap().push(RecordingInfo {
                recording_id: recording_id.to_string(),
                duration: Some(31),
                status: RecordingStatus::Completed,
                created_at: "Tue, 01 Oct 2024 10:00:00 +0000".to_string(),
            });
            gateway
        }
    }

    #[async_trait]
    impl TelephonyGateway for FakeGateway {
        async fn dial(&self, _to: &str, _from: Option<&str>) -> Result<DialResult, AppError> {
            Err(AppError::gateway(None, "dialing is not part of the pipeline"))
        }

        async fn fetch_status(&self, _sid: &str) -> Result<ProviderCallState, AppError> {
            let status = self
                .provider_status
                .lock()
                .unwrap()
                .unwrap_or(CallStatus::Completed);
            Ok(ProviderCallState {
                status,
                duration: Some(31),
            })
        }

        async fn terminate(&self, _sid: &str) -> Result<CallStatus, AppError> {
            Ok(CallStatus::Completed)
        }

        async fn list_recordings(&self, _sid: &str) -> Result<Vec<RecordingInfo>, AppError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing {
                return Err(AppError::gateway(Some(503), "service unavailable"));
            }
            Ok(self.recordings.lock().unwrap().clone())
        }

        async fn download_recording(&self, _recording_id: &str) -> Result<Vec<u8>, AppError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            sleep(self.download_delay).await;
            Ok(b"ID3fake-audio".to_vec())
        }
    }

    #[derive(Default)]
    struct FakeTranscriber {
        text: Mutex<Option<String>>,
        delays: Mutex<VecDeque<Duration>>,
        panic: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio: &[u8]) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic.load(Ordering::SeqCst) {
                panic!("decoder exploded");
            }
            let delay = self.delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            assert_eq!(audio, b"ID3fake-audio");
            let text = self.text.lock().unwrap().clone();
            Ok(text.unwrap_or_else(|| "hello world".to_string()))
        }
    }

    #[derive(Default)]
    struct FakeSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(
            &self,
            text: &str,
            prompt_template: &str,
        ) -> Result<CallSummary, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(prompt_template.contains("{transcription}"));
            if text.is_empty() {
                return Err(AppError::Summarization {
                    retryable: false,
                    message: "Transcription text is empty".to_string(),
                });
            }
            Ok(CallSummary {
                content: format!("summary of {text}"),
                model: "fake".to_string(),
            })
        }
    }

    struct Harness {
        store: Arc<MemoryCallStore>,
        gateway: Arc<FakeGateway>,
        transcriber: Arc<FakeTranscriber>,
        summarizer: Arc<FakeSummarizer>,
        recordings: RecordingStore,
        orchestrator: Orchestrator,
        events: broadcast::Receiver<PipelineEvent>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(gateway: FakeGateway, transcriber: FakeTranscriber, config: PipelineConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryCallStore::default());
            let gateway = Arc::new(gateway);
            let transcriber = Arc::new(transcriber);
            let summarizer = Arc::new(FakeSummarizer::default());
            let recordings = RecordingStore::new(dir.path());
            let (orchestrator, _workers) = Orchestrator::start(
                PipelineDeps {
                    store: store.clone(),
                    gateway: gateway.clone(),
                    transcriber: transcriber.clone(),
                    summarizer: summarizer.clone(),
                    recordings: recordings.clone(),
                    prompt_template: DEFAULT_SUMMARY_PROMPT.to_string(),
                },
                config,
            );
            let events = orchestrator.subscribe();
            Harness {
                store,
                gateway,
                transcriber,
                summarizer,
                recordings,
                orchestrator,
                events,
                _dir: dir,
            }
        }

        async fn idle(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.orchestrator.wait_idle())
                .await
                .expect("pipeline never went idle");
        }

        fn events(&mut self) -> Vec<PipelineEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn record(&self, id: CallId) -> CallRecord {
            self.store.snapshot(id).expect("call exists")
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            workers: 2,
            max_attempts: 5,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            recording_wait: Duration::from_millis(150),
            vendor_timeout: Duration::from_millis(100),
        }
    }

    fn ended_call(id: CallId) -> CallRecord {
        CallRecord {
            status: CallStatus::Completed,
            end_time: Some(OffsetDateTime::now_utc()),
            duration: Some(31),
            ..sample_record(id)
        }
    }

    #[tokio::test]
    async fn completed_call_runs_every_stage() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));

        let queued = h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        assert_eq!(queued, Enqueued::Queued);
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.pipeline_state(), PipelineState::Done);
        assert_eq!(record.provider_recording_id.as_deref(), Some("rec-1"));
        assert_eq!(record.transcribe_content.as_deref(), Some("hello world"));
        assert_eq!(
            record.summary_content.as_deref(),
            Some("summary of hello world")
        );
        assert_eq!(record.pipeline_error, None);
        let path = record.recording_path.unwrap();
        assert!(path.starts_with("42_"));
        assert_eq!(
            h.recordings.read(&path).await.unwrap(),
            b"ID3fake-audio".to_vec()
        );
        assert_eq!(h.gateway.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_run_the_pipeline_once() {
        let gateway = FakeGateway {
            download_delay: Duration::from_millis(50),
            ..FakeGateway::with_recording("rec-1")
        };
        let mut h = Harness::new(gateway, FakeTranscriber::default(), fast_config());
        h.store.insert(ended_call(42));

        let (a, b) = tokio::join!(
            h.orchestrator.trigger(42, Entry::Full),
            h.orchestrator.trigger(42, Entry::Download),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == Enqueued::Queued);
        assert_eq!(outcomes, vec![Enqueued::AlreadyRunning, Enqueued::Queued]);
        h.idle().await;

        assert_eq!(h.gateway.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);
        assert!(h
            .events()
            .contains(&PipelineEvent::Merged { call_id: 42 }));
    }

    #[tokio::test]
    async fn finished_call_is_not_reprocessed() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        let again = h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        assert_eq!(again, Enqueued::NothingToDo);
        h.idle().await;
        assert_eq!(h.gateway.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_recording_defers_then_fails_download_only() {
        let mut h = Harness::new(
            FakeGateway::default(),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();

        while h.gateway.list_calls.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(2)).await;
        }
        let waiting = h.record(42);
        assert_eq!(waiting.pipeline_state(), PipelineState::NeedsDownload);
        assert_eq!(waiting.pipeline_error, None);

        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.recording_status, StageStatus::Failed);
        assert_eq!(record.pipeline_state(), PipelineState::Failed(Stage::Download));
        assert!(record
            .pipeline_error
            .unwrap()
            .contains("No recordings found"));
        assert_eq!(record.transcribe_status, StageStatus::None);
        assert_eq!(record.summary_status, StageStatus::None);
        assert!(h.gateway.list_calls.load(Ordering::SeqCst) > 1);
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);

        let events = h.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Deferred { call_id: 42, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageFailed {
                stage: Stage::Download,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn transcription_timeouts_are_retried() {
        let transcriber = FakeTranscriber::default();
        transcriber
            .delays
            .lock()
            .unwrap()
            .extend([Duration::from_millis(400), Duration::from_millis(400)]);
        let mut h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            transcriber,
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.pipeline_state(), PipelineState::Done);
        assert_eq!(record.transcribe_content.as_deref(), Some("hello world"));
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 3);

        let events = h.events();
        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::RetryScheduled {
                    stage: Stage::Transcription,
                    attempt,
                    ..
                } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
        assert!(events.contains(&PipelineEvent::StageCompleted {
            call_id: 42,
            stage: Stage::Transcription,
            attempts: 3,
        }));
    }

    #[tokio::test]
    async fn retryable_errors_stop_at_max_attempts() {
        let gateway = FakeGateway {
            fail_listing: true,
            ..FakeGateway::default()
        };
        let config = PipelineConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let mut h = Harness::new(gateway, FakeTranscriber::default(), config);
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        assert_eq!(h.gateway.list_calls.load(Ordering::SeqCst), 3);
        let record = h.record(42);
        assert_eq!(record.recording_status, StageStatus::Failed);
        assert!(record.pipeline_error.unwrap().contains("HTTP 503"));
        assert!(h.events().iter().any(|e| matches!(
            e,
            PipelineEvent::StageFailed { attempts: 3, .. }
        )));
    }

    #[tokio::test]
    async fn empty_transcript_fails_summary_without_retry() {
        let transcriber = FakeTranscriber::default();
        *transcriber.text.lock().unwrap() = Some(String::new());
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            transcriber,
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.transcribe_status, StageStatus::Completed);
        assert_eq!(record.summary_status, StageStatus::Failed);
        assert!(record.pipeline_error.unwrap().contains("empty"));
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleting_a_call_aborts_its_pipeline() {
        let config = PipelineConfig {
            recording_wait: Duration::from_secs(5),
            ..fast_config()
        };
        let mut h = Harness::new(FakeGateway::default(), FakeTranscriber::default(), config);
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        sleep(Duration::from_millis(30)).await;

        assert!(h.store.delete_call(42).await.unwrap());
        h.idle().await;

        assert!(h.store.snapshot(42).is_none());
        assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Aborted { call_id: 42, .. })));
    }

    #[tokio::test]
    async fn deactivated_owner_aborts_and_marks_the_stage() {
        let config = PipelineConfig {
            recording_wait: Duration::from_secs(5),
            ..fast_config()
        };
        let h = Harness::new(FakeGateway::default(), FakeTranscriber::default(), config);
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        sleep(Duration::from_millis(30)).await;

        h.store.deactivate(1);
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.recording_status, StageStatus::Failed);
        assert!(record.pipeline_error.unwrap().contains("inactive"));
    }

    #[tokio::test]
    async fn manual_triggers_check_preconditions() {
        let h = Harness::new(
            FakeGateway::default(),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));

        assert!(matches!(
            h.orchestrator.trigger(42, Entry::Summarize).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator.trigger(42, Entry::Transcribe).await,
            Err(AppError::Validation(_))
        ));
        h.store.insert(CallRecord {
            provider_call_id: None,
            ..ended_call(43)
        });
        assert!(matches!(
            h.orchestrator.trigger(43, Entry::Download).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator.trigger(99, Entry::Full).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn manual_transcribe_runs_only_that_stage() {
        let h = Harness::new(
            FakeGateway::default(),
            FakeTranscriber::default(),
            fast_config(),
        );
        let path = h.recordings.save(42, b"ID3fake-audio").await.unwrap();
        h.store.insert(CallRecord {
            recording_status: StageStatus::Completed,
            recording_path: Some(path),
            ..ended_call(42)
        });

        let queued = h.orchestrator.trigger(42, Entry::Transcribe).await.unwrap();
        assert_eq!(queued, Enqueued::Queued);
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.transcribe_status, StageStatus::Completed);
        assert_eq!(record.summary_status, StageStatus::None);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.gateway.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_call_is_refreshed_before_download() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(CallRecord {
            status: CallStatus::InProgress,
            ..sample_record(42)
        });
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.status, CallStatus::Completed);
        assert!(record.end_time.is_some());
        assert_eq!(record.pipeline_state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn resume_redoes_interrupted_stages() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(CallRecord {
            recording_status: StageStatus::Processing,
            ..ended_call(42)
        });
        h.store.insert(CallRecord {
            recording_status: StageStatus::Failed,
            ..ended_call(43)
        });

        assert_eq!(h.orchestrator.resume().await.unwrap(), 1);
        h.idle().await;

        assert_eq!(h.record(42).pipeline_state(), PipelineState::Done);
        assert_eq!(h.record(43).recording_status, StageStatus::Failed);
        assert_eq!(h.gateway.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tally_counts_a_finished_pipeline() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        let tally = h.orchestrator.tally();
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;
        assert_eq!(
            h.orchestrator.trigger(42, Entry::Full).await.unwrap(),
            Enqueued::NothingToDo
        );

        h.orchestrator.shutdown();
        let tally = tally.await.unwrap();
        assert_eq!(
            tally,
            PipelineTally {
                stages_completed: 3,
                finished: 1,
                ..PipelineTally::default()
            }
        );
    }

    #[tokio::test]
    async fn triggers_after_shutdown_are_refused() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.shutdown();

        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match h.orchestrator.trigger(42, Entry::Download).await {
                    Err(e) => return e,
                    Ok(_) => sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("queue never closed");
        assert!(matches!(refused, AppError::ShuttingDown));
    }

    #[tokio::test]
    async fn download_on_a_live_call_records_the_failure() {
        let gateway = FakeGateway::with_recording("rec-1");
        *gateway.provider_status.lock().unwrap() = Some(CallStatus::InProgress);
        let h = Harness::new(gateway, FakeTranscriber::default(), fast_config());
        h.store.insert(CallRecord {
            status: CallStatus::InProgress,
            ..sample_record(42)
        });

        let queued = h.orchestrator.trigger(42, Entry::Download).await.unwrap();
        assert_eq!(queued, Enqueued::Queued);
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.status, CallStatus::InProgress);
        assert_eq!(record.recording_status, StageStatus::Failed);
        assert_eq!(record.pipeline_state(), PipelineState::Failed(Stage::Download));
        let error = record.pipeline_error.unwrap();
        assert!(error.contains("No recordings found"), "{error}");
        assert!(error.contains("call still in_progress"), "{error}");
        assert_eq!(h.gateway.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn redownload_clears_results_of_later_stages() {
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            FakeTranscriber::default(),
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;
        assert_eq!(h.record(42).pipeline_state(), PipelineState::Done);

        h.transcriber.panic.store(true, Ordering::SeqCst);
        h.orchestrator.trigger(42, Entry::Download).await.unwrap();
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.recording_status, StageStatus::Completed);
        assert_eq!(record.transcribe_status, StageStatus::Failed);
        assert_eq!(record.transcribe_content, None);
        assert_eq!(record.summary_status, StageStatus::None);
        assert_eq!(record.summary_content, None);
        assert_eq!(h.gateway.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_stage_is_recorded_and_workers_survive() {
        let transcriber = FakeTranscriber::default();
        transcriber.panic.store(true, Ordering::SeqCst);
        let h = Harness::new(
            FakeGateway::with_recording("rec-1"),
            transcriber,
            fast_config(),
        );
        h.store.insert(ended_call(42));
        h.orchestrator.trigger(42, Entry::Full).await.unwrap();
        h.idle().await;

        let record = h.record(42);
        assert_eq!(record.transcribe_status, StageStatus::Failed);
        assert!(record.pipeline_error.unwrap().contains("decoder exploded"));

        h.transcriber.panic.store(false, Ordering::SeqCst);
        h.store.insert(ended_call(43));
        h.orchestrator.trigger(43, Entry::Full).await.unwrap();
        h.idle().await;
        assert_eq!(h.record(43).pipeline_state(), PipelineState::Done);
    }
}
