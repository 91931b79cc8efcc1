mod config;
mod db_types;
mod deepgram_types;
mod error;
mod gateway;
mod handlers;
mod openai_types;
mod pipeline;
mod recording_store;
mod store;
mod summarization;
mod transcription;
mod twilio_types;
mod types;

use crate::config::{
    Config, TranscriptionProvider, DEFAULT_DEEPGRAM_API_BASE, DEFAULT_OPENAI_API_BASE,
};
use crate::gateway::TwilioGateway;
use crate::pipeline::{Orchestrator, PipelineDeps};
use crate::recording_store::RecordingStore;
use crate::store::PgCallStore;
use crate::summarization::{OpenAISummarizer, DEFAULT_SUMMARY_PROMPT};
use crate::transcription::{DeepgramTranscriber, Transcriber, WhisperTranscriber};
use crate::types::AppState;

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const APP_GREETING: &str =
        "Hi, this is a call from our outreach team. This call may be recorded.";
    pub const DB_MAX_CONNECTIONS: u32 = 10;
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("outreach_rs", tracing_subscriber::filter::LevelFilter::DEBUG),
            ("sqlx", tracing_subscriber::filter::LevelFilter::WARN),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = Config::from_env().expect("invalid configuration");

    let db_pool = PgPoolOptions::new()
        .max_connections(consts::DB_MAX_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("could not connect to the database");
    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("database migrations failed");

    // Vendor calls carry their own timeout in the pipeline; this one bounds handler-side calls.
    let http_client = reqwest::Client::builder()
        .timeout(config.pipeline.vendor_timeout + Duration::from_secs(5))
        .build()
        .expect("could not build HTTP client");

    let store = Arc::new(PgCallStore::new(db_pool));
    let gateway = Arc::new(TwilioGateway::new(
        http_client.clone(),
        config.twilio.clone(),
    ));
    let transcriber: Arc<dyn Transcriber> = match config.transcription_provider {
        TranscriptionProvider::Whisper => Arc::new(WhisperTranscriber::new(
            http_client.clone(),
            config.openai_api_key.clone(),
            DEFAULT_OPENAI_API_BASE.to_string(),
        )),
        TranscriptionProvider::Deepgram => Arc::new(DeepgramTranscriber::new(
            http_client.clone(),
            config.deepgram_api_key.clone().unwrap_or_default(),
            DEFAULT_DEEPGRAM_API_BASE.to_string(),
        )),
    };
    let summarizer = Arc::new(OpenAISummarizer::new(
        http_client,
        config.openai_api_key.clone(),
        DEFAULT_OPENAI_API_BASE.to_string(),
        config.summary_model.clone(),
    ));
    let recordings = RecordingStore::new(config.recordings_dir.clone());

    let (orchestrator, workers) = Orchestrator::start(
        PipelineDeps {
            store: store.clone(),
            gateway: gateway.clone(),
            transcriber,
            summarizer,
            recordings: recordings.clone(),
            prompt_template: DEFAULT_SUMMARY_PROMPT.to_string(),
        },
        config.pipeline.clone(),
    );
    let tally = orchestrator.tally();
    if let Err(e) = orchestrator.resume().await {
        error!(error=%e, "could not resume interrupted pipelines");
    }

    let app_state = Arc::new(AppState {
        store,
        gateway,
        recordings,
        orchestrator: orchestrator.clone(),
        greeting: consts::APP_GREETING.to_string(),
    });
    let app = handlers::router(app_state);

    info!(addr=%config.bind_addr, "listening");
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error=%e, "could not listen for shutdown signal");
            }
        })
        .await
        .unwrap();

    if tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_idle())
        .await
        .is_err()
    {
        info!("pipeline jobs still pending; they resume on next start");
    }
    orchestrator.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    if let Ok(t) = tally.await {
        info!(
            completed = t.stages_completed,
            failed = t.stages_failed,
            retries = t.retries,
            deferrals = t.deferrals,
            merged = t.merged,
            aborted = t.aborted,
            finished = t.finished,
            "pipeline totals"
        );
    }
    info!("shut down");
}
