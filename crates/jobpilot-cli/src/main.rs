use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobpilot_chat::{ChatConfig, ChatProtocolClient, WsConnector};
use jobpilot_client::{OpenAiMatchEvaluator, PlatformApi, PlatformConfig, ResumeImageUploader};
use jobpilot_core::models::JobRecord;
use jobpilot_core::traits::{ImageSource, MemoryStore, NoImageSource, ResultStore};
use jobpilot_core::{
    AppError, CandidateJob, CredentialStore, Credentials, JobEvaluationPipeline, PipelineConfig,
    TracingPipelineReporter, batch_channel, outbound_channel,
};

#[derive(Parser)]
#[command(
    name = "jobpilot",
    version,
    about = "Evaluate scraped job listings and greet matching recruiters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate job batches from a file and message the matches
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON file holding an array of batches, each an array of jobs
    #[arg(short, long)]
    batches: PathBuf,

    /// JSON file with `cookies` and `headers` objects for the platform session
    #[arg(short, long, env = "JOBPILOT_COOKIES")]
    cookies: Option<PathBuf>,

    /// Seconds between checks of the cookies file for a refreshed session; 0 disables
    #[arg(long, env = "JOBPILOT_COOKIES_RELOAD_SECS", default_value_t = 30)]
    cookies_reload_secs: u64,

    /// LLM model used to screen listings
    #[arg(short, long, env = "JOBPILOT_MODEL")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "JOBPILOT_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    llm_base_url: String,

    /// API key (reads from JOBPILOT_API_KEY env var if not provided)
    #[arg(short, long, env = "JOBPILOT_API_KEY")]
    api_key: String,

    /// Plain-text resume and preferences sent with every listing
    #[arg(short, long, env = "JOBPILOT_RESUME")]
    resume: Option<PathBuf>,

    /// Resume image attached after the greeting
    #[arg(long, env = "JOBPILOT_RESUME_IMAGE")]
    resume_image: Option<PathBuf>,

    /// System prompt file for the match decision
    #[arg(long, env = "JOBPILOT_PROMPT")]
    prompt: Option<PathBuf>,

    /// Prompt file for AI-written greetings; the default greeting is used without it
    #[arg(long, env = "JOBPILOT_GREETING_PROMPT")]
    greeting_prompt: Option<PathBuf>,

    /// Sampling temperature for the match model
    #[arg(long, env = "JOBPILOT_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Recruiting platform base URL
    #[arg(
        long,
        env = "JOBPILOT_PLATFORM_URL",
        default_value = "https://www.zhipin.com/"
    )]
    platform_url: String,

    /// Seconds to wait for outstanding chat acknowledgements before exiting
    #[arg(long, env = "JOBPILOT_DRAIN_SECS", default_value_t = 60)]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jobpilot=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let batches = load_batches(&args.batches)?;
    let credentials = match &args.cookies {
        Some(path) => load_credentials(path)?,
        None => Credentials::default(),
    };
    let mut pipeline_config =
        PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    if args.resume_image.is_some() {
        pipeline_config = pipeline_config.with_resume_image(true);
    }
    let chat_config = ChatConfig::from_env().context("Invalid chat configuration")?;
    let platform_config = PlatformConfig::default()
        .with_base_url(&args.platform_url)
        .context("Invalid platform URL")?;

    let mut matcher =
        OpenAiMatchEvaluator::with_base_url(&args.api_key, &args.model, &args.llm_base_url)
            .context("Failed to create LLM client")?
            .with_temperature(args.temperature);
    if let Some(path) = &args.resume {
        matcher = matcher.with_resume(read_text(path)?);
    }
    if let Some(path) = &args.prompt {
        matcher = matcher.with_system_prompt(read_text(path)?);
    }
    if let Some(path) = &args.greeting_prompt {
        matcher = matcher.with_greeting_prompt(read_text(path)?);
    }

    let store = Arc::new(CredentialStore::new(credentials));
    let platform = PlatformApi::with_config(store.clone(), platform_config.clone());

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, shutting down");
            signal_token.cancel();
        }
    });

    let reload_cancel = cancel.child_token();
    if let Some(path) = &args.cookies
        && args.cookies_reload_secs > 0
    {
        spawn_cookie_reload(
            store.clone(),
            CookieWatcher::new(path.clone()),
            Duration::from_secs(args.cookies_reload_secs),
            reload_cancel.clone(),
        );
    }

    let (outbox, queue) = outbound_channel();
    let delivery = outbox.delivery();
    let chat = ChatProtocolClient::new(
        platform.clone(),
        WsConnector::new(),
        store.clone(),
        chat_config,
    )
    .spawn(queue, cancel.child_token())
    .context("Failed to start chat client")?;

    let wiring = Wiring {
        platform,
        matcher,
        outbox,
        config: pipeline_config,
        batches,
        cancel: cancel.clone(),
    };
    let outcome = match &args.resume_image {
        Some(path) => {
            let images = ResumeImageUploader::load(store.clone(), platform_config, path)
                .await
                .context("Failed to load resume image")?;
            wiring.run(images).await
        }
        None => wiring.run(NoImageSource).await,
    };

    // Every Outbox is gone now, so the chat client exits once it has drained.
    let drained =
        tokio::time::timeout(Duration::from_secs(args.drain_secs), delivery.wait_complete()).await;
    let counts = delivery.counts();
    let chat_result = if drained.is_ok() {
        tokio::task::spawn_blocking(move || chat.join()).await?
    } else {
        tracing::warn!(
            enqueued = counts.enqueued,
            acknowledged = counts.acknowledged,
            "Gave up waiting for chat acknowledgements"
        );
        tokio::task::spawn_blocking(move || chat.stop()).await?
    };
    reload_cancel.cancel();
    store.close().await;

    tracing::info!(
        enqueued = counts.enqueued,
        sent = counts.sent,
        acknowledged = counts.acknowledged,
        "Run finished"
    );
    outcome?;
    chat_result.map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

struct Wiring {
    platform: PlatformApi,
    matcher: OpenAiMatchEvaluator,
    outbox: jobpilot_core::Outbox,
    config: PipelineConfig,
    batches: Vec<Vec<CandidateJob>>,
    cancel: CancellationToken,
}

impl Wiring {
    /// Feed every batch through the pipeline, one at a time.
    async fn run<I: ImageSource>(self, images: I) -> Result<()> {
        let pipeline = JobEvaluationPipeline::new(
            self.platform.clone(),
            self.matcher,
            self.platform,
            images,
            JsonLinesStore::default(),
            self.outbox,
            self.config,
        )
        .map_err(|e| anyhow::anyhow!(e))?;

        let (mut sender, receiver) = batch_channel();
        let batches = self.batches;
        let producer = async move {
            for jobs in batches {
                sender.submit(jobs).await?;
            }
            sender.wait_idle().await?;
            sender.close();
            Ok::<_, AppError>(())
        };

        let reporter = TracingPipelineReporter;
        let (consumed, produced) =
            tokio::join!(pipeline.run(receiver, self.cancel, &reporter), producer);
        consumed.map_err(|e| anyhow::anyhow!(e))?;
        if let Err(e) = produced {
            tracing::warn!(error = %e, "Batch producer stopped early");
        }
        Ok(())
    }
}

/// Prints every saved record to stdout as one JSON line.
#[derive(Clone, Default)]
struct JsonLinesStore {
    seen: MemoryStore,
}

impl ResultStore for JsonLinesStore {
    async fn is_visited(&self, job_id: &str) -> Result<bool, AppError> {
        self.seen.is_visited(job_id).await
    }

    async fn save_batch(&self, records: &[JobRecord]) -> Result<(), AppError> {
        {
            let mut out = std::io::stdout().lock();
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                writeln!(out).map_err(|e| AppError::Generic(format!("stdout: {e}")))?;
            }
        }
        self.seen.save_batch(records).await
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    cookies: BTreeMap<String, String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn load_batches(path: &Path) -> Result<Vec<Vec<CandidateJob>>> {
    let raw = read_text(path)?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid batch file: {}", path.display()))
}

fn load_credentials(path: &Path) -> Result<Credentials> {
    let raw = read_text(path)?;
    let file: CredentialsFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid cookies file: {}", path.display()))?;
    Ok(Credentials {
        cookies: file.cookies,
        headers: file.headers,
        generation: 0,
    })
}

/// Tracks the cookies file so an operator can drop in a fresh login
/// without restarting the run.
struct CookieWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl CookieWatcher {
    fn new(path: PathBuf) -> Self {
        let last_modified = modified_time(&path).ok();
        Self {
            path,
            last_modified,
        }
    }

    /// Push the file into `store` if it changed since the last look.
    /// Returns the new credential generation.
    fn reload(&mut self, store: &CredentialStore) -> Result<Option<u64>> {
        let modified = modified_time(&self.path)?;
        if self.last_modified == Some(modified) {
            return Ok(None);
        }
        let credentials = load_credentials(&self.path)?;
        let generation = store
            .update(credentials.cookies, credentials.headers)
            .map_err(|e| anyhow::anyhow!(e))?;
        self.last_modified = Some(modified);
        Ok(Some(generation))
    }
}

fn spawn_cookie_reload(
    store: Arc<CredentialStore>,
    mut watcher: CookieWatcher,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match watcher.reload(&store) {
                Ok(Some(generation)) => tracing::info!(
                    generation,
                    path = %watcher.path.display(),
                    "Reloaded session cookies"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Cookie reload failed"),
            }
        }
    });
}

fn modified_time(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
