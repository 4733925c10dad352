use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchReceiver, InboundBatch};
use crate::env;
use crate::error::AppError;
use crate::link::JobLink;
use crate::models::{CandidateJob, JobOutcome, JobRecord, MatchDecision, OutboundMessage, SkipReason};
use crate::outbound::Outbox;
use crate::rate_limiter::RateLimiter;
use crate::salary::SalaryFilter;
use crate::traits::{ChatInitiator, DetailFetcher, ImageSource, MatchEvaluator, ResultStore};

/// HR activity labels that mean the recruiter is unlikely to answer.
pub const DEFAULT_INACTIVE_LABELS: &[&str] = &[
    "本月活跃",
    "2月内活跃",
    "3月内活跃",
    "4月内活跃",
    "5月内活跃",
    "半年前活跃",
    "近半年活跃",
];

pub const DEFAULT_GREETING: &str = "您好，我对这个岗位很感兴趣，附上简历，期待进一步沟通。";

/// Tunables for [`JobEvaluationPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tokens per second for detail fetches and chat initiations.
    pub rate: f64,
    pub burst: u32,
    pub job_timeout: Duration,
    pub batch_timeout: Duration,
    /// Upper bound on one match-collaborator call.
    pub match_timeout: Duration,
    pub inactive_labels: BTreeSet<String>,
    pub salary: SalaryFilter,
    pub skip_visited: bool,
    pub send_resume_image: bool,
    /// Text body used when the match collaborator has no greeting of its own.
    pub default_greeting: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate: 0.5,
            burst: 3,
            job_timeout: Duration::from_secs(120),
            batch_timeout: Duration::from_secs(900),
            match_timeout: Duration::from_secs(90),
            inactive_labels: DEFAULT_INACTIVE_LABELS.iter().map(|s| s.to_string()).collect(),
            salary: SalaryFilter::any(),
            skip_visited: true,
            send_resume_image: false,
            default_greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn with_rate(mut self, rate: f64, burst: u32) -> Self {
        self.rate = rate;
        self.burst = burst;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_match_timeout(mut self, timeout: Duration) -> Self {
        self.match_timeout = timeout;
        self
    }

    pub fn with_inactive_labels<I, T>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.inactive_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_salary(mut self, salary: SalaryFilter) -> Self {
        self.salary = salary;
        self
    }

    pub fn with_skip_visited(mut self, skip: bool) -> Self {
        self.skip_visited = skip;
        self
    }

    pub fn with_resume_image(mut self, enabled: bool) -> Self {
        self.send_resume_image = enabled;
        self
    }

    pub fn with_default_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.default_greeting = greeting.into();
        self
    }

    /// Defaults overridden by `JOBPILOT_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(env::process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(rate) = env::parse_var(&lookup, "JOBPILOT_RATE")? {
            config.rate = rate;
        }
        if let Some(burst) = env::parse_var(&lookup, "JOBPILOT_BURST")? {
            config.burst = burst;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_JOB_TIMEOUT_SECS")? {
            config.job_timeout = t;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_BATCH_TIMEOUT_SECS")? {
            config.batch_timeout = t;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_MATCH_TIMEOUT_SECS")? {
            config.match_timeout = t;
        }
        if let Some(labels) = env::parse_list(&lookup, "JOBPILOT_INACTIVE_LABELS") {
            config.inactive_labels = labels.into_iter().collect();
        }
        let min_k = env::parse_var::<f64, _>(&lookup, "JOBPILOT_SALARY_MIN_K")?;
        let max_k = env::parse_var::<f64, _>(&lookup, "JOBPILOT_SALARY_MAX_K")?;
        if min_k.is_some() || max_k.is_some() {
            config.salary = SalaryFilter::new(min_k.unwrap_or(0.0), max_k)?;
        }
        if let Some(skip) = env::parse_flag(&lookup, "JOBPILOT_SKIP_VISITED")? {
            config.skip_visited = skip;
        }
        if let Some(send) = env::parse_flag(&lookup, "JOBPILOT_SEND_RESUME_IMAGE")? {
            config.send_resume_image = send;
        }
        if let Some(greeting) = lookup("JOBPILOT_GREETING").filter(|g| !g.trim().is_empty()) {
            config.default_greeting = greeting;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.default_greeting.trim().is_empty() {
            return Err(AppError::ConfigError("Default greeting is empty".into()));
        }
        // Surfaces rate/burst errors before the first batch arrives.
        RateLimiter::new(self.rate, self.burst).map(|_| ())
    }
}

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started,
    BatchReceived {
        batch_id: u64,
        size: usize,
    },
    BatchFiltered {
        batch_id: u64,
        kept: usize,
        salary_rejected: usize,
        already_visited: usize,
    },
    JobFinished {
        batch_id: u64,
        record: &'a JobRecord,
    },
    BatchTimedOut {
        batch_id: u64,
        unfinished: usize,
    },
    BatchCompleted {
        report: &'a BatchReport,
    },
    PersistFailed {
        batch_id: u64,
        error: &'a str,
    },
    Stopped,
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPipelineReporter;

impl PipelineReporter for TracingPipelineReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started => tracing::info!("Pipeline started"),
            PipelineEvent::BatchReceived { batch_id, size } => {
                tracing::info!(batch_id, size, "Batch received");
            }
            PipelineEvent::BatchFiltered {
                batch_id,
                kept,
                salary_rejected,
                already_visited,
            } => {
                tracing::info!(batch_id, kept, salary_rejected, already_visited, "Batch filtered");
            }
            PipelineEvent::JobFinished { batch_id, record } => {
                tracing::info!(
                    batch_id,
                    job_id = record.job_id.as_deref().unwrap_or("-"),
                    job = %record.name,
                    outcome = %record.outcome,
                    "Job finished"
                );
            }
            PipelineEvent::BatchTimedOut {
                batch_id,
                unfinished,
            } => {
                tracing::warn!(batch_id, unfinished, "Batch timed out, cancelling remaining jobs");
            }
            PipelineEvent::BatchCompleted { report } => {
                tracing::info!(
                    batch_id = report.batch_id,
                    evaluated = report.records.len(),
                    applied = report.count(|o| matches!(o, JobOutcome::Applied)),
                    failed = report.count(|o| matches!(o, JobOutcome::Failed { .. })),
                    timed_out = report.count(|o| matches!(o, JobOutcome::TimedOut)),
                    "Batch completed"
                );
            }
            PipelineEvent::PersistFailed { batch_id, error } => {
                tracing::error!(batch_id, %error, "Failed to persist batch results");
            }
            PipelineEvent::Stopped => tracing::info!("Pipeline stopped"),
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batch_id: u64,
    pub received: usize,
    pub salary_rejected: usize,
    pub already_visited: usize,
    /// One record per job that passed the filters.
    pub records: Vec<JobRecord>,
    pub timed_out: bool,
}

impl BatchReport {
    pub fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Applied))
    }
}

/// Everything one job task needs. Cheap to clone into each task.
#[derive(Clone)]
struct JobEvaluator<D, M, C, I> {
    detail: D,
    matcher: M,
    chat: C,
    images: I,
    limiter: Arc<RateLimiter>,
    outbox: Outbox,
    config: Arc<PipelineConfig>,
}

impl<D, M, C, I> JobEvaluator<D, M, C, I>
where
    D: DetailFetcher,
    M: MatchEvaluator,
    C: ChatInitiator,
    I: ImageSource,
{
    /// Run one job under the per-job timeout. Only fatal errors escape.
    async fn evaluate(self, job: CandidateJob, link: JobLink) -> Result<JobRecord, AppError> {
        let mut record = JobRecord::new(Some(link.job_id.clone()), &job.name, JobOutcome::NotMatched);
        let result =
            tokio::time::timeout(self.config.job_timeout, self.process(&link, &mut record)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_fatal(&e) => return Err(e),
            Ok(Err(e)) => {
                tracing::warn!(
                    job_id = %link.job_id,
                    job = %job.name,
                    kind = %e.kind(),
                    error = %e,
                    "Job failed"
                );
                record.outcome = JobOutcome::Failed {
                    error: e.to_string(),
                };
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %link.job_id,
                    job = %job.name,
                    timeout_secs = self.config.job_timeout.as_secs(),
                    "Job cancelled after timeout"
                );
                record.outcome = JobOutcome::TimedOut;
            }
        }
        Ok(record)
    }

    async fn process(&self, link: &JobLink, record: &mut JobRecord) -> Result<(), AppError> {
        self.limiter.acquire().await;
        let detail = self.detail.fetch_detail(link).await?;
        record.detail = Some(detail.raw.clone());

        if self
            .config
            .inactive_labels
            .contains(&detail.activity_recency_label)
        {
            tracing::debug!(job_id = %link.job_id, label = %detail.activity_recency_label, "Recruiter inactive");
            record.outcome = JobOutcome::Skipped(SkipReason::Inactive {
                label: detail.activity_recency_label,
            });
            return Ok(());
        }

        let summary = detail.requirement_summary();
        let decision = self.decide(link, &summary).await;
        record.is_match = Some(decision.is_match);
        record.rationale = decision.rationale;
        if !decision.is_match {
            return Ok(());
        }

        let greeting = match self.matcher.compose_greeting(&summary).await {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => self.config.default_greeting.clone(),
            Err(e) => {
                tracing::warn!(job_id = %link.job_id, error = %e, "Greeting generation failed, using default");
                self.config.default_greeting.clone()
            }
        };

        // Nothing reaches the recruiter unless every message can be sent.
        let image_ref = if self.config.send_resume_image {
            Some(self.images.resolve(&link.security_token).await?)
        } else {
            None
        };

        self.limiter.acquire().await;
        let started = self.chat.start_chat(link).await?;
        tracing::info!(job_id = %link.job_id, message = %started.message, "Chat started");

        let recipient = detail.internal_recipient_id;
        self.outbox
            .enqueue(OutboundMessage::text(recipient.clone(), greeting))?;
        if let Some(image_ref) = image_ref {
            self.outbox.enqueue(OutboundMessage::Image {
                recipient_id: recipient,
                security_token: link.security_token.clone(),
                image_ref,
            })?;
        }

        record.outcome = JobOutcome::Applied;
        Ok(())
    }

    /// Errors and timeouts from the match collaborator count as "no match".
    async fn decide(&self, link: &JobLink, summary: &str) -> MatchDecision {
        match tokio::time::timeout(self.config.match_timeout, self.matcher.evaluate(summary)).await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %link.job_id, error = %e, "Match evaluation failed, treating as no match");
                MatchDecision::rejected(None)
            }
            Err(_) => {
                tracing::warn!(job_id = %link.job_id, "Match evaluation timed out, treating as no match");
                MatchDecision::rejected(None)
            }
        }
    }
}

/// Missing configuration or a vanished consumer stops the pipeline.
fn is_fatal(error: &AppError) -> bool {
    matches!(error, AppError::ConfigError(_) | AppError::ChannelClosed(_))
}

/// Consumes scraped batches, evaluates every job concurrently and feeds
/// matched jobs to the outbound chat queue.
pub struct JobEvaluationPipeline<D, M, C, I, S>
where
    D: DetailFetcher,
    M: MatchEvaluator,
    C: ChatInitiator,
    I: ImageSource,
    S: ResultStore,
{
    evaluator: JobEvaluator<D, M, C, I>,
    store: S,
    config: Arc<PipelineConfig>,
}

impl<D, M, C, I, S> JobEvaluationPipeline<D, M, C, I, S>
where
    D: DetailFetcher,
    M: MatchEvaluator,
    C: ChatInitiator,
    I: ImageSource,
    S: ResultStore,
{
    pub fn new(
        detail: D,
        matcher: M,
        chat: C,
        images: I,
        store: S,
        outbox: Outbox,
        config: PipelineConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate, config.burst)?);
        let config = Arc::new(config);
        Ok(Self {
            evaluator: JobEvaluator {
                detail,
                matcher,
                chat,
                images,
                limiter,
                outbox,
                config: config.clone(),
            },
            store,
            config,
        })
    }

    /// Share a limiter with other callers of the same platform.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.evaluator.limiter = limiter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process batches until the producer closes the queue or cancellation.
    pub async fn run<R: PipelineReporter>(
        &self,
        mut batches: BatchReceiver,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        reporter.report(PipelineEvent::Started);

        loop {
            let batch = tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                () = cancel_token.cancelled() => break,
            };

            let InboundBatch { id, jobs, done } = batch;
            let result = self.process_batch(id, jobs, &cancel_token, reporter).await;
            // Release the producer before the slower persistence step.
            done.fire();

            match result {
                Ok(report) => self.persist(&report, reporter).await,
                Err(e) => {
                    tracing::error!(batch_id = id, error = %e, "Pipeline stopping on fatal error");
                    reporter.report(PipelineEvent::Stopped);
                    return Err(e);
                }
            }
        }

        reporter.report(PipelineEvent::Stopped);
        Ok(())
    }

    /// Filter, fan out and join one batch. Returns partial results if the
    /// batch timeout or cancellation fires first.
    pub async fn process_batch<R: PipelineReporter>(
        &self,
        batch_id: u64,
        jobs: Vec<CandidateJob>,
        cancel_token: &CancellationToken,
        reporter: &R,
    ) -> Result<BatchReport, AppError> {
        reporter.report(PipelineEvent::BatchReceived {
            batch_id,
            size: jobs.len(),
        });
        let mut report = BatchReport {
            batch_id,
            received: jobs.len(),
            ..Default::default()
        };

        let jobs = self.filter(jobs, &mut report).await?;
        reporter.report(PipelineEvent::BatchFiltered {
            batch_id,
            kept: jobs.len(),
            salary_rejected: report.salary_rejected,
            already_visited: report.already_visited,
        });

        let mut tasks = JoinSet::new();
        let mut unfinished = HashMap::new();
        for (job, link) in jobs {
            let evaluator = self.evaluator.clone();
            let key = (link.job_id.clone(), job.name.clone());
            let handle = tasks.spawn(evaluator.evaluate(job, link));
            unfinished.insert(handle.id(), key);
        }

        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let record = match joined {
                        Ok((id, Ok(record))) => {
                            unfinished.remove(&id);
                            record
                        }
                        Ok((_, Err(fatal))) => {
                            tasks.shutdown().await;
                            return Err(fatal);
                        }
                        Err(join_err) => {
                            let (job_id, name) = unfinished
                                .remove(&join_err.id())
                                .unwrap_or_else(|| (String::new(), String::new()));
                            tracing::error!(batch_id, %job_id, error = %join_err, "Job task panicked");
                            JobRecord::new(
                                Some(job_id),
                                name,
                                JobOutcome::Failed { error: join_err.to_string() },
                            )
                        }
                    };
                    reporter.report(PipelineEvent::JobFinished { batch_id, record: &record });
                    report.records.push(record);
                }
                () = &mut deadline => {
                    report.timed_out = true;
                    break;
                }
                () = cancel_token.cancelled() => {
                    report.timed_out = true;
                    break;
                }
            }
        }

        if report.timed_out {
            reporter.report(PipelineEvent::BatchTimedOut {
                batch_id,
                unfinished: unfinished.len(),
            });
            tasks.shutdown().await;
            for (job_id, name) in unfinished.into_values() {
                let record = JobRecord::new(Some(job_id), name, JobOutcome::TimedOut);
                reporter.report(PipelineEvent::JobFinished {
                    batch_id,
                    record: &record,
                });
                report.records.push(record);
            }
        }

        reporter.report(PipelineEvent::BatchCompleted { report: &report });
        Ok(report)
    }

    async fn filter(
        &self,
        jobs: Vec<CandidateJob>,
        report: &mut BatchReport,
    ) -> Result<Vec<(CandidateJob, JobLink)>, AppError> {
        let before = jobs.len();
        let jobs = self.config.salary.filter(jobs);
        report.salary_rejected = before - jobs.len();

        let mut kept = Vec::with_capacity(jobs.len());
        for job in jobs {
            let link = match JobLink::parse(&job.detail_link) {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(job = %job.name, error = %e, "Skipping job with invalid link");
                    report.records.push(JobRecord::new(
                        None,
                        &job.name,
                        JobOutcome::Skipped(SkipReason::InvalidLink),
                    ));
                    continue;
                }
            };

            if self.config.skip_visited {
                match self.store.is_visited(&link.job_id).await {
                    Ok(true) => {
                        report.already_visited += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %link.job_id, error = %e, "Visited check failed, evaluating anyway");
                    }
                }
            }
            kept.push((job, link));
        }
        Ok(kept)
    }

    async fn persist<R: PipelineReporter>(&self, report: &BatchReport, reporter: &R) {
        if report.records.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_batch(&report.records).await {
            let error = e.to_string();
            reporter.report(PipelineEvent::PersistFailed {
                batch_id: report.batch_id,
                error: &error,
            });
        }
    }
}
