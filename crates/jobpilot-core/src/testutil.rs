//! Test utilities: mock implementations of all collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::link::JobLink;
use crate::models::{
    ChatStarted, Identity, ImageRef, JobDetail, JobRecord, MatchDecision, RequirementFields,
};
use crate::pipeline::{PipelineEvent, PipelineReporter};
use crate::traits::{
    ChatInitiator, DetailFetcher, ImageSource, MatchEvaluator, ResultStore, SessionAuthority,
};

// ---------------------------------------------------------------------------
// MockDetailFetcher
// ---------------------------------------------------------------------------

/// Returns an active, well-formed detail for every job unless told
/// otherwise. The recipient id is `boss-<job_id>`.
#[derive(Clone, Default)]
pub struct MockDetailFetcher {
    labels: Arc<Mutex<HashMap<String, String>>>,
    errors: Arc<Mutex<HashMap<String, AppError>>>,
    hangs: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockDetailFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `label` as the recruiter activity for `job_id`.
    pub fn with_label(self, job_id: &str, label: &str) -> Self {
        self.labels
            .lock()
            .unwrap()
            .insert(job_id.to_string(), label.to_string());
        self
    }

    /// Fail the first fetch of `job_id`.
    pub fn with_error(self, job_id: &str, error: AppError) -> Self {
        self.errors.lock().unwrap().insert(job_id.to_string(), error);
        self
    }

    /// Never return for `job_id`.
    pub fn with_hang(self, job_id: &str) -> Self {
        self.hangs.lock().unwrap().insert(job_id.to_string());
        self
    }

    /// Job ids fetched, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn detail_for(job_id: &str, label: &str) -> JobDetail {
        JobDetail {
            activity_recency_label: label.to_string(),
            description: format!("Maintain the {job_id} services in Rust"),
            requirements: RequirementFields {
                company: "Acme".into(),
                title: format!("Engineer {job_id}"),
                experience: "3-5年".into(),
                degree: "本科".into(),
            },
            internal_recipient_id: format!("boss-{job_id}"),
            raw: serde_json::json!({ "jobId": job_id, "activeTimeDesc": label }),
        }
    }
}

impl DetailFetcher for MockDetailFetcher {
    async fn fetch_detail(&self, link: &JobLink) -> Result<JobDetail, AppError> {
        let job_id = link.job_id.clone();
        self.calls.lock().unwrap().push(job_id.clone());

        let hang = self.hangs.lock().unwrap().contains(&job_id);
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.errors.lock().unwrap().remove(&job_id) {
            return Err(error);
        }
        let label = self
            .labels
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_else(|| "刚刚活跃".to_string());
        Ok(Self::detail_for(&job_id, &label))
    }
}

// ---------------------------------------------------------------------------
// MockMatchEvaluator
// ---------------------------------------------------------------------------

/// Match evaluator with a fixed verdict.
#[derive(Clone)]
pub struct MockMatchEvaluator {
    verdict: bool,
    error: Arc<Mutex<Option<AppError>>>,
    greeting: Option<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockMatchEvaluator {
    pub fn always(verdict: bool) -> Self {
        Self {
            verdict,
            error: Arc::new(Mutex::new(None)),
            greeting: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails the first evaluation, then rejects.
    pub fn with_error(error: AppError) -> Self {
        let mock = Self::always(false);
        *mock.error.lock().unwrap() = Some(error);
        mock
    }

    pub fn with_greeting(mut self, greeting: &str) -> Self {
        self.greeting = Some(greeting.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Requirement summaries received, in call order.
    pub fn summaries(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl MatchEvaluator for MockMatchEvaluator {
    async fn evaluate(&self, summary: &str) -> Result<MatchDecision, AppError> {
        self.calls.lock().unwrap().push(summary.to_string());
        if let Some(error) = self.error.lock().unwrap().take() {
            return Err(error);
        }
        let rationale = Some(format!("mock verdict {}", self.verdict));
        Ok(MatchDecision {
            is_match: self.verdict,
            rationale,
        })
    }

    async fn compose_greeting(&self, _summary: &str) -> Result<Option<String>, AppError> {
        Ok(self.greeting.clone())
    }
}

// ---------------------------------------------------------------------------
// MockChatInitiator
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockChatInitiator {
    started: Arc<Mutex<Vec<String>>>,
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockChatInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(error: AppError) -> Self {
        let mock = Self::default();
        *mock.error.lock().unwrap() = Some(error);
        mock
    }

    /// Job ids a chat was started for.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

impl ChatInitiator for MockChatInitiator {
    async fn start_chat(&self, link: &JobLink) -> Result<ChatStarted, AppError> {
        if let Some(error) = self.error.lock().unwrap().take() {
            return Err(error);
        }
        self.started.lock().unwrap().push(link.job_id.clone());
        Ok(ChatStarted {
            message: "Success".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockImageSource
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockImageSource {
    image: ImageRef,
    calls: Arc<Mutex<Vec<String>>>,
    failing: bool,
}

impl MockImageSource {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            calls: Arc::new(Mutex::new(Vec::new())),
            failing: false,
        }
    }

    /// Every `resolve` fails with a retryable upload error.
    pub fn failing(image: ImageRef) -> Self {
        Self {
            failing: true,
            ..Self::new(image)
        }
    }

    /// Security tokens passed to `resolve`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageSource for MockImageSource {
    async fn resolve(&self, security_token: &str) -> Result<ImageRef, AppError> {
        self.calls.lock().unwrap().push(security_token.to_string());
        if self.failing {
            return Err(AppError::from_status(503, "upload unavailable"));
        }
        Ok(self.image.clone())
    }
}

// ---------------------------------------------------------------------------
// MockResultStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockResultStore {
    visited: Arc<Mutex<HashSet<String>>>,
    saved: Arc<Mutex<Vec<Vec<JobRecord>>>>,
    fail_saves: bool,
}

impl MockResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visited<I: IntoIterator<Item = &'static str>>(self, ids: I) -> Self {
        self.visited
            .lock()
            .unwrap()
            .extend(ids.into_iter().map(str::to_string));
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn saved_batches(&self) -> Vec<Vec<JobRecord>> {
        self.saved.lock().unwrap().clone()
    }
}

impl ResultStore for MockResultStore {
    async fn is_visited(&self, job_id: &str) -> Result<bool, AppError> {
        Ok(self.visited.lock().unwrap().contains(job_id))
    }

    async fn save_batch(&self, records: &[JobRecord]) -> Result<(), AppError> {
        if self.fail_saves {
            return Err(AppError::Generic("mock store is read-only".into()));
        }
        self.saved.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSessionAuthority
// ---------------------------------------------------------------------------

/// Identity is fixed; every negotiation call returns a fresh `wt2-<n>`.
#[derive(Clone)]
pub struct MockSessionAuthority {
    identity: Identity,
    identity_errors: Arc<Mutex<Vec<AppError>>>,
    negotiation_calls: Arc<Mutex<u32>>,
    identity_calls: Arc<Mutex<u32>>,
}

impl MockSessionAuthority {
    pub fn new(uid: i64, token: &str) -> Self {
        Self {
            identity: Identity {
                uid,
                token: token.to_string(),
            },
            identity_errors: Arc::new(Mutex::new(Vec::new())),
            negotiation_calls: Arc::new(Mutex::new(0)),
            identity_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue errors returned by the next identity lookups.
    pub fn with_identity_errors(self, errors: Vec<AppError>) -> Self {
        *self.identity_errors.lock().unwrap() = errors;
        self
    }

    pub fn negotiation_calls(&self) -> u32 {
        *self.negotiation_calls.lock().unwrap()
    }

    pub fn identity_calls(&self) -> u32 {
        *self.identity_calls.lock().unwrap()
    }
}

impl SessionAuthority for MockSessionAuthority {
    async fn identity(&self) -> Result<Identity, AppError> {
        *self.identity_calls.lock().unwrap() += 1;
        let mut errors = self.identity_errors.lock().unwrap();
        if !errors.is_empty() {
            return Err(errors.remove(0));
        }
        Ok(self.identity.clone())
    }

    async fn negotiation_token(&self) -> Result<String, AppError> {
        let mut calls = self.negotiation_calls.lock().unwrap();
        *calls += 1;
        Ok(format!("wt2-{calls}"))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records a short tag for every pipeline event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn finished_jobs(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("job_finished"))
            .count()
    }

    pub fn stopped(&self) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == "stopped")
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let tag = match event {
            PipelineEvent::Started => "started".to_string(),
            PipelineEvent::BatchReceived { batch_id, size } => {
                format!("batch_received:{batch_id}:{size}")
            }
            PipelineEvent::BatchFiltered { batch_id, kept, .. } => {
                format!("batch_filtered:{batch_id}:{kept}")
            }
            PipelineEvent::JobFinished { batch_id, record } => {
                format!("job_finished:{batch_id}:{}", record.outcome)
            }
            PipelineEvent::BatchTimedOut {
                batch_id,
                unfinished,
            } => format!("batch_timed_out:{batch_id}:{unfinished}"),
            PipelineEvent::BatchCompleted { report } => {
                format!("batch_completed:{}", report.batch_id)
            }
            PipelineEvent::PersistFailed { batch_id, .. } => format!("persist_failed:{batch_id}"),
            PipelineEvent::Stopped => "stopped".to_string(),
        };
        self.events.lock().unwrap().push(tag);
    }
}
