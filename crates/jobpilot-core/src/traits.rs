use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::link::JobLink;
use crate::models::{ChatStarted, Identity, ImageRef, JobDetail, JobRecord, MatchDecision};

/// Fetches the full listing record from the platform's detail API.
pub trait DetailFetcher: Send + Sync + Clone + 'static {
    fn fetch_detail(&self, link: &JobLink)
    -> impl Future<Output = Result<JobDetail, AppError>> + Send;
}

/// Decides whether a listing matches the candidate.
pub trait MatchEvaluator: Send + Sync + Clone + 'static {
    /// Evaluates a plain-text requirement summary.
    fn evaluate(&self, summary: &str)
    -> impl Future<Output = Result<MatchDecision, AppError>> + Send;

    /// Optionally writes a tailored opening message for a matched listing.
    fn compose_greeting(
        &self,
        summary: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send {
        let _ = summary;
        async { Ok(None) }
    }
}

/// Opens a conversation with the recruiter of a listing.
pub trait ChatInitiator: Send + Sync + Clone + 'static {
    fn start_chat(&self, link: &JobLink)
    -> impl Future<Output = Result<ChatStarted, AppError>> + Send;
}

/// Resolves the resume image for a conversation, uploading it if needed.
pub trait ImageSource: Send + Sync + Clone + 'static {
    fn resolve(&self, security_token: &str)
    -> impl Future<Output = Result<ImageRef, AppError>> + Send;
}

/// Persists per-job results and answers "already visited" queries.
pub trait ResultStore: Send + Sync + Clone + 'static {
    fn is_visited(&self, job_id: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn save_batch(&self, records: &[JobRecord])
    -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Resolves the account identity and the per-connection negotiation value
/// the chat backend requires.
pub trait SessionAuthority: Send + Sync + Clone + 'static {
    fn identity(&self) -> impl Future<Output = Result<Identity, AppError>> + Send;

    fn negotiation_token(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Placeholder image source for runs that never send the resume image.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImageSource;

impl ImageSource for NoImageSource {
    async fn resolve(&self, _security_token: &str) -> Result<ImageRef, AppError> {
        Err(AppError::ConfigError(
            "Resume image delivery is enabled but no image source is configured".into(),
        ))
    }
}

/// In-process result store: remembers visited job ids and every saved record.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    visited: Arc<Mutex<HashSet<String>>>,
    records: Arc<Mutex<Vec<JobRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl ResultStore for MemoryStore {
    async fn is_visited(&self, job_id: &str) -> Result<bool, AppError> {
        Ok(self
            .visited
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(job_id))
    }

    async fn save_batch(&self, records: &[JobRecord]) -> Result<(), AppError> {
        let mut visited = self.visited.lock().unwrap_or_else(|p| p.into_inner());
        visited.extend(records.iter().filter_map(|r| r.job_id.clone()));
        drop(visited);
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(records);
        Ok(())
    }
}
