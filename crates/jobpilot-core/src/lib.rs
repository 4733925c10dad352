pub mod batch;
pub mod credentials;
pub mod env;
pub mod error;
pub mod link;
pub mod models;
pub mod outbound;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod salary;
pub mod testutil;
pub mod traits;

pub use batch::{BatchReceiver, BatchSender, InboundBatch, batch_channel};
pub use credentials::{CooperativeClient, CredentialStore, SessionClient};
pub use error::{AppError, ErrorKind};
pub use link::JobLink;
pub use models::{CandidateJob, Credentials, JobDetail, JobOutcome, JobRecord, OutboundMessage};
pub use outbound::{DeliveryTracker, OutboundQueue, Outbox, outbound_channel};
pub use pipeline::{JobEvaluationPipeline, PipelineConfig, TracingPipelineReporter};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use traits::{
    ChatInitiator, DetailFetcher, ImageSource, MatchEvaluator, ResultStore, SessionAuthority,
};
