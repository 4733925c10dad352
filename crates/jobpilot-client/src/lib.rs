pub mod llm;
pub mod platform;
pub mod upload;

pub use llm::OpenAiMatchEvaluator;
pub use platform::{PlatformApi, PlatformConfig};
pub use upload::ResumeImageUploader;
