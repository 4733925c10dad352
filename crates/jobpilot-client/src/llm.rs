use std::time::Duration;

use jobpilot_core::error::AppError;
use jobpilot_core::models::MatchDecision;
use jobpilot_core::retry::RetryPolicy;
use jobpilot_core::traits::MatchEvaluator;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_SYSTEM_PROMPT: &str = "You screen job listings for a candidate. Compare the listing requirements with the candidate's resume and preferences. Answer true if the candidate should apply, false otherwise.";

/// OpenAI-compatible chat model used as the match gate.
///
/// Works with any OpenAI-compatible API, including reasoning models that
/// prefix their answer with a `<think>...</think>` block:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - DeepSeek (`https://api.deepseek.com/v1`)
#[derive(Clone)]
pub struct OpenAiMatchEvaluator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    temperature: f32,
    system_prompt: String,
    resume: String,
    greeting_prompt: Option<String>,
    retry: RetryPolicy,
}

impl OpenAiMatchEvaluator {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(Self {
            client: rebuilt.client,
            timeout_secs: rebuilt.timeout_secs,
            ..self
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Resume text and candidate preferences sent alongside every listing.
    pub fn with_resume(mut self, resume: impl Into<String>) -> Self {
        self.resume = resume.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Enables tailored greetings; without a prompt the pipeline's default
    /// greeting is used.
    pub fn with_greeting_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.greeting_prompt = Some(prompt.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            resume: String::new(),
            greeting_prompt: None,
            retry: RetryPolicy::http(),
        })
    }

    fn request(&self, system_prompt: &str, summary: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message::new("system", system_prompt),
                Message::new("user", format!("岗位要求：{summary}")),
                Message::new("user", format!("用户简历、要求：{}", self.resume)),
            ],
            temperature: self.temperature,
        }
    }

    async fn complete(&self, op: &str, request: &ChatRequest) -> Result<String, AppError> {
        self.retry.run(op, || self.send(request)).await
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code == 429 || status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

impl Message {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Splits a leading `<think>...</think>` block from the answer.
fn split_reasoning(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("<think>") else {
        return (None, content);
    };
    match rest.find("</think>") {
        Some(end) => (Some(rest[..end].trim()), &rest[end + "</think>".len()..]),
        None => (None, content),
    }
}

fn parse_verdict(content: &str) -> MatchDecision {
    let lowered = content.to_lowercase();
    let (reasoning, answer) = split_reasoning(&lowered);
    let rationale = reasoning.filter(|r| !r.is_empty()).map(str::to_string);
    if answer.contains("true") {
        MatchDecision::matched(rationale)
    } else {
        MatchDecision::rejected(rationale)
    }
}

impl MatchEvaluator for OpenAiMatchEvaluator {
    async fn evaluate(&self, summary: &str) -> Result<MatchDecision, AppError> {
        let request = self.request(&self.system_prompt, summary);
        let content = self.complete("match", &request).await?;
        let decision = parse_verdict(&content);
        tracing::debug!(
            is_match = decision.is_match,
            reasoned = decision.rationale.is_some(),
            "LLM verdict"
        );
        Ok(decision)
    }

    async fn compose_greeting(&self, summary: &str) -> Result<Option<String>, AppError> {
        let Some(prompt) = &self.greeting_prompt else {
            return Ok(None);
        };
        let request = self.request(prompt, summary);
        let content = self.complete("greeting", &request).await?;
        let greeting = split_reasoning(&content).1.trim();
        Ok((!greeting.is_empty()).then(|| greeting.to_string()))
    }
}
