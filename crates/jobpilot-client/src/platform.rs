//! Recruiting-platform web API.
//!
//! Every endpoint answers `{"code": 0, "message": "...", "zpData": {...}}`.
//! A non-zero code is an application-level failure; code 7 means the login
//! session is gone.

use std::sync::Arc;
use std::time::Duration;

use jobpilot_core::models::{ChatStarted, Identity, JobDetail, RequirementFields};
use jobpilot_core::traits::{ChatInitiator, DetailFetcher, SessionAuthority};
use jobpilot_core::{AppError, CredentialStore, JobLink, RetryPolicy};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

const JOB_CARD_PATH: &str = "/wapi/zpgeek/job/card.json";
const ADD_FRIEND_PATH: &str = "/wapi/zpgeek/friend/add.json";
const USER_INFO_PATH: &str = "/wapi/zpuser/wap/getUserInfo.json";
const WT2_PATH: &str = "/wapi/zppassport/get/wt";

const SESSION_EXPIRED_CODE: i64 = 7;

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://www.zhipin.com/").expect("static base URL is valid"),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::http(),
        }
    }
}

impl PlatformConfig {
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        self.base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid platform URL {base_url}: {e}")))?;
        Ok(self)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::ConfigError(format!("Invalid endpoint {path}: {e}")))
    }
}

/// Platform API over the shared credential store.
///
/// Pipeline-side calls (job detail, chat start) use the cooperative client;
/// chat-thread calls (identity, wt2) use the synchronous one.
#[derive(Clone)]
pub struct PlatformApi {
    credentials: Arc<CredentialStore>,
    config: PlatformConfig,
}

impl PlatformApi {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self::with_config(credentials, PlatformConfig::default())
    }

    pub fn with_config(credentials: Arc<CredentialStore>, config: PlatformConfig) -> Self {
        Self {
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    async fn cooperative_get(
        &self,
        op: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, AppError> {
        let url = self.config.endpoint(path)?;
        self.config
            .retry
            .run(op, || {
                let url = url.clone();
                async move {
                    let client = self.credentials.cooperative_client().await?;
                    let request = client
                        .get(url)
                        .query(query)
                        .timeout(self.config.request_timeout);
                    send_json(request, self.config.request_timeout).await
                }
            })
            .await
    }

    async fn sync_get(&self, op: &str, path: &str) -> Result<Value, AppError> {
        let url = self.config.endpoint(path)?;
        self.config
            .retry
            .run(op, || {
                let url = url.clone();
                async move {
                    let client = self.credentials.sync_client()?;
                    let request = client.get(url).timeout(self.config.request_timeout);
                    send_json(request, self.config.request_timeout).await
                }
            })
            .await
    }
}

impl DetailFetcher for PlatformApi {
    async fn fetch_detail(&self, link: &JobLink) -> Result<JobDetail, AppError> {
        let body = self
            .cooperative_get(
                "job_card",
                JOB_CARD_PATH,
                &[
                    ("securityId", link.security_token.as_str()),
                    ("lid", link.list_id.as_str()),
                ],
            )
            .await?;
        parse_detail(body)
    }
}

impl ChatInitiator for PlatformApi {
    async fn start_chat(&self, link: &JobLink) -> Result<ChatStarted, AppError> {
        let body = self
            .cooperative_get(
                "start_chat",
                ADD_FRIEND_PATH,
                &[
                    ("securityId", link.security_token.as_str()),
                    ("jobId", link.job_id.as_str()),
                    ("lid", link.list_id.as_str()),
                ],
            )
            .await?;
        check_code("start_chat", &body)?;
        Ok(ChatStarted {
            message: message_of(&body).to_string(),
        })
    }
}

impl SessionAuthority for PlatformApi {
    async fn identity(&self) -> Result<Identity, AppError> {
        let body = self.sync_get("user_info", USER_INFO_PATH).await?;
        parse_identity(&body)
    }

    async fn negotiation_token(&self) -> Result<String, AppError> {
        let body = self.sync_get("wt2", WT2_PATH).await?;
        parse_wt2(&body)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobCardData {
    job_card: JobCard,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobCard {
    job_name: String,
    #[serde(default)]
    brand_name: String,
    #[serde(default)]
    post_description: String,
    #[serde(default)]
    experience_name: String,
    #[serde(default)]
    degree_name: String,
    #[serde(default)]
    active_time_desc: String,
    #[serde(default)]
    encrypt_user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    user_id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    token: String,
    true_man: Option<bool>,
}

#[derive(Deserialize)]
struct Wt2Data {
    #[serde(default)]
    wt2: String,
}

pub(crate) fn parse_detail(body: Value) -> Result<JobDetail, AppError> {
    let card = data_of::<JobCardData>("job_card", &body)?.job_card;
    if card.encrypt_user_id.is_empty() {
        return Err(AppError::MissingField("jobCard.encryptUserId".into()));
    }
    Ok(JobDetail {
        activity_recency_label: card.active_time_desc,
        description: card.post_description,
        requirements: RequirementFields {
            company: card.brand_name,
            title: card.job_name,
            experience: card.experience_name,
            degree: card.degree_name,
        },
        internal_recipient_id: card.encrypt_user_id,
        raw: body,
    })
}

fn parse_identity(body: &Value) -> Result<Identity, AppError> {
    let info = data_of::<UserInfo>("user_info", body)?;
    if info.token.is_empty() {
        return Err(AppError::SessionExpired(
            "User info carries no session token".into(),
        ));
    }
    if info.true_man == Some(false) {
        tracing::warn!(uid = info.user_id, "Account is flagged by the platform");
    }
    tracing::info!(uid = info.user_id, name = %info.name, "Resolved account identity");
    Ok(Identity {
        uid: info.user_id,
        token: info.token,
    })
}

fn parse_wt2(body: &Value) -> Result<String, AppError> {
    let data = data_of::<Wt2Data>("wt2", body)?;
    if data.wt2.is_empty() {
        return Err(AppError::AuthError("Platform returned an empty wt2".into()));
    }
    Ok(data.wt2)
}

/// Check `code` and decode `zpData` into `T`.
pub(crate) fn data_of<T: DeserializeOwned>(op: &str, body: &Value) -> Result<T, AppError> {
    check_code(op, body)?;
    let data = body
        .get("zpData")
        .filter(|v| !v.is_null())
        .ok_or_else(|| AppError::MissingField(format!("{op}: zpData")))?;
    T::deserialize(data).map_err(|e| AppError::MissingField(format!("{op}: {e}")))
}

pub(crate) fn check_code(op: &str, body: &Value) -> Result<(), AppError> {
    let code = body
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| AppError::MissingField(format!("{op}: code")))?;
    match code {
        0 => Ok(()),
        SESSION_EXPIRED_CODE => Err(AppError::SessionExpired(format!(
            "{op}: {}",
            message_of(body)
        ))),
        other => Err(AppError::ProtocolError(format!(
            "{op} returned code {other}: {}",
            message_of(body)
        ))),
    }
}

fn message_of(body: &Value) -> &str {
    body.get("message").and_then(Value::as_str).unwrap_or("")
}

pub(crate) async fn send_json(
    request: RequestBuilder,
    timeout: Duration,
) -> Result<Value, AppError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        return Err(AppError::from_status(status.as_u16(), snippet));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to parse response body: {e}")))
}
