//! Shared, versioned cookie/header state.
//!
//! Two access paths that never share a lock primitive:
//!
//! - [`CredentialStore::sync_client`] hands out one pooled client built under
//!   a `std` mutex. Updates are written straight into its cookie jar and
//!   header map, so it is never stale.
//! - [`CredentialStore::cooperative_client`] is guarded by a `tokio` mutex.
//!   It rebuilds its client lazily when the generation counter has moved
//!   past the one it was built from.
//!
//! The store is constructed explicitly and shared as `Arc<CredentialStore>`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Url};

use crate::error::AppError;
use crate::models::Credentials;

const DEFAULT_COOKIE_URL: &str = "https://www.zhipin.com/";

/// Settings applied to every client the store builds.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// URL the cookie jar scopes cookies to.
    pub cookie_url: Url,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            cookie_url: Url::parse(DEFAULT_COOKIE_URL).expect("static cookie URL is valid"),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpSettings {
    pub fn with_cookie_url(mut self, url: Url) -> Self {
        self.cookie_url = url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Client for thread-shared callers. Clones share the same jar and headers.
#[derive(Debug, Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    headers: Arc<RwLock<HeaderMap>>,
    cookie_url: Url,
}

impl SessionClient {
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        let headers = self
            .headers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        self.http.request(method, url).headers(headers)
    }

    pub fn get(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Cookie header the jar would send to the platform right now.
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.cookie_url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    fn apply(&self, cookies: &BTreeMap<String, String>, headers: &HeaderMap) {
        for (name, value) in cookies {
            self.jar
                .add_cookie_str(&format!("{name}={value}"), &self.cookie_url);
        }
        let mut current = self.headers.write().unwrap_or_else(|p| p.into_inner());
        for (name, value) in headers {
            current.insert(name.clone(), value.clone());
        }
    }
}

/// Client for the event-loop path, pinned to one credential generation.
#[derive(Debug, Clone)]
pub struct CooperativeClient {
    http: reqwest::Client,
    credentials: Credentials,
}

impl CooperativeClient {
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn generation(&self) -> u64 {
        self.credentials.generation
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn get(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http.get(url)
    }

    pub fn post(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http.post(url)
    }
}

#[derive(Debug)]
struct SyncState {
    credentials: Credentials,
    client: Option<SessionClient>,
    closed: bool,
}

/// Process-lifetime credential state shared by the pipeline and the chat client.
#[derive(Debug)]
pub struct CredentialStore {
    settings: HttpSettings,
    state: Mutex<SyncState>,
    generation: AtomicU64,
    cooperative: tokio::sync::Mutex<Option<CooperativeClient>>,
    rebuilds: AtomicU64,
}

impl CredentialStore {
    pub fn new(initial: Credentials) -> Self {
        Self::with_settings(initial, HttpSettings::default())
    }

    pub fn with_settings(initial: Credentials, settings: HttpSettings) -> Self {
        let generation = initial.generation;
        Self {
            settings,
            state: Mutex::new(SyncState {
                credentials: initial,
                client: None,
                closed: false,
            }),
            generation: AtomicU64::new(generation),
            cooperative: tokio::sync::Mutex::new(None),
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Consistent copy of the current cookies, headers and generation.
    pub fn snapshot(&self) -> Credentials {
        self.lock_state().credentials.clone()
    }

    /// Number of times the cooperative client has been (re)built.
    pub fn cooperative_rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Return the shared synchronous client, building it on first use.
    pub fn sync_client(&self) -> Result<SessionClient, AppError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(closed_error());
        }
        if let Some(client) = &state.client {
            return Ok(client.clone());
        }

        let jar = Arc::new(Jar::default());
        for (name, value) in &state.credentials.cookies {
            jar.add_cookie_str(&format!("{name}={value}"), &self.settings.cookie_url);
        }
        let headers = header_map(&state.credentials.headers)?;
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(self.settings.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        let client = SessionClient {
            http,
            jar,
            headers: Arc::new(RwLock::new(headers)),
            cookie_url: self.settings.cookie_url.clone(),
        };
        state.client = Some(client.clone());
        tracing::debug!(generation = state.credentials.generation, "Built session client");
        Ok(client)
    }

    /// Return a client reflecting the latest credentials, rebuilding the
    /// cached one if the generation has advanced.
    pub async fn cooperative_client(&self) -> Result<CooperativeClient, AppError> {
        let mut cached = self.cooperative.lock().await;
        let current = self.generation();

        if let Some(client) = cached.as_ref()
            && client.generation() == current
        {
            return Ok(client.clone());
        }

        let credentials = {
            let state = self.lock_state();
            if state.closed {
                return Err(closed_error());
            }
            state.credentials.clone()
        };

        let mut headers = header_map(&credentials.headers)?;
        let cookie = credentials.cookie_header();
        if !cookie.is_empty() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| AppError::ConfigError(format!("Invalid cookie value: {e}")))?;
            headers.insert(COOKIE, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.settings.timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        let previous = cached.as_ref().map(CooperativeClient::generation);
        tracing::debug!(
            generation = credentials.generation,
            ?previous,
            "Rebuilt cooperative client"
        );
        let client = CooperativeClient { http, credentials };
        *cached = Some(client.clone());
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        Ok(client)
    }

    /// Merge new cookies and headers, apply them to the sync client and bump
    /// the generation. Returns the new generation.
    pub fn update(
        &self,
        cookies: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
    ) -> Result<u64, AppError> {
        let parsed = header_map(&headers)?;

        let mut state = self.lock_state();
        if state.closed {
            return Err(closed_error());
        }
        if let Some(client) = &state.client {
            client.apply(&cookies, &parsed);
        }
        for (name, value) in headers {
            // Header names are case-insensitive; keep one entry per name.
            state
                .credentials
                .headers
                .retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            state.credentials.headers.insert(name, value);
        }
        state.credentials.cookies.extend(cookies);
        state.credentials.generation += 1;
        let generation = state.credentials.generation;
        self.generation.store(generation, Ordering::Release);
        drop(state);

        tracing::debug!(generation, "Credentials updated");
        Ok(generation)
    }

    /// Release both clients. Safe to call more than once.
    pub async fn close(&self) {
        let mut cooperative = self.cooperative.lock().await;
        cooperative.take();
        let mut state = self.lock_state();
        if !state.closed {
            state.closed = true;
            state.client = None;
            tracing::debug!("Credential store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, AppError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::ConfigError(format!("Invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::ConfigError(format!("Invalid header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn closed_error() -> AppError {
    AppError::ChannelClosed("credential store is closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn store() -> CredentialStore {
        let initial = Credentials {
            cookies: creds(&[("bst", "one")]),
            headers: creds(&[("User-Agent", "jobpilot-test")]),
            generation: 0,
        };
        CredentialStore::new(initial)
    }

    #[tokio::test]
    async fn sync_client_reflects_update_immediately() {
        let store = store();
        let client = store.sync_client().unwrap();
        assert_eq!(client.cookie_header().as_deref(), Some("bst=one"));

        store
            .update(creds(&[("bst", "two")]), creds(&[("user-agent", "ua-2")]))
            .unwrap();

        assert_eq!(client.cookie_header().as_deref(), Some("bst=two"));
        assert_eq!(client.header("User-Agent").as_deref(), Some("ua-2"));
        // A second handle shares the same state.
        let again = store.sync_client().unwrap();
        assert_eq!(again.cookie_header().as_deref(), Some("bst=two"));
    }

    #[tokio::test]
    async fn cooperative_client_rebuilds_only_after_generation_moves() {
        let store = store();
        let first = store.cooperative_client().await.unwrap();
        assert_eq!(first.generation(), 0);
        let cached = store.cooperative_client().await.unwrap();
        assert_eq!(cached.generation(), 0);
        assert_eq!(store.cooperative_rebuilds(), 1);

        let generation = store.update(creds(&[("wt2", "abc")]), BTreeMap::new()).unwrap();
        assert_eq!(generation, 1);
        // Existing handle keeps its pinned credentials until re-fetched.
        assert!(!first.credentials().cookies.contains_key("wt2"));

        let rebuilt = store.cooperative_client().await.unwrap();
        assert_eq!(rebuilt.generation(), 1);
        assert_eq!(rebuilt.credentials().cookies["wt2"], "abc");
        assert_eq!(store.cooperative_rebuilds(), 2);
    }

    #[test]
    fn generation_is_monotonic_and_snapshot_consistent() {
        let store = store();
        let mut last = store.generation();
        for i in 0..5 {
            let g = store
                .update(creds(&[("n", &i.to_string())]), BTreeMap::new())
                .unwrap();
            assert!(g > last);
            last = g;
        }
        let snap = store.snapshot();
        assert_eq!(snap.generation, last);
        assert_eq!(snap.cookies["n"], "4");
        assert_eq!(snap.cookies["bst"], "one");
    }

    #[test]
    fn update_replaces_header_regardless_of_case() {
        let store = store();
        store
            .update(BTreeMap::new(), creds(&[("user-agent", "ua-2")]))
            .unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.headers.len(), 1);
        assert_eq!(snap.header("User-Agent"), Some("ua-2"));
    }

    #[test]
    fn concurrent_updates_never_tear() {
        let store = Arc::new(store());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let v = format!("{t}-{i}");
                        store
                            .update(creds(&[("a", &v), ("b", &v)]), BTreeMap::new())
                            .unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..200 {
            let snap = store.snapshot();
            assert_eq!(snap.cookies.get("a"), snap.cookies.get("b"));
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(store.generation(), 200);
    }

    #[test]
    fn invalid_header_is_config_error() {
        let store = store();
        let err = store
            .update(BTreeMap::new(), creds(&[("bad header", "x")]))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert_eq!(store.generation(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_new_clients() {
        let store = store();
        store.sync_client().unwrap();
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        assert!(store.sync_client().is_err());
        assert!(store.cooperative_client().await.is_err());
    }
}
