//! Credentialed HTTP client that hides `401`s behind a refresh-and-retry.

use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{ClientError, HttpError};
use crate::storage::{KeyValueStore, MemoryStore};

use super::navigator::{login_url, LogNavigator, Navigator};
use super::refresh::{RefreshSettings, Refresher};
use super::signals::RefreshSignals;

pub const LOGOUT_ENDPOINT: &str = "/api/v1/auth/logout";

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
    /// Refresh and retry once on `401`. Forced off for the retry itself.
    pub retry_on_unauthorized: bool,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            query: Vec::new(),
            retry_on_unauthorized: true,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_on_unauthorized = false;
        self
    }
}

/// HTTP client for the TUGO backend. Cheap to clone; clones share cookies
/// and the refresh machinery.
#[derive(Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    base_url: Url,
    cookies: Arc<Jar>,
    refresher: Refresher,
    navigator: Arc<dyn Navigator>,
}

pub struct SessionClientBuilder {
    base_url: Url,
    store: Option<Arc<dyn KeyValueStore>>,
    signals: Option<RefreshSignals>,
    navigator: Option<Arc<dyn Navigator>>,
    cookies: Option<Arc<Jar>>,
    settings: RefreshSettings,
}

impl SessionClientBuilder {
    /// Shared storage for the refresh timestamp and lock. Defaults to a
    /// private in-memory store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Refresh signal hub shared with other contexts in this process.
    pub fn signals(mut self, signals: RefreshSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn cookies(mut self, cookies: Arc<Jar>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn settings(mut self, settings: RefreshSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<SessionClient, ClientError> {
        let cookies = self.cookies.unwrap_or_default();
        let http = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .build()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let refresher = Refresher::new(
            http.clone(),
            &self.base_url,
            store,
            self.signals.unwrap_or_default(),
            self.settings,
        )?;

        Ok(SessionClient {
            http,
            base_url: self.base_url,
            cookies,
            refresher,
            navigator: self
                .navigator
                .unwrap_or_else(|| Arc::new(LogNavigator::new())),
        })
    }
}

impl SessionClient {
    pub fn builder(base_url: Url) -> SessionClientBuilder {
        SessionClientBuilder {
            base_url,
            store: None,
            signals: None,
            navigator: None,
            cookies: None,
            settings: RefreshSettings::default(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Cookie jar holding the session credential; the realtime transport
    /// presents it during its handshake.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.cookies.clone()
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    /// Perform a request and decode the body.
    ///
    /// `Ok(None)` means the backend answered successfully with no content.
    /// A `{ "data": … }` envelope is unwrapped before decoding.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Option<T>, ClientError> {
        let url = self.base_url.join(endpoint)?;

        match self.execute(&url, &options).await {
            Err(ClientError::Http(err)) if err.is_unauthorized() && options.retry_on_unauthorized => {
                tracing::debug!(%url, "unauthorized; attempting session refresh");
                if self.refresher.refresh().await {
                    let retry = options.without_retry();
                    return self.execute(&url, &retry).await;
                }
                self.navigator
                    .redirect(&login_url(&self.navigator.current_location()));
                Err(err.into())
            }
            other => other,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>, ClientError> {
        self.request(endpoint, RequestOptions::get()).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Option<T>, ClientError> {
        let options = RequestOptions::new(Method::POST).with_body(serde_json::to_value(body)?);
        self.request(endpoint, options).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Option<T>, ClientError> {
        let options = RequestOptions::new(Method::PUT).with_body(serde_json::to_value(body)?);
        self.request(endpoint, options).await
    }

    pub async fn patch<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>, ClientError> {
        self.request(endpoint, RequestOptions::new(Method::PATCH)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>, ClientError> {
        self.request(endpoint, RequestOptions::new(Method::DELETE)).await
    }

    /// See [`Refresher::refresh`].
    pub async fn refresh(&self) -> bool {
        self.refresher.refresh().await
    }

    /// See [`Refresher::should_refresh_preemptively`].
    pub async fn should_refresh_preemptively(&self) -> bool {
        self.refresher.should_refresh_preemptively().await
    }

    /// See [`Refresher::refresh_if_stale`].
    pub async fn refresh_if_stale(&self) -> bool {
        self.refresher.refresh_if_stale().await
    }

    pub async fn mark_refreshed(&self) {
        self.refresher.mark_refreshed().await;
    }

    /// End the session server-side (best effort) and forget local refresh
    /// state.
    pub async fn logout(&self) {
        let options = RequestOptions::new(Method::POST).without_retry();
        if let Err(err) = self.request::<Value>(LOGOUT_ENDPOINT, options).await {
            tracing::warn!(%err, "logout request failed");
        }
        self.refresher.clear().await;
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<Option<T>, ClientError> {
        let mut builder = self.http.request(options.method.clone(), url.clone());
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let err = HttpError::from_body(status, &body);
            tracing::debug!(%url, %status, message = %err.message, "request failed");
            return Err(err.into());
        }

        if matches!(status, StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT)
            || response.content_length() == Some(0)
        {
            return Ok(None);
        }

        let bytes = response.bytes().await?;
        decode_body(&bytes)
    }
}

/// Decode a success body: empty means no content, `{ "data": … }` is
/// unwrapped.
pub(crate) fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>, ClientError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(bytes)?;
    Ok(Some(serde_json::from_value(unwrap_data(value))?))
}

fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
