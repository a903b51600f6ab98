use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use crate::auth::{self, ApiVersion};
use crate::config::{ApiConfig, ConfigError};
use crate::path::join_path;

pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// The original attempt plus one retry with a fresh connection and token.
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("API response is not valid JSON ({status} {reason}): {body}")]
    Decode {
        status: u16,
        reason: String,
        body: String,
    },
    #[error("API returned 401 Unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("Token response has no access_token: {body}")]
    MissingToken { body: String },
    #[error("Header value contains invalid characters: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl ApiError {
    /// Build a [`ApiError::Decode`] from a raw body that failed to parse.
    pub(crate) fn decode(status: StatusCode, body: &[u8]) -> Self {
        Self::Decode {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Whether the failure is worth one reconnect, re-authentication and retry.
    ///
    /// Undecodable bodies and 401s are both treated as a stale token. Transport
    /// errors qualify only when the connection broke after it was established;
    /// connect failures and timeouts do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Decode { .. } | Self::Unauthorized { .. } => true,
            Self::Request(e) => {
                !e.is_connect()
                    && !e.is_timeout()
                    && (e.is_request() || e.is_body() || e.is_decode())
            }
            _ => false,
        }
    }

    fn cause(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "undecodable response",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Request(_) => "broken connection",
            _ => "other",
        }
    }
}

/// Ordered request parameters, form-encoded into the query string or body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// An empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.push(key, value);
        self
    }

    /// Append a pair in place.
    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.push((key.into(), value.to_string()));
    }

    /// Whether no pairs have been added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate the pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `application/x-www-form-urlencoded` rendering, in insertion order.
    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.iter())
            .finish()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: ToString, const N: usize> From<[(K, V); N]> for Params {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// A fully described API call, replayable as-is on retry.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Resource path below the version and practice id, e.g. `/departments`.
    pub path: String,
    pub params: Params,
    pub headers: HeaderMap,
}

impl ApiRequest {
    /// A request with no parameters or extra headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Params::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Replace the request parameters.
    pub fn with_params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    /// Set a single header, replacing any previous value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Merge `headers` over the ones already set.
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// POST and PUT carry parameters in a form body; everything else in the query.
    fn params_in_body(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT
    }
}

/// Authenticated connection to the API.
///
/// Opening a connection performs the client-credentials exchange right away,
/// so an `ApiConnection` always holds a token. Every call prepends the API
/// version and, when set, the practice id to the resource path, attaches the
/// bearer token and decodes the JSON body into a [`serde_json::Value`].
///
/// If a response cannot be decoded, comes back 401, or the connection turns
/// out to be broken, the transport is rebuilt, a new token is fetched and the
/// call is sent exactly once more. The second failure is returned as-is.
///
/// Calls take `&mut self`: one connection serves one request at a time.
pub struct ApiConnection {
    config: ApiConfig,
    http: reqwest::Client,
    token: String,
    practice_id: Option<String>,
}

impl ApiConnection {
    /// Build the transport and authenticate.
    pub async fn connect(config: ApiConfig) -> Result<Self, ApiError> {
        let http = build_transport(&config)?;
        let token = auth::fetch_token(&http, &config).await?;
        let practice_id = config.practice_id.clone().filter(|id| !id.is_empty());
        Ok(Self {
            config,
            http,
            token,
            practice_id,
        })
    }

    /// The API version every resource path starts with.
    pub fn version(&self) -> ApiVersion {
        self.config.version
    }

    /// Return the base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.config.base_url
    }

    /// The practice id currently inserted after the version, if any.
    pub fn practice_id(&self) -> Option<&str> {
        self.practice_id.as_deref()
    }

    /// Use `practice_id` for all following calls. An empty id clears it.
    pub fn set_practice_id(&mut self, practice_id: impl ToString) {
        let id = practice_id.to_string();
        self.practice_id = if id.is_empty() { None } else { Some(id) };
    }

    /// Stop inserting a practice id into resource paths.
    pub fn clear_practice_id(&mut self) {
        self.practice_id = None;
    }

    /// The bearer token currently in use.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// GET `/{version}/{practice_id}/{path}?{params}`.
    pub async fn get(
        &mut self,
        path: &str,
        params: Option<&Params>,
        headers: Option<&HeaderMap>,
    ) -> Result<Value, ApiError> {
        self.send(&build_request(Method::GET, path, params, headers))
            .await
    }

    /// POST `/{version}/{practice_id}/{path}` with `params` as a form body.
    pub async fn post(
        &mut self,
        path: &str,
        params: Option<&Params>,
        headers: Option<&HeaderMap>,
    ) -> Result<Value, ApiError> {
        self.send(&build_request(Method::POST, path, params, headers))
            .await
    }

    /// PUT `/{version}/{practice_id}/{path}` with `params` as a form body.
    pub async fn put(
        &mut self,
        path: &str,
        params: Option<&Params>,
        headers: Option<&HeaderMap>,
    ) -> Result<Value, ApiError> {
        self.send(&build_request(Method::PUT, path, params, headers))
            .await
    }

    /// DELETE `/{version}/{practice_id}/{path}?{params}`.
    pub async fn delete(
        &mut self,
        path: &str,
        params: Option<&Params>,
        headers: Option<&HeaderMap>,
    ) -> Result<Value, ApiError> {
        self.send(&build_request(Method::DELETE, path, params, headers))
            .await
    }

    /// Send `request`, retrying once after re-authenticating if needed.
    pub async fn send(&mut self, request: &ApiRequest) -> Result<Value, ApiError> {
        let mut attempt = 1;
        loop {
            let err = match self.dispatch(request, attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= MAX_ATTEMPTS || !err.is_retryable() {
                return Err(err);
            }
            warn!(
                method = %request.method,
                path = %request.path,
                cause = err.cause(),
                "request failed, reconnecting and re-authenticating"
            );
            self.reconnect().await?;
            attempt += 1;
        }
    }

    /// Replace the transport and token together; neither changes on failure.
    async fn reconnect(&mut self) -> Result<(), ApiError> {
        let http = build_transport(&self.config)?;
        let token = auth::fetch_token(&http, &self.config).await?;
        self.http = http;
        self.token = token;
        Ok(())
    }

    fn resource_url(&self, path: &str) -> Url {
        let mut url = self.config.base_url.clone();
        url.set_path(&join_path([
            self.config.base_url.path(),
            self.config.version.as_str(),
            self.practice_id.as_deref().unwrap_or_default(),
            path,
        ]));
        url.set_query(None);
        url
    }

    async fn dispatch(&self, request: &ApiRequest, attempt: u32) -> Result<Value, ApiError> {
        let mut url = self.resource_url(&request.path);

        let mut headers = request.headers.clone();
        if headers.remove(AUTHORIZATION).is_some() {
            warn!(path = %request.path, "ignoring caller-supplied Authorization header");
        }
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let body = if request.params_in_body() {
            headers
                .entry(CONTENT_TYPE)
                .or_insert(HeaderValue::from_static(FORM_CONTENT_TYPE));
            Some(request.params.encode())
        } else {
            if !request.params.is_empty() {
                url.set_query(Some(&request.params.encode()));
            }
            None
        };

        debug!(method = %request.method, path = url.path(), attempt, "dispatching request");
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let resp = builder.send().await?;

        // Invalid UTF-8 is a decode failure, never a lossy success.
        let status = resp.status();
        let raw = resp.bytes().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized {
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(value),
            Err(_) => Err(ApiError::decode(status, &raw)),
        }
    }
}

impl std::fmt::Debug for ApiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConnection")
            .field("base_url", &self.config.base_url.as_str())
            .field("version", &self.config.version)
            .field("practice_id", &self.practice_id)
            .finish_non_exhaustive()
    }
}

fn build_request(
    method: Method,
    path: &str,
    params: Option<&Params>,
    headers: Option<&HeaderMap>,
) -> ApiRequest {
    let mut request = ApiRequest::new(method, path);
    if let Some(params) = params {
        request.params = params.clone();
    }
    if let Some(headers) = headers {
        request.headers = headers.clone();
    }
    request
}

/// A client that keeps at most one idle connection to the API host.
fn build_transport(config: &ApiConfig) -> Result<reqwest::Client, ApiError> {
    let mut builder = reqwest::Client::builder().pool_max_idle_per_host(1);
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    Ok(builder.build()?)
}
