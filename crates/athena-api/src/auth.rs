use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use tracing::{debug, info};
use url::{Url, form_urlencoded};

use crate::client::{ApiError, FORM_CONTENT_TYPE};
use crate::config::{ApiConfig, ConfigError};
use crate::path::join_path;

/// API versions the token service knows about.
///
/// Each version authenticates against its own OAuth prefix:
///
/// | tag            | token endpoint                  |
/// |----------------|---------------------------------|
/// | `v1`           | `/oauth/token`                  |
/// | `preview1`     | `/oauthpreview/token`           |
/// | `openpreview1` | `/oauthopenpreview/token`       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    V1,
    Preview1,
    OpenPreview1,
}

impl ApiVersion {
    /// The tag used as the first segment of every resource path.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::Preview1 => "preview1",
            Self::OpenPreview1 => "openpreview1",
        }
    }

    pub fn auth_prefix(self) -> &'static str {
        match self {
            Self::V1 => "/oauth",
            Self::Preview1 => "/oauthpreview",
            Self::OpenPreview1 => "/oauthopenpreview",
        }
    }
}

impl FromStr for ApiVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_matches('/') {
            "v1" => Ok(Self::V1),
            "preview1" => Ok(Self::Preview1),
            "openpreview1" => Ok(Self::OpenPreview1),
            _ => Err(ConfigError::UnknownVersion(s.to_string())),
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode `key:secret` for an HTTP Basic `Authorization` header.
pub fn basic_credentials(key: &str, secret: &str) -> String {
    STANDARD.encode(format!("{key}:{secret}"))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// `{base_url}{auth_prefix}/token` for the configured version.
pub(crate) fn token_url(config: &ApiConfig) -> Url {
    let mut url = config.base_url.clone();
    url.set_path(&join_path([
        config.base_url.path(),
        config.version.auth_prefix(),
        "token",
    ]));
    url.set_query(None);
    url
}

/// Run the client-credentials exchange and return the new bearer token.
///
/// The HTTP status is not checked. Whatever comes back is decoded as JSON
/// and only then inspected for `access_token`.
pub(crate) async fn fetch_token(
    http: &reqwest::Client,
    config: &ApiConfig,
) -> Result<String, ApiError> {
    let url = token_url(config);

    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair("grant_type", "client_credentials");
    if let Some(scope) = config.scope.as_deref() {
        form.append_pair("scope", scope);
    }

    let mut basic = HeaderValue::from_str(&format!(
        "Basic {}",
        basic_credentials(&config.key, &config.secret)
    ))?;
    basic.set_sensitive(true);

    debug!(path = url.path(), version = %config.version, "requesting access token");
    let resp = http
        .post(url)
        .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
        .header(AUTHORIZATION, basic)
        .body(form.finish())
        .send()
        .await?;

    let status = resp.status();
    let raw = resp.bytes().await?;
    let decoded: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(_) => return Err(ApiError::decode(status, &raw)),
    };

    match serde_json::from_value::<TokenResponse>(decoded) {
        Ok(token) => {
            info!(version = %config.version, "obtained access token");
            Ok(token.access_token)
        }
        Err(_) => Err(ApiError::MissingToken {
            body: String::from_utf8_lossy(&raw).into_owned(),
        }),
    }
}
