use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;
use url::Url;

use crate::auth::ApiVersion;

const PRODUCTION_URL: &str = "https://api.athenahealth.com/";
const PREVIEW_URL: &str = "https://api.preview.platform.athenahealth.com/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unrecognized API version {0:?} (expected v1, preview1 or openpreview1)")]
    UnknownVersion(String),
    #[error("Environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("Invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
    #[error("Invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Which hosted API instance to talk to.
///
/// This only picks the host. The token endpoint always comes from the
/// [`ApiVersion`] table, so `Preview` with `preview1` authenticates at
/// `/oauthpreview/token` on the preview host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Preview,
}

impl Environment {
    /// Root URL of the hosted instance.
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Production => PRODUCTION_URL,
            Self::Preview => PREVIEW_URL,
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Production),
            "preview" => Ok(Self::Preview),
            _ => Err(ConfigError::InvalidValue {
                var: ENV_ENVIRONMENT,
                value: s.to_string(),
            }),
        }
    }
}

pub const ENV_VERSION: &str = "ATHENA_API_VERSION";
pub const ENV_KEY: &str = "ATHENA_API_KEY";
pub const ENV_SECRET: &str = "ATHENA_API_SECRET";
pub const ENV_ENVIRONMENT: &str = "ATHENA_ENVIRONMENT";
pub const ENV_BASE_URL: &str = "ATHENA_BASE_URL";
pub const ENV_PRACTICE_ID: &str = "ATHENA_PRACTICE_ID";
pub const ENV_SCOPE: &str = "ATHENA_SCOPE";
pub const ENV_TIMEOUT_SECS: &str = "ATHENA_TIMEOUT_SECS";

/// Everything needed to open an [`ApiConnection`](crate::ApiConnection).
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub version: ApiVersion,
    pub key: String,
    pub secret: String,
    /// Initial practice id; can be changed later on the connection.
    pub practice_id: Option<String>,
    /// Optional OAuth scope sent with the token request.
    pub scope: Option<String>,
    /// Whole-request timeout. `None` keeps the transport default.
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl ApiConfig {
    /// Create a production config for the given version tag and credentials.
    ///
    /// Fails with [`ConfigError::UnknownVersion`] unless `version` is one of
    /// `v1`, `preview1` or `openpreview1`.
    pub fn new(version: &str, key: &str, secret: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: Url::parse(Environment::Production.base_url())?,
            version: version.parse()?,
            key: key.to_string(),
            secret: secret.to_string(),
            practice_id: None,
            scope: None,
            timeout: None,
            connect_timeout: None,
        })
    }

    /// Point at a different host, e.g. a gateway or a local mock server.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = Url::parse(base_url)?;
        Ok(self)
    }

    /// Use the base URL of a hosted [`Environment`].
    pub fn with_environment(self, environment: Environment) -> Result<Self, ConfigError> {
        self.with_base_url(environment.base_url())
    }

    /// Set the practice id the connection starts with.
    pub fn with_practice_id(mut self, practice_id: impl ToString) -> Self {
        self.practice_id = Some(practice_id.to_string());
        self
    }

    /// Request `scope` alongside `grant_type=client_credentials`.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Limit each HTTP request, including the token exchange, to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Limit how long establishing a TCP/TLS connection may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build a config from `ATHENA_*` environment variables.
    ///
    /// `ATHENA_API_KEY` and `ATHENA_API_SECRET` are required. The version
    /// defaults to `v1` and the environment to production; `ATHENA_BASE_URL`
    /// takes precedence over `ATHENA_ENVIRONMENT` when both are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let version = env_opt(ENV_VERSION).unwrap_or_else(|| "v1".to_string());
        let key = env_opt(ENV_KEY).ok_or(ConfigError::MissingVar(ENV_KEY))?;
        let secret = env_opt(ENV_SECRET).ok_or(ConfigError::MissingVar(ENV_SECRET))?;

        let mut config = Self::new(&version, &key, &secret)?;

        if let Some(environment) = env_opt(ENV_ENVIRONMENT) {
            config = config.with_environment(environment.parse()?)?;
        }
        if let Some(base_url) = env_opt(ENV_BASE_URL) {
            config = config.with_base_url(&base_url)?;
        }
        config.practice_id = env_opt(ENV_PRACTICE_ID);
        config.scope = env_opt(ENV_SCOPE);

        if let Some(raw) = env_opt(ENV_TIMEOUT_SECS) {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_TIMEOUT_SECS,
                value: raw.clone(),
            })?;
            config.timeout = Some(Duration::from_secs(secs));
        }

        info!(
            base_url = %config.base_url,
            version = %config.version,
            practice_id = config.practice_id.as_deref().unwrap_or(""),
            "loaded API config from environment"
        );
        Ok(config)
    }
}

/// Read an env var, treating an empty value as unset.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("version", &self.version)
            .field("key", &self.key)
            .field("practice_id", &self.practice_id)
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
