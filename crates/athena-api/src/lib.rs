//! Client for the athenahealth More Disruption Please REST API.
//!
//! [`ApiConnection`] authenticates with OAuth2 client credentials when it is
//! opened, then sends GET/POST/PUT/DELETE calls under
//! `/{version}/{practice_id}/...` and hands back the decoded JSON body.

mod auth;
mod client;
mod config;
mod path;

pub use auth::{ApiVersion, basic_credentials};
pub use client::{ApiConnection, ApiError, ApiRequest, Params};
pub use config::{ApiConfig, ConfigError, Environment};
pub use path::join_path;
