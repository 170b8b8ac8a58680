//! Endpoint Credentials
//!
//! Resolves the MQTT username/password for an endpoint. Platform mode logs
//! the account in over the REST API and connects with the issued user token.

use std::fmt;

use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AuthMode, EndpointConfig};

/// Path of the user login endpoint, relative to the platform URL
pub const USER_AUTH_PATH: &str = "/api/v/1/user/auth";

/// Header carrying the system key
pub const SYSTEM_KEY_HEADER: &str = "ClearBlade-SystemKey";

/// Header carrying the system secret
pub const SYSTEM_SECRET_HEADER: &str = "ClearBlade-SystemSecret";

/// Authentication errors
#[derive(Debug)]
pub enum AuthError {
    /// HTTP request failed
    Http(reqwest::Error),
    /// Platform answered with a non-success status
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    /// Login reply carried no user token
    MissingToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Http(e) => write!(f, "http request failed: {}", e),
            AuthError::UnexpectedStatus { status, body } => {
                write!(f, "unexpected status: {} body={}", status, body)
            }
            AuthError::MissingToken => write!(f, "login reply carried no user token"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Http(e)
    }
}

/// Username and password presented in CONNECT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    user_token: String,
}

/// Resolve the credentials for an endpoint according to its auth mode
pub async fn authenticate(config: &EndpointConfig) -> Result<Credentials, AuthError> {
    match config.auth {
        AuthMode::Anonymous => Ok(Credentials::default()),
        AuthMode::Basic => Ok(Credentials {
            username: Some(config.email.clone()),
            password: Some(Bytes::from(config.password.clone())),
        }),
        AuthMode::Platform => {
            let token = platform_login(config).await?;
            Ok(Credentials {
                username: Some(token),
                password: Some(Bytes::from(config.system_key.clone())),
            })
        }
    }
}

async fn platform_login(config: &EndpointConfig) -> Result<String, AuthError> {
    let http = Client::builder().timeout(config.connect_timeout).build()?;
    let url = format!(
        "{}{}",
        config.platform_url.trim_end_matches('/'),
        USER_AUTH_PATH
    );

    debug!("{}: Authenticating against {}", config.name, url);

    let res = http
        .post(url)
        .header(SYSTEM_KEY_HEADER, &config.system_key)
        .header(SYSTEM_SECRET_HEADER, &config.system_secret)
        .json(&LoginRequest {
            email: &config.email,
            password: &config.password,
        })
        .send()
        .await?;

    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(AuthError::UnexpectedStatus { status, body });
    }

    let login: LoginResponse = res.json().await?;
    if login.user_token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(login.user_token)
}
