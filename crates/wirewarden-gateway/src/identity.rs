//! External identity/session client (spec §1 "identity/session service").
//!
//! Grounded on the donor's upstream bearer-auth fetch pattern: a plain GET
//! with a bearer token, 401 mapped to `Unauthorized`, any other non-2xx
//! mapped to `Upstream` carrying the response body.

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("identity service error: {0}")]
    Upstream(String),
}

/// A resolved user, as returned by the identity service.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ResolvedUser {
    pub id: String,
    pub username: String,
}

/// A session token plus the user it resolved to, returned by a successful login.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Session {
    pub token: String,
    pub user: ResolvedUser,
}

pub trait IdentityClient: Send + Sync {
    fn validate_token(&self, token: &str) -> BoxFuture<'_, Result<ResolvedUser, IdentityError>>;

    /// Exchange a username/password for a session (spec §4.11's rate limiter
    /// guards this call; credential storage itself lives in the identity service).
    fn login(&self, username: &str, password: &str) -> BoxFuture<'_, Result<Session, IdentityError>>;
}

pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: String, service_token: String) -> Self {
        Self { http: reqwest::Client::new(), base_url, service_token }
    }
}

impl IdentityClient for HttpIdentityClient {
    fn validate_token(&self, token: &str) -> BoxFuture<'_, Result<ResolvedUser, IdentityError>> {
        let token = token.to_string();
        Box::pin(async move {
            let url = format!("{}/sessions/validate", self.base_url.trim_end_matches('/'));
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.service_token)
                .header("X-Session-Token", token)
                .send()
                .await
                .map_err(|err| IdentityError::Upstream(err.to_string()))?;

            match response.status() {
                status if status.is_success() => response
                    .json::<ResolvedUser>()
                    .await
                    .map_err(|err| IdentityError::Upstream(err.to_string())),
                reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                    Err(IdentityError::Unauthorized)
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    Err(IdentityError::Upstream(format!("{status}: {body}")))
                }
            }
        })
    }

    fn login(&self, username: &str, password: &str) -> BoxFuture<'_, Result<Session, IdentityError>> {
        let username = username.to_string();
        let password = password.to_string();
        Box::pin(async move {
            let url = format!("{}/sessions", self.base_url.trim_end_matches('/'));
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.service_token)
                .json(&serde_json::json!({ "username": username, "password": password }))
                .send()
                .await
                .map_err(|err| IdentityError::Upstream(err.to_string()))?;

            match response.status() {
                status if status.is_success() => response
                    .json::<Session>()
                    .await
                    .map_err(|err| IdentityError::Upstream(err.to_string())),
                reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                    Err(IdentityError::Unauthorized)
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    Err(IdentityError::Upstream(format!("{status}: {body}")))
                }
            }
        })
    }
}
