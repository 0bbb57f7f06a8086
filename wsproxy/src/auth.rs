//! Request authentication, applied before any query parsing or session
//! state is touched.
//!
//! Basic auth is checked against the configured credentials. Bearer tokens
//! are validated against the configured OpenID Connect provider's userinfo
//! endpoint; token parsing and key handling stay the provider's problem.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::prelude::*;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::api::ProxyError;
use crate::config::{BasicAuthConfig, OpenIdConfig};

pub enum Authenticator {
    Disabled,
    Basic {
        realm: String,
        username: String,
        password: String,
    },
    OpenId(OpenIdValidator),
}

impl Authenticator {
    pub fn from_config(basic: &BasicAuthConfig, openid: &OpenIdConfig) -> anyhow::Result<Self> {
        if openid.openid_connect_enabled {
            let well_known_url = openid
                .openid_connect_well_known_url
                .clone()
                .ok_or_else(|| {
                    anyhow::anyhow!("OPENID_CONNECT_WELL_KNOWN_URL is required when enabled")
                })?;
            return Ok(Authenticator::OpenId(OpenIdValidator::new(
                well_known_url,
                openid.openid_connect_audience.clone(),
            )));
        }
        if basic.basic_auth_enabled {
            let (Some(username), Some(password)) = (
                basic.basic_auth_username.clone(),
                basic.basic_auth_password.clone(),
            ) else {
                anyhow::bail!(
                    "BASIC_AUTH_USERNAME and BASIC_AUTH_PASSWORD are required when enabled"
                );
            };
            return Ok(Authenticator::Basic {
                realm: basic.basic_auth_realm.clone(),
                username,
                password,
            });
        }
        Ok(Authenticator::Disabled)
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        match self {
            Authenticator::Disabled => Ok(()),
            Authenticator::Basic {
                realm,
                username,
                password,
            } => {
                let (given_user, given_password) = basic_credentials(headers)?;
                if given_user == *username && given_password == *password {
                    Ok(())
                } else {
                    debug!(realm, "basic auth rejected for user {given_user}");
                    Err(ProxyError::AuthenticationFailed)
                }
            }
            Authenticator::OpenId(validator) => {
                let token = bearer_token(headers)?;
                validator.validate(token).await
            }
        }
    }
}

fn authorization(headers: &HeaderMap) -> Result<&str, ProxyError> {
    headers
        .get(AUTHORIZATION)
        .ok_or(ProxyError::AuthenticationMissing)?
        .to_str()
        .map_err(|_| ProxyError::AuthenticationFailed)
}

fn basic_credentials(headers: &HeaderMap) -> Result<(String, String), ProxyError> {
    let value = authorization(headers)?;
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or(ProxyError::AuthenticationMissing)?;
    let decoded = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| ProxyError::AuthenticationFailed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ProxyError::AuthenticationFailed)?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or(ProxyError::AuthenticationFailed)?;
    Ok((user.to_string(), password.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ProxyError> {
    authorization(headers)?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(ProxyError::AuthenticationMissing)
}

pub struct OpenIdValidator {
    client: reqwest::Client,
    well_known_url: String,
    audience: Option<String>,
    userinfo_endpoint: OnceCell<String>,
}

impl OpenIdValidator {
    pub fn new(well_known_url: String, audience: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            well_known_url,
            audience,
            userinfo_endpoint: OnceCell::new(),
        }
    }

    /// Discovery document is fetched once and cached for the process
    /// lifetime.
    async fn userinfo_endpoint(&self) -> Result<&str, ProxyError> {
        self.userinfo_endpoint
            .get_or_try_init(|| async {
                let discovery: serde_json::Value = self
                    .client
                    .get(&self.well_known_url)
                    .send()
                    .await
                    .map_err(|e| ProxyError::OpenIdConnect(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| ProxyError::OpenIdConnect(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| ProxyError::OpenIdConnect(e.to_string()))?;
                discovery
                    .get("userinfo_endpoint")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ProxyError::OpenIdConnect(
                            "discovery document has no userinfo_endpoint".to_string(),
                        )
                    })
            })
            .await
            .map(String::as_str)
    }

    pub async fn validate(&self, token: &str) -> Result<(), ProxyError> {
        let endpoint = self.userinfo_endpoint().await?.to_string();
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                warn!("openid connect provider unreachable: {e}");
                ProxyError::OpenIdConnect(e.to_string())
            })?;

        match response.status() {
            status if status.is_success() => {
                if let Some(audience) = &self.audience {
                    let claims: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| ProxyError::OpenIdConnect(e.to_string()))?;
                    if !audience_matches(&claims, audience) {
                        return Err(ProxyError::AuthorisationDenied);
                    }
                }
                Ok(())
            }
            status if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(ProxyError::InvalidToken)
            }
            status if status == reqwest::StatusCode::FORBIDDEN => {
                Err(ProxyError::AuthorisationDenied)
            }
            status => Err(ProxyError::OpenIdConnect(format!(
                "unexpected provider response: {status}"
            ))),
        }
    }
}

fn audience_matches(claims: &serde_json::Value, audience: &str) -> bool {
    match claims.get("aud") {
        Some(serde_json::Value::String(aud)) => aud == audience,
        Some(serde_json::Value::Array(auds)) => {
            auds.iter().any(|a| a.as_str() == Some(audience))
        }
        _ => false,
    }
}
