use std::time::Duration;

use chrono::{DateTime, Utc};
use kirogate_core::config::{kiro_refresh_url, oidc_token_url, REFRESH_TIMEOUT_SECS, UPSTREAM_IDE_VERSION};
use kirogate_core::fingerprint::machine_fingerprint;
use kirogate_core::{GatewayError, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Which refresh protocol the credentials select.
///
/// Desktop credentials carry only a refresh token; OIDC credentials add a
/// device-flow client id and secret and may refresh against a different
/// (SSO) region than the API region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Desktop,
    Oidc,
}

/// Tokens produced by a successful refresh. `expires_at` already includes
/// the 60-second safety margin.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile_arn: Option<String>,
}

/// Performs token refresh calls against the Desktop or OIDC endpoint.
/// Stateless apart from the HTTP client; callers own the token records.
pub struct RefreshClient {
    http: reqwest::Client,
    refresh_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl RefreshClient {
    pub fn new(
        region: &str,
        sso_region: Option<&str>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        let oidc = client_id.is_some() && client_secret.is_some();
        let refresh_url = if oidc {
            oidc_token_url(sso_region.unwrap_or(region))
        } else {
            kiro_refresh_url(region)
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        let kind = if oidc { AuthKind::Oidc } else { AuthKind::Desktop };
        info!(url = %refresh_url, ?kind, "refresh client initialized");

        Self {
            http,
            refresh_url,
            client_id,
            client_secret,
        }
    }

    pub fn auth_kind(&self) -> AuthKind {
        if self.client_id.is_some() && self.client_secret.is_some() {
            AuthKind::Oidc
        } else {
            AuthKind::Desktop
        }
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshOutcome> {
        if refresh_token.is_empty() {
            return Err(GatewayError::CredentialsMissing(
                "refresh token is not set".into(),
            ));
        }

        let body = match self.auth_kind() {
            AuthKind::Desktop => {
                debug!("refreshing token via Desktop Auth");
                serde_json::json!({ "refreshToken": refresh_token })
            }
            AuthKind::Oidc => {
                debug!("refreshing token via SSO OIDC");
                // The OIDC CreateToken API wants JSON with camelCase names,
                // not the form-encoded grant of generic OAuth.
                serde_json::json!({
                    "grantType": "refresh_token",
                    "clientId": self.client_id,
                    "clientSecret": self.client_secret,
                    "refreshToken": refresh_token,
                })
            }
        };

        let resp = self
            .http
            .post(&self.refresh_url)
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                format!("{UPSTREAM_IDE_VERSION}-{}", machine_fingerprint()),
            )
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "token refresh failed");
            return Err(match status {
                400 => GatewayError::UpstreamBadRequest(text),
                401 | 403 => GatewayError::UpstreamAuthFailed {
                    status,
                    message: text,
                },
                429 => GatewayError::UpstreamRateLimited(text),
                s if s >= 500 => GatewayError::UpstreamServerError {
                    status: s,
                    message: text,
                },
                _ => GatewayError::UpstreamUnavailable(format!("refresh status {status}: {text}")),
            });
        }

        let reply: RefreshReply = resp
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("refresh reply: {e}")))?;

        if reply.access_token.is_empty() {
            return Err(GatewayError::UpstreamUnavailable(
                "refresh reply does not contain accessToken".into(),
            ));
        }

        let expires_in = reply.expires_in.unwrap_or(3600);
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_in - 60);
        info!(expires_at = %expires_at.to_rfc3339(), "token refreshed");

        Ok(RefreshOutcome {
            access_token: reply.access_token,
            refresh_token: reply.refresh_token,
            expires_at,
            profile_arn: reply.profile_arn,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshReply {
    #[serde(default)]
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    profile_arn: Option<String>,
}
