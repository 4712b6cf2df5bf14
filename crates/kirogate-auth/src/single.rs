use std::sync::Arc;
use std::time::Duration;

use kirogate_core::{GatewayError, Result};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::refresh::{AuthKind, RefreshClient};
use crate::store::{CredentialEnvelope, CredentialSet, CredentialStore};
use crate::token::TokenRecord;

/// Sleep after a failed background refresh before the next attempt.
const ERROR_RETRY_SECS: u64 = 30;

/// Single refresh-token lifecycle.
///
/// All token mutations go through one `tokio::sync::Mutex`; the
/// expiring-soon check happens under the same lock as the refresh so no
/// other caller can observe the token between check and act. The lock is
/// deliberately held across the refresh HTTP call.
pub struct SingleTokenAuth {
    state: Mutex<SingleState>,
    region: String,
    threshold_secs: i64,
    shutdown: CancellationToken,
}

struct SingleState {
    token: TokenRecord,
    profile_arn: Option<String>,
    sso_region: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Option<Vec<String>>,
    store: Option<CredentialStore>,
}

impl SingleState {
    fn apply(&mut self, set: CredentialSet) {
        if let Some(rt) = set.refresh_token {
            self.token.refresh_token = rt;
        }
        if let Some(at) = set.access_token {
            self.token.access_token = Some(at);
        }
        if let Some(exp) = set.expires_at {
            self.token.expires_at = Some(exp);
        }
        if let Some(arn) = set.profile_arn {
            self.profile_arn = Some(arn);
        }
        if let Some(sso) = set.sso_region {
            self.sso_region = Some(sso);
        }
        if let Some(cid) = set.client_id {
            self.client_id = Some(cid);
        }
        if let Some(csec) = set.client_secret {
            self.client_secret = Some(csec);
        }
        if let Some(scopes) = set.scopes {
            self.scopes = Some(scopes);
        }
    }
}

impl SingleTokenAuth {
    pub fn new(
        region: String,
        threshold_secs: i64,
        refresh_token: String,
        profile_arn: Option<String>,
        mut store: Option<CredentialStore>,
    ) -> Self {
        let mut region = region;
        let mut state = SingleState {
            token: TokenRecord::new(refresh_token),
            profile_arn,
            sso_region: None,
            client_id: None,
            client_secret: None,
            scopes: None,
            store: None,
        };
        if let Some(store) = store.as_mut() {
            let set = store.load();
            // A JSON credentials file may pin its own API region.
            if let Some(r) = set.region.clone() {
                region = r;
            }
            state.apply(set);
        }
        state.store = store;

        info!(
            region = %region,
            kind = ?state.auth_kind(),
            "single-token auth manager initialized"
        );

        Self {
            state: Mutex::new(state),
            region,
            threshold_secs,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Return an access token valid for at least the configured threshold,
    /// refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if !state.token.is_expiring_soon(self.threshold_secs) {
            if let Some(token) = state.token.access_token.clone() {
                return Ok(token);
            }
        }

        // SQLite mode: another process (kiro-cli) may have refreshed already.
        let reloaded = match state.store.as_mut() {
            Some(store) if store.is_sqlite() => {
                debug!("reloading SQLite credentials before refresh attempt");
                Some(store.load())
            }
            _ => None,
        };
        if let Some(set) = reloaded {
            state.apply(set);
            if !state.token.is_expiring_soon(self.threshold_secs) {
                if let Some(token) = state.token.access_token.clone() {
                    debug!("SQLite reload provided a fresh token, no refresh needed");
                    return Ok(token);
                }
            }
        }

        match self.refresh_locked(&mut state).await {
            Ok(()) => {}
            Err(GatewayError::UpstreamBadRequest(msg))
                if state.store.as_ref().is_some_and(CredentialStore::is_sqlite) =>
            {
                // Refresh failed twice (refresh_locked already reloaded and
                // retried). The sibling process may hold newer tokens only in
                // memory; fall back to the current access token until it
                // actually expires.
                if !state.token.is_expired() {
                    if let Some(token) = state.token.access_token.clone() {
                        warn!(
                            "token refresh kept failing with 400; using existing access \
                             token until expiry. Re-run the upstream login when convenient."
                        );
                        return Ok(token);
                    }
                }
                return Err(GatewayError::CredentialsStale(format!(
                    "token expired and refresh failed: {msg}"
                )));
            }
            Err(e) => return Err(e),
        }

        state
            .token
            .access_token
            .clone()
            .ok_or_else(|| GatewayError::CredentialsStale("failed to obtain access token".into()))
    }

    /// Unconditionally refresh and return the new token. Used after a
    /// 403 from the chat endpoint.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await?;
        state
            .token
            .access_token
            .clone()
            .ok_or_else(|| GatewayError::CredentialsStale("failed to obtain access token".into()))
    }

    /// True when the token stays valid long enough for a streaming call.
    pub async fn is_fresh_for_streaming(&self, min_secs: i64) -> bool {
        self.state.lock().await.token.is_fresh_for_streaming(min_secs)
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.state.lock().await.profile_arn.clone()
    }

    /// Account status for the status endpoint; never leaks the refresh token.
    pub async fn status(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        json!({
            "mode": "single-account",
            "auth_kind": match state.auth_kind() {
                AuthKind::Desktop => "desktop",
                AuthKind::Oidc => "oidc",
            },
            "region": self.region,
            "has_access_token": state.token.access_token.is_some(),
            "expires_at": state.token.expires_at.map(|t| t.to_rfc3339()),
            "last_refresh": state.token.last_refresh.map(|t| t.to_rfc3339()),
            "refresh_token": state.token.masked_refresh_token(),
        })
    }

    /// Start the proactive refresh task. Wakes every `interval`, re-checks
    /// expiry under the lock, refreshes when needed. Cancelled by
    /// [`SingleTokenAuth::shutdown`].
    pub fn start_background_refresh(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            info!("background token refresh task started (single-token mode)");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let mut state = manager.state.lock().await;
                if !state.token.is_expiring_soon(manager.threshold_secs) {
                    debug!("background refresh: token still valid, skipping");
                    continue;
                }

                info!("background refresh: token expiring soon, refreshing");
                if let Err(e) = manager.refresh_locked(&mut state).await {
                    error!(error = %e, "background refresh failed");
                    drop(state);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(ERROR_RETRY_SECS)) => {}
                    }
                }
            }
            info!("background token refresh task stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Refresh with the lock already held. In SQLite mode a 400 triggers one
    /// reload-and-retry, handling tokens invalidated by a sibling re-login.
    async fn refresh_locked(&self, state: &mut SingleState) -> Result<()> {
        let first = self.do_refresh(state).await;
        if !matches!(first, Err(GatewayError::UpstreamBadRequest(_))) {
            return first;
        }
        let reloaded = match state.store.as_mut() {
            Some(store) if store.is_sqlite() => {
                warn!("token refresh failed with 400, reloading credentials and retrying");
                Some(store.load())
            }
            _ => None,
        };
        match reloaded {
            Some(set) => {
                state.apply(set);
                self.do_refresh(state).await
            }
            None => first,
        }
    }

    async fn do_refresh(&self, state: &mut SingleState) -> Result<()> {
        let client = state.refresh_client(&self.region);
        let outcome = client.refresh(&state.token.refresh_token).await?;

        state.token.access_token = Some(outcome.access_token);
        state.token.expires_at = Some(outcome.expires_at);
        if let Some(rt) = outcome.refresh_token {
            state.token.refresh_token = rt;
        }
        if let Some(arn) = outcome.profile_arn {
            state.profile_arn = Some(arn);
        }
        state.token.record_success();

        let envelope = CredentialEnvelope {
            refresh_token: state.token.refresh_token.clone(),
            access_token: state.token.access_token.clone().unwrap_or_default(),
            expires_at: state.token.expires_at.unwrap_or_else(chrono::Utc::now),
            profile_arn: state.profile_arn.clone(),
            region: state
                .sso_region
                .clone()
                .unwrap_or_else(|| self.region.clone()),
            scopes: state.scopes.clone(),
        };
        if let Some(store) = state.store.as_mut() {
            store.save(&envelope);
        }
        Ok(())
    }
}

impl SingleState {
    fn auth_kind(&self) -> AuthKind {
        if self.client_id.is_some() && self.client_secret.is_some() {
            AuthKind::Oidc
        } else {
            AuthKind::Desktop
        }
    }

    fn refresh_client(&self, region: &str) -> RefreshClient {
        RefreshClient::new(
            region,
            self.sso_region.as_deref(),
            self.client_id.clone(),
            self.client_secret.clone(),
        )
    }
}
