use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use kirogate_core::{GatewayError, Result};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::refresh::RefreshClient;
use crate::token::TokenRecord;

/// Initial delay before the first background `refresh_all` sweep.
const WARMUP_SECS: u64 = 60;

/// Outcome of a [`MultiTokenAuth::refresh_all`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshAllReport {
    pub healthy: usize,
    pub failed: usize,
}

/// Pool of refresh tokens with round-robin rotation and per-token backoff.
///
/// Rotation policy: a 401/403 on refresh marks the active token failed and
/// advances to the next token not in backoff. Backoff grows with the
/// failure count (5 min, 30 min, 2 h). When every token is in backoff the
/// failed flags are cleared so the next sweep may try them all again.
pub struct MultiTokenAuth {
    state: Mutex<PoolState>,
    refresh: RefreshClient,
    region: String,
    profile_arn: Option<String>,
    threshold_secs: i64,
    shutdown: CancellationToken,
}

struct PoolState {
    tokens: Vec<TokenRecord>,
    active: usize,
}

impl MultiTokenAuth {
    pub fn new(
        region: String,
        threshold_secs: i64,
        refresh_tokens: Vec<String>,
        profile_arn: Option<String>,
    ) -> Self {
        let tokens = refresh_tokens.into_iter().map(TokenRecord::new).collect::<Vec<_>>();
        info!(count = tokens.len(), region = %region, "multi-token auth manager initialized");
        Self {
            state: Mutex::new(PoolState { tokens, active: 0 }),
            refresh: RefreshClient::new(&region, None, None, None),
            region,
            profile_arn,
            threshold_secs,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Return a valid access token from the active slot.
    ///
    /// A 401/403 from the refresh endpoint marks the active token failed
    /// and rotates to the next healthy slot, erroring only after a full
    /// failed sweep. Transient problems (rate limits, upstream outages)
    /// propagate without touching the slot's health: backing off a valid
    /// credential over an outage would walk the whole pool into backoff.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let attempts = state.tokens.len();

        for _ in 0..attempts {
            let active = state.active;
            let token = &state.tokens[active];

            if !token.is_expiring_soon(self.threshold_secs) {
                if let Some(access) = token.access_token.clone() {
                    return Ok(access);
                }
            }

            match self.refresh_slot(&mut state, active).await {
                Ok(()) => {
                    return state.tokens[active]
                        .access_token
                        .clone()
                        .ok_or_else(|| {
                            GatewayError::CredentialsStale("refresh produced no token".into())
                        });
                }
                Err(e @ GatewayError::UpstreamAuthFailed { .. }) => {
                    warn!(index = active, error = %e, "token rejected by refresh endpoint, rotating");
                    state.tokens[active].record_failure();
                    if !rotate(&mut state) {
                        return Err(GatewayError::CredentialsStale(
                            "all refresh tokens failed or are in backoff".into(),
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(GatewayError::CredentialsStale(
            "all refresh tokens failed in one sweep".into(),
        ))
    }

    /// Force-refresh the active slot.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let active = state.active;
        self.refresh_slot(&mut state, active).await?;
        state.tokens[active]
            .access_token
            .clone()
            .ok_or_else(|| GatewayError::CredentialsStale("refresh produced no token".into()))
    }

    pub async fn is_fresh_for_streaming(&self, min_secs: i64) -> bool {
        let state = self.state.lock().await;
        state.tokens[state.active].is_fresh_for_streaming(min_secs)
    }

    pub async fn profile_arn(&self) -> Option<String> {
        if self.profile_arn.is_some() {
            return self.profile_arn.clone();
        }
        let state = self.state.lock().await;
        state.tokens[state.active].profile_arn.clone()
    }

    /// Refresh every pool member concurrently. Successes clear the failed
    /// flag and zero the counter; 401/403 rejections mark the slot failed.
    /// Transient errors count against the report but leave the slot's
    /// health alone.
    pub async fn refresh_all(&self) -> RefreshAllReport {
        // Snapshot refresh tokens so the HTTP fan-out runs without the lock;
        // outcomes are applied by index afterwards (pool order is stable).
        let refresh_tokens: Vec<String> = {
            let state = self.state.lock().await;
            state.tokens.iter().map(|t| t.refresh_token.clone()).collect()
        };

        let outcomes = join_all(
            refresh_tokens
                .iter()
                .map(|rt| self.refresh.refresh(rt)),
        )
        .await;

        let mut state = self.state.lock().await;
        let mut report = RefreshAllReport {
            healthy: 0,
            failed: 0,
        };
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let token = &mut state.tokens[index];
            match outcome {
                Ok(o) => {
                    token.access_token = Some(o.access_token);
                    token.expires_at = Some(o.expires_at);
                    if let Some(rt) = o.refresh_token {
                        token.refresh_token = rt;
                    }
                    if let Some(arn) = o.profile_arn {
                        token.profile_arn = Some(arn);
                    }
                    token.record_success();
                    report.healthy += 1;
                }
                Err(e) => {
                    error!(index, error = %e, "pool refresh failed");
                    if matches!(e, GatewayError::UpstreamAuthFailed { .. }) {
                        token.record_failure();
                    }
                    report.failed += 1;
                }
            }
        }
        info!(healthy = report.healthy, failed = report.failed, "pool refresh sweep finished");
        report
    }

    /// Per-slot status for the accounts endpoint; refresh tokens masked.
    pub async fn status(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let accounts: Vec<serde_json::Value> = state
            .tokens
            .iter()
            .enumerate()
            .map(|(index, token)| {
                json!({
                    "index": index,
                    "active": index == state.active,
                    "refresh_token": token.masked_refresh_token(),
                    "has_access_token": token.access_token.is_some(),
                    "expires_at": token.expires_at.map(|t| t.to_rfc3339()),
                    "last_refresh": token.last_refresh.map(|t| t.to_rfc3339()),
                    "is_failed": token.is_failed,
                    "failure_count": token.failure_count,
                })
            })
            .collect();
        json!({
            "mode": "multi-account",
            "region": self.region,
            "total_tokens": state.tokens.len(),
            "accounts": accounts,
        })
    }

    /// Background health sweep: 60-second warmup, then `refresh_all` every
    /// `interval`. Cancelled by [`MultiTokenAuth::shutdown`].
    pub fn start_background_refresh(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            info!("background token refresh task started (multi-token mode)");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(WARMUP_SECS)) => {}
            }
            loop {
                let report = manager.refresh_all().await;
                debug!(?report, "background pool refresh");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            info!("background token refresh task stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn refresh_slot(&self, state: &mut PoolState, index: usize) -> Result<()> {
        let refresh_token = state.tokens[index].refresh_token.clone();
        let outcome = self.refresh.refresh(&refresh_token).await?;

        let token = &mut state.tokens[index];
        token.access_token = Some(outcome.access_token);
        token.expires_at = Some(outcome.expires_at);
        if let Some(rt) = outcome.refresh_token {
            token.refresh_token = rt;
        }
        if let Some(arn) = outcome.profile_arn {
            token.profile_arn = Some(arn);
        }
        token.record_success();
        Ok(())
    }
}

/// Advance to the next token not in backoff, scanning cyclically after the
/// active index. When every token is in backoff, clear all failed flags
/// (permitting a fresh sweep), keep the index, and report failure.
fn rotate(state: &mut PoolState) -> bool {
    let now = Utc::now();
    let len = state.tokens.len();

    for step in 1..=len {
        let candidate = (state.active + step) % len;
        if !state.tokens[candidate].in_backoff(now) {
            debug!(from = state.active, to = candidate, "rotated to next token");
            state.active = candidate;
            return true;
        }
    }

    warn!("all tokens in backoff; clearing failed flags for a new sweep");
    for token in &mut state.tokens {
        token.is_failed = false;
    }
    false
}
