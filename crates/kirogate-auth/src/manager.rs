use std::sync::Arc;
use std::time::Duration;

use kirogate_core::{GatewayConfig, GatewayError, Result};
use tracing::info;

use crate::multi::MultiTokenAuth;
use crate::single::SingleTokenAuth;
use crate::store::CredentialStore;

/// Either credential manager behind one façade.
///
/// A comma-separated `REFRESH_TOKEN` selects the pool; otherwise a single
/// token comes from the env, a JSON credentials file, or the kiro-cli
/// SQLite database.
pub enum AuthManager {
    Single(Arc<SingleTokenAuth>),
    Multi(Arc<MultiTokenAuth>),
}

impl AuthManager {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let tokens = config.refresh_tokens();

        if tokens.len() > 1 {
            info!(count = tokens.len(), "using multi-token credential pool");
            return Ok(AuthManager::Multi(Arc::new(MultiTokenAuth::new(
                config.kiro_region.clone(),
                config.token_refresh_threshold,
                tokens,
                config.profile_arn.clone(),
            ))));
        }

        let store = if let Some(db) = &config.kiro_db_file {
            Some(CredentialStore::sqlite(db))
        } else {
            config.kiro_creds_file.as_deref().map(CredentialStore::json_file)
        };

        let refresh_token = tokens.into_iter().next().unwrap_or_default();
        if refresh_token.is_empty() && store.is_none() {
            return Err(GatewayError::CredentialsMissing(
                "set REFRESH_TOKEN, KIRO_CREDS_FILE, or KIRO_DB_FILE".into(),
            ));
        }

        Ok(AuthManager::Single(Arc::new(SingleTokenAuth::new(
            config.kiro_region.clone(),
            config.token_refresh_threshold,
            refresh_token,
            config.profile_arn.clone(),
            store,
        ))))
    }

    pub async fn get_access_token(&self) -> Result<String> {
        match self {
            AuthManager::Single(m) => m.get_access_token().await,
            AuthManager::Multi(m) => m.get_access_token().await,
        }
    }

    pub async fn force_refresh(&self) -> Result<String> {
        match self {
            AuthManager::Single(m) => m.force_refresh().await,
            AuthManager::Multi(m) => m.force_refresh().await,
        }
    }

    pub async fn is_fresh_for_streaming(&self, min_secs: i64) -> bool {
        match self {
            AuthManager::Single(m) => m.is_fresh_for_streaming(min_secs).await,
            AuthManager::Multi(m) => m.is_fresh_for_streaming(min_secs).await,
        }
    }

    pub async fn profile_arn(&self) -> Option<String> {
        match self {
            AuthManager::Single(m) => m.profile_arn().await,
            AuthManager::Multi(m) => m.profile_arn().await,
        }
    }

    pub fn region(&self) -> &str {
        match self {
            AuthManager::Single(m) => m.region(),
            AuthManager::Multi(m) => m.region(),
        }
    }

    pub async fn status(&self) -> serde_json::Value {
        match self {
            AuthManager::Single(m) => m.status().await,
            AuthManager::Multi(m) => m.status().await,
        }
    }

    pub fn start_background_refresh(&self, interval: Duration) {
        match self {
            AuthManager::Single(m) => m.start_background_refresh(interval),
            AuthManager::Multi(m) => m.start_background_refresh(interval),
        }
    }

    pub fn shutdown(&self) {
        match self {
            AuthManager::Single(m) => m.shutdown(),
            AuthManager::Multi(m) => m.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_mode_selected_for_comma_separated_tokens() {
        let config = GatewayConfig {
            refresh_token: Some("rt-a,rt-b".into()),
            ..Default::default()
        };
        assert!(matches!(
            AuthManager::from_config(&config).unwrap(),
            AuthManager::Multi(_)
        ));
    }

    #[test]
    fn single_mode_for_one_token() {
        let config = GatewayConfig {
            refresh_token: Some("rt-only".into()),
            ..Default::default()
        };
        assert!(matches!(
            AuthManager::from_config(&config).unwrap(),
            AuthManager::Single(_)
        ));
    }

    #[test]
    fn missing_credentials_rejected() {
        let config = GatewayConfig::default();
        assert!(matches!(
            AuthManager::from_config(&config),
            Err(GatewayError::CredentialsMissing(_))
        ));
    }
}
