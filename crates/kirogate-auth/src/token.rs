use chrono::{DateTime, Duration, Utc};

/// One refresh credential with health tracking.
///
/// `expires_at` already carries the 60-second safety margin applied when the
/// refresh response is recorded; `is_expired` therefore reports the padded
/// expiry, which is what every caller wants.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_failed: bool,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

impl TokenRecord {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            access_token: None,
            expires_at: None,
            is_failed: false,
            failure_count: 0,
            last_failure: None,
            last_refresh: None,
            profile_arn: None,
        }
    }

    /// True when the token expires within `threshold_secs` seconds, or when
    /// no expiry information is available.
    pub fn is_expiring_soon(&self, threshold_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now() + Duration::seconds(threshold_secs),
            None => true,
        }
    }

    /// True when the token is actually past its expiry (not merely expiring
    /// soon). Used for graceful degradation when a refresh fails.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }

    /// True when the token stays valid for at least `min_secs` more seconds.
    /// Callers about to open a long stream use this.
    pub fn is_fresh_for_streaming(&self, min_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => (at - Utc::now()).num_seconds() >= min_secs,
            None => false,
        }
    }

    /// Backoff applied after `failure_count` consecutive refresh failures.
    pub fn backoff(&self) -> Duration {
        match self.failure_count {
            0 => Duration::zero(),
            1 => Duration::minutes(5),
            2 => Duration::minutes(30),
            _ => Duration::hours(2),
        }
    }

    /// True when the token is failed and its backoff window has not elapsed.
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        if !self.is_failed {
            return false;
        }
        match self.last_failure {
            Some(at) => now < at + self.backoff(),
            None => false,
        }
    }

    pub fn record_failure(&mut self) {
        self.is_failed = true;
        self.failure_count += 1;
        self.last_failure = Some(Utc::now());
    }

    pub fn record_success(&mut self) {
        self.is_failed = false;
        self.failure_count = 0;
        self.last_refresh = Some(Utc::now());
    }

    /// First 8 characters of the refresh token; never the full value.
    pub fn masked_refresh_token(&self) -> String {
        let prefix: String = self.refresh_token.chars().take(8).collect();
        format!("{prefix}...")
    }
}
