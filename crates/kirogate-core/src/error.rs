use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No upstream credentials configured: {0}")]
    CredentialsMissing(String),

    #[error("Upstream credentials are stale: {0}")]
    CredentialsStale(String),

    #[error("Upstream rejected credentials ({status}): {message}")]
    UpstreamAuthFailed { status: u16, message: String },

    #[error("Upstream rejected request: {0}")]
    UpstreamBadRequest(String),

    #[error("Upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("Upstream server error ({status}): {message}")]
    UpstreamServerError { status: u16, message: String },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Tool name(s) exceed 64 bytes: {}", .names.join(", "))]
    ToolNameTooLong { names: Vec<String> },

    #[error("Request contains no messages")]
    NoMessages,

    #[error("Upstream stream truncated: {0}")]
    ParserTruncation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable error code sent to clients in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::CredentialsMissing(_) => "CREDENTIALS_MISSING",
            GatewayError::CredentialsStale(_) => "CREDENTIALS_STALE",
            GatewayError::UpstreamAuthFailed { .. } => "UPSTREAM_AUTH_FAILED",
            GatewayError::UpstreamBadRequest(_) => "UPSTREAM_BAD_REQUEST",
            GatewayError::UpstreamRateLimited(_) => "UPSTREAM_RATE_LIMITED",
            GatewayError::UpstreamServerError { .. } => "UPSTREAM_SERVER_ERROR",
            GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::MalformedRequest(_) => "MALFORMED_REQUEST",
            GatewayError::ToolNameTooLong { .. } => "TOOL_NAME_TOO_LONG",
            GatewayError::NoMessages => "NO_MESSAGES",
            GatewayError::ParserTruncation(_) => "PARSER_TRUNCATION",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status returned to the client for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::CredentialsMissing(_) | GatewayError::CredentialsStale(_) => 503,
            GatewayError::UpstreamAuthFailed { status, .. } => *status,
            GatewayError::UpstreamBadRequest(_) => 400,
            GatewayError::UpstreamRateLimited(_) => 429,
            GatewayError::UpstreamServerError { status, .. } => *status,
            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::ToolNameTooLong { .. } => 400,
            GatewayError::NoMessages => 400,
            GatewayError::ParserTruncation(_) | GatewayError::Internal(_) => 500,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::UpstreamUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::NoMessages.http_status(), 400);
        assert_eq!(
            GatewayError::UpstreamAuthFailed {
                status: 403,
                message: "forbidden".into()
            }
            .http_status(),
            403
        );
        assert_eq!(
            GatewayError::UpstreamRateLimited("slow down".into()).http_status(),
            429
        );
        assert_eq!(
            GatewayError::CredentialsStale("run login".into()).http_status(),
            503
        );
    }

    #[test]
    fn tool_name_error_lists_offenders() {
        let err = GatewayError::ToolNameTooLong {
            names: vec!["a_very_long_name".into(), "another".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a_very_long_name"));
        assert!(msg.contains("another"));
    }
}
