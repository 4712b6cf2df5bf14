use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use kirogate_auth::AuthManager;
use kirogate_core::{GatewayConfig, Result};
use kirogate_upstream::TruncationCaches;
use std::sync::Arc;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub auth: AuthManager,
    pub truncation: Arc<TruncationCaches>,
    /// Pooled client for non-streaming upstream calls. Streaming calls get
    /// a disposable client so a client disconnect tears the socket down.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let auth = AuthManager::from_config(&config)?;
        Ok(Self {
            config,
            auth,
            truncation: Arc::new(TruncationCaches::default()),
            http: reqwest::Client::new(),
        })
    }

    /// Select the HTTP client for an upstream call. Streaming responses
    /// must not share the pooled client: cancelling the request has to
    /// close the upstream socket rather than return it to the pool.
    pub fn client_for(&self, streaming: bool) -> reqwest::Client {
        if streaming {
            reqwest::Client::new()
        } else {
            self.http.clone()
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/models", get(crate::http::models::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai::chat_completions),
        )
        .route("/v1/messages", post(crate::http::anthropic::messages))
        .route(
            "/v1/accounts/status",
            get(crate::http::accounts::accounts_status),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::http::auth::require_api_key,
        ));

    Router::new()
        .route("/", get(crate::http::health::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .merge(protected)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
