use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use serde::Serialize;
use tracing::Instrument;

use crate::config::{LedgerConfig, UserConfig};
use crate::consumption::{ConsumptionService, TokenError};
use crate::policy::{Plan, QuotaPolicy};
use crate::purchase::{PurchaseError, PurchaseStateMachine};
use crate::store::TokenStore;
use crate::verifier::PaymentVerifier;

mod admin;
mod purchases;
mod tokens;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct LedgerHttpState {
    consumption: ConsumptionService,
    purchases: PurchaseStateMachine,
    users_by_token: Arc<HashMap<String, AuthenticatedUser>>,
    plans_by_user: Arc<HashMap<String, Plan>>,
    admin_token: Option<String>,
}

impl LedgerHttpState {
    pub fn new(consumption: ConsumptionService, purchases: PurchaseStateMachine) -> Self {
        Self {
            consumption,
            purchases,
            users_by_token: Arc::new(HashMap::new()),
            plans_by_user: Arc::new(HashMap::new()),
            admin_token: None,
        }
    }

    pub fn from_config(
        config: &LedgerConfig,
        store: Arc<dyn TokenStore>,
        verifier: PaymentVerifier,
    ) -> Self {
        let consumption = ConsumptionService::new(store, QuotaPolicy::new(config.policy.clone()));
        let purchases = PurchaseStateMachine::new(consumption.clone(), verifier)
            .with_config(config.purchase.clone());
        Self::new(consumption, purchases).with_users(config.users.iter().cloned())
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = UserConfig>) -> Self {
        let mut by_token = HashMap::new();
        let mut by_user = HashMap::new();
        for user in users {
            by_user.insert(user.id.clone(), user.plan);
            by_token.insert(
                user.token,
                AuthenticatedUser {
                    id: user.id,
                    plan: user.plan,
                },
            );
        }
        self.users_by_token = Arc::new(by_token);
        self.plans_by_user = Arc::new(by_user);
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// Users the gateway knows about but the config does not are treated as free.
    fn plan_for(&self, user_id: &str) -> Plan {
        self.plans_by_user
            .get(user_id)
            .copied()
            .unwrap_or(Plan::Free)
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
        let user = extract_bearer(headers).and_then(|token| self.users_by_token.get(&token));
        match user {
            Some(user) => Ok(user.clone()),
            None => Err(error_response(
                StatusCode::UNAUTHORIZED,
                "AUTHENTICATION_REQUIRED",
                "a valid bearer token is required",
            )),
        }
    }

    fn ensure_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let provided = extract_bearer(headers).or_else(|| extract_header(headers, "x-admin-token"));
        match (self.admin_token.as_deref(), provided) {
            (Some(expected), Some(provided)) if provided == expected => Ok(()),
            _ => Err(error_response(
                StatusCode::UNAUTHORIZED,
                "AUTHENTICATION_REQUIRED",
                "invalid admin token",
            )),
        }
    }
}

#[derive(Clone, Debug)]
struct AuthenticatedUser {
    id: String,
    plan: Plan,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: LedgerHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/tokens", get(tokens::get_tokens))
        .route("/v1/tokens/consume", post(tokens::consume))
        .route("/v1/purchases/confirm", post(purchases::confirm))
        .route("/v1/purchases/history", get(purchases::history));

    if state.purchases.verifier().has_webhook_secret() {
        router = router.route("/v1/webhooks/payment", post(purchases::webhook));
    }

    if state.admin_token.is_some() {
        router = router
            .route("/admin/purchases", post(admin::record_purchase))
            .route("/admin/purchases/:order_id", get(admin::get_purchase));
    }

    router
        .layer(axum::middleware::from_fn(request_context))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn request_context(request: Request, next: Next) -> Response {
    let request_id =
        extract_header(request.headers(), "x-request-id").unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "http.request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
    );

    async move {
        let mut response = next.run(request).await;
        let status = response.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), "request handled");
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("ledger-{ts_ms}-{seq}")
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn invalid_request(message: impl Into<String>) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
}

fn map_token_error(err: TokenError) -> ApiError {
    match err {
        TokenError::InvalidCost => invalid_request(err.to_string()),
        TokenError::InsufficientTokens { .. } => {
            error_response(StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_TOKENS", err.to_string())
        }
        TokenError::Store(err) => {
            tracing::error!(error = %err, "token store failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal error",
            )
        }
    }
}

fn map_purchase_error(err: PurchaseError) -> ApiError {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let PurchaseError::Store(store_err) = &err {
        tracing::error!(error = %store_err, "purchase store failure");
        return error_response(status, err.code(), "internal error");
    }
    error_response(status, err.code(), err.to_string())
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}
