use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{
    ApiError, LedgerHttpState, error_response, extract_header, invalid_request,
    map_purchase_error,
};
use crate::consumption::TokenSnapshot;
use crate::purchase::{ConfirmOutcome, ConfirmRequest, ConfirmSource};
use crate::store_types::PurchaseHistoryRecord;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub(super) struct ConfirmPurchaseRequest {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    payment_id: String,
    #[serde(default)]
    signature: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ConfirmPurchaseResponse {
    success: bool,
    tokens_added: u64,
    token_balance: TokenSnapshot,
    already_completed: bool,
}

impl From<ConfirmOutcome> for ConfirmPurchaseResponse {
    fn from(outcome: ConfirmOutcome) -> Self {
        Self {
            success: true,
            tokens_added: outcome.tokens_added,
            token_balance: outcome.token_balance,
            already_completed: outcome.already_completed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(super) struct HistoryResponse {
    purchases: Vec<PurchaseHistoryRecord>,
}

pub(super) async fn confirm(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    payload: Result<Json<ConfirmPurchaseRequest>, JsonRejection>,
) -> Result<Json<ConfirmPurchaseResponse>, ApiError> {
    let user = state.authenticate(&headers)?;
    let Json(request) = payload.map_err(|err| invalid_request(err.body_text()))?;

    let outcome = state
        .purchases
        .confirm(ConfirmRequest {
            user_id: user.id,
            plan: user.plan,
            order_id: request.order_id,
            payment_id: request.payment_id,
            source: ConfirmSource::Client {
                signature: request.signature,
            },
        })
        .await
        .map_err(map_purchase_error)?;
    Ok(Json(outcome.into()))
}

pub(super) async fn history(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user = state.authenticate(&headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let purchases = state
        .purchases
        .purchase_history(&user.id, limit)
        .await
        .map_err(map_purchase_error)?;
    Ok(Json(HistoryResponse { purchases }))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    payment: Option<WebhookWrapper<PaymentEntity>>,
    #[serde(default)]
    order: Option<WebhookWrapper<OrderEntity>>,
}

#[derive(Debug, Deserialize)]
struct WebhookWrapper<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEntity {
    id: String,
}

impl WebhookPayload {
    fn payment_id(&self) -> Option<&str> {
        self.payment.as_ref().map(|payment| payment.entity.id.as_str())
    }

    fn order_id(&self) -> Option<&str> {
        self.payment
            .as_ref()
            .and_then(|payment| payment.entity.order_id.as_deref())
            .or_else(|| self.order.as_ref().map(|order| order.entity.id.as_str()))
    }
}

#[derive(Debug, Serialize)]
pub(super) struct WebhookResponse {
    received: bool,
    event: String,
    action: &'static str,
}

/// Gateway callback. The body signature is checked before anything is parsed or read.
pub(super) async fn webhook(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = extract_header(&headers, "x-webhook-signature").unwrap_or_default();
    if !state.purchases.verifier().verify_webhook(&body, &signature) {
        tracing::warn!("webhook signature rejected");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "webhook signature verification failed",
        ));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|err| invalid_request(format!("invalid webhook body: {err}")))?;
    tracing::info!(event = %event.event, "webhook received");

    let action = match event.event.as_str() {
        "payment.captured" | "order.paid" => {
            let (Some(order_id), Some(payment_id)) =
                (event.payload.order_id(), event.payload.payment_id())
            else {
                return Err(invalid_request("webhook is missing order or payment id"));
            };
            let outcome = state
                .purchases
                .confirm_webhook(order_id, payment_id, |user_id| state.plan_for(user_id))
                .await
                .map_err(map_purchase_error)?;
            if outcome.already_completed {
                "already_completed"
            } else {
                "completed"
            }
        }
        "payment.failed" => {
            let Some(order_id) = event.payload.order_id() else {
                return Err(invalid_request("webhook is missing order id"));
            };
            let reason = event
                .payload
                .payment
                .as_ref()
                .and_then(|payment| payment.entity.error_description.as_deref())
                .unwrap_or("payment failed at gateway");
            let marked = state
                .purchases
                .mark_payment_failed(order_id, reason)
                .await
                .map_err(map_purchase_error)?;
            if marked { "marked_failed" } else { "ignored" }
        }
        _ => "ignored",
    };

    Ok(Json(WebhookResponse {
        received: true,
        event: event.event,
        action,
    }))
}
