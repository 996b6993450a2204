use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{ApiError, LedgerHttpState, invalid_request, map_token_error};
use crate::consumption::TokenSnapshot;
use crate::policy::StudyMode;

#[derive(Debug, Deserialize)]
pub(super) struct ConsumeRequest {
    #[serde(default)]
    cost: Option<u64>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    mode: Option<StudyMode>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct ConsumeResponse {
    success: bool,
    cost: u64,
    from_daily: u64,
    from_purchased: u64,
    tokens: TokenSnapshot,
}

pub(super) async fn get_tokens(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<TokenSnapshot>, ApiError> {
    let user = state.authenticate(&headers)?;
    let snapshot = state
        .consumption
        .get_user_tokens(&user.id, user.plan)
        .await
        .map_err(map_token_error)?;
    Ok(Json(snapshot))
}

pub(super) async fn consume(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    payload: Result<Json<ConsumeRequest>, JsonRejection>,
) -> Result<Json<ConsumeResponse>, ApiError> {
    let user = state.authenticate(&headers)?;
    let Json(request) = payload.map_err(|err| invalid_request(err.body_text()))?;

    let cost = match (request.cost, request.mode) {
        (Some(cost), _) => cost,
        (None, Some(mode)) => state
            .consumption
            .policy()
            .calculate_token_cost(request.language.as_deref().unwrap_or_default(), mode),
        (None, None) => return Err(invalid_request("either cost or mode is required")),
    };
    let context = request.context.as_deref().unwrap_or("api");

    let consumption = state
        .consumption
        .consume_tokens(&user.id, user.plan, cost, context)
        .await
        .map_err(map_token_error)?;

    Ok(Json(ConsumeResponse {
        success: true,
        cost: consumption.cost,
        from_daily: consumption.from_daily,
        from_purchased: consumption.from_purchased,
        tokens: consumption.snapshot,
    }))
}
