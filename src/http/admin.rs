use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};

use super::{ApiError, LedgerHttpState, error_response, invalid_request, map_purchase_error};
use crate::purchase::RecordedPurchase;
use crate::store_types::{NewPurchase, PurchaseRecord};

pub(super) async fn record_purchase(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    payload: Result<Json<NewPurchase>, JsonRejection>,
) -> Result<(StatusCode, Json<RecordedPurchase>), ApiError> {
    state.ensure_admin(&headers)?;
    let Json(purchase) = payload.map_err(|err| invalid_request(err.body_text()))?;

    let recorded = state
        .purchases
        .record_purchase(purchase)
        .await
        .map_err(map_purchase_error)?;
    let status = if recorded.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(recorded)))
}

pub(super) async fn get_purchase(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<Json<PurchaseRecord>, ApiError> {
    state.ensure_admin(&headers)?;
    match state
        .purchases
        .get_purchase(&order_id)
        .await
        .map_err(map_purchase_error)?
    {
        Some(purchase) => Ok(Json(purchase)),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "PURCHASE_NOT_FOUND",
            format!("purchase {order_id} not found"),
        )),
    }
}
