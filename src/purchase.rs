//! Purchase confirmation state machine.
//!
//! The client confirmation call and the gateway webhook race on the same order. The store's
//! atomic claim picks one winner; the winner verifies, credits, appends history and completes.
//! Losers poll a bounded number of times for the terminal state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;

use crate::consumption::{ConsumptionService, PurchaseCredit, TokenError, TokenSnapshot};
use crate::policy::Plan;
use crate::store::StoreError;
use crate::store_types::{
    ClaimOutcome, CompletionSource, FailureKind, NewPurchase, PurchaseHistoryRecord,
    PurchaseRecord, PurchaseState, PurchaseStatus,
};
use crate::verifier::PaymentVerifier;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurchaseConfig {
    /// Re-reads performed by a caller that lost the claim.
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    /// A `processing` row older than this may be claimed again. Zero disables takeover.
    pub claim_lease_secs: u64,
}

impl Default for PurchaseConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 2,
            poll_interval_ms: 1_000,
            claim_lease_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmSource {
    Client { signature: String },
    /// The webhook body was authenticated before the state machine is entered.
    Webhook,
}

impl ConfirmSource {
    fn completion_source(&self) -> CompletionSource {
        match self {
            ConfirmSource::Client { .. } => CompletionSource::Client,
            ConfirmSource::Webhook => CompletionSource::Webhook,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub user_id: String,
    pub plan: Plan,
    pub order_id: String,
    pub payment_id: String,
    pub source: ConfirmSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConfirmOutcome {
    pub tokens_added: u64,
    pub token_balance: TokenSnapshot,
    pub already_completed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedPurchase {
    pub created: bool,
    pub purchase: PurchaseRecord,
}

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("payment signature verification failed")]
    InvalidSignature,
    #[error("purchase not found")]
    NotFound,
    #[error("purchase is already being processed")]
    AlreadyProcessing,
    #[error("purchase failed: {0}")]
    Failed(String),
    #[error("purchase confirmation failed: {0}")]
    ConfirmationFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PurchaseError {
    pub fn code(&self) -> &'static str {
        match self {
            PurchaseError::InvalidRequest(_) => "INVALID_REQUEST",
            PurchaseError::InvalidSignature => "INVALID_SIGNATURE",
            PurchaseError::NotFound => "PURCHASE_NOT_FOUND",
            PurchaseError::AlreadyProcessing => "PURCHASE_ALREADY_PROCESSING",
            PurchaseError::Failed(_) => "PURCHASE_FAILED",
            PurchaseError::ConfirmationFailed(_) => "PURCHASE_CONFIRMATION_FAILED",
            PurchaseError::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            PurchaseError::InvalidRequest(_) => 400,
            PurchaseError::InvalidSignature => 401,
            PurchaseError::NotFound => 404,
            PurchaseError::AlreadyProcessing => 409,
            PurchaseError::Failed(_) => 400,
            PurchaseError::ConfirmationFailed(_) => 500,
            PurchaseError::Store(_) => 500,
        }
    }
}

impl From<TokenError> for PurchaseError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(err) => PurchaseError::Store(err),
            other => PurchaseError::ConfirmationFailed(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PurchaseStateMachine {
    consumption: ConsumptionService,
    verifier: PaymentVerifier,
    config: PurchaseConfig,
}

impl PurchaseStateMachine {
    pub fn new(consumption: ConsumptionService, verifier: PaymentVerifier) -> Self {
        Self {
            consumption,
            verifier,
            config: PurchaseConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PurchaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PurchaseConfig {
        &self.config
    }

    pub fn verifier(&self) -> &PaymentVerifier {
        &self.verifier
    }

    /// Records a pending purchase. Recording the same order twice keeps the first row.
    pub async fn record_purchase(
        &self,
        purchase: NewPurchase,
    ) -> Result<RecordedPurchase, PurchaseError> {
        require_non_empty("order_id", &purchase.order_id)?;
        require_non_empty("user_id", &purchase.user_id)?;
        require_non_empty("currency", &purchase.currency)?;
        if purchase.token_amount == 0 {
            return Err(PurchaseError::InvalidRequest(
                "token_amount must be at least 1".to_string(),
            ));
        }

        let store = self.consumption.store();
        let now_ms = self.consumption.now_millis();
        let created = store.insert_purchase(&purchase, now_ms).await?;
        let Some(record) = store.load_purchase(&purchase.order_id).await? else {
            return Err(PurchaseError::Store(StoreError::UnexpectedResponse(
                format!("purchase {} missing after insert", purchase.order_id),
            )));
        };
        if created {
            tracing::info!(
                order_id = %record.order_id,
                user_id = %record.user_id,
                token_amount = record.token_amount,
                "pending purchase recorded"
            );
        }
        Ok(RecordedPurchase {
            created,
            purchase: record,
        })
    }

    pub async fn get_purchase(&self, order_id: &str) -> Result<Option<PurchaseRecord>, PurchaseError> {
        Ok(self.consumption.store().load_purchase(order_id).await?)
    }

    pub async fn purchase_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PurchaseHistoryRecord>, PurchaseError> {
        Ok(self
            .consumption
            .store()
            .list_purchase_history(user_id, limit)
            .await?)
    }

    /// Gateway reported the payment as failed. Only a still-pending order is marked.
    pub async fn mark_payment_failed(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<bool, PurchaseError> {
        let now_ms = self.consumption.now_millis();
        let marked = self
            .consumption
            .store()
            .fail_purchase(
                order_id,
                PurchaseStatus::Pending,
                FailureKind::Terminal,
                reason,
                now_ms,
            )
            .await?;
        if marked {
            tracing::info!(order_id, reason, "purchase marked failed by gateway");
        }
        Ok(marked)
    }

    /// Webhook entry point: the owner is read from the purchase row.
    pub async fn confirm_webhook<F>(
        &self,
        order_id: &str,
        payment_id: &str,
        plan_for: F,
    ) -> Result<ConfirmOutcome, PurchaseError>
    where
        F: FnOnce(&str) -> Plan,
    {
        require_non_empty("order_id", order_id)?;
        require_non_empty("payment_id", payment_id)?;
        let Some(purchase) = self
            .get_purchase(order_id)
            .await
            .map_err(confirmation_error)?
        else {
            return Err(PurchaseError::NotFound);
        };
        let plan = plan_for(&purchase.user_id);
        self.confirm(ConfirmRequest {
            user_id: purchase.user_id,
            plan,
            order_id: order_id.to_string(),
            payment_id: payment_id.to_string(),
            source: ConfirmSource::Webhook,
        })
        .await
    }

    pub async fn confirm(&self, request: ConfirmRequest) -> Result<ConfirmOutcome, PurchaseError> {
        require_non_empty("order_id", &request.order_id)?;
        require_non_empty("payment_id", &request.payment_id)?;
        if let ConfirmSource::Client { signature } = &request.source {
            require_non_empty("signature", signature)?;
        }

        let span = tracing::info_span!(
            "purchase.confirm",
            order_id = %request.order_id,
            user_id = %request.user_id,
            source = request.source.completion_source().as_str(),
        );
        self.confirm_inner(&request)
            .instrument(span)
            .await
            .map_err(confirmation_error)
    }

    async fn confirm_inner(&self, request: &ConfirmRequest) -> Result<ConfirmOutcome, PurchaseError> {
        let store = self.consumption.store();
        let lease_ms = self.config.claim_lease_secs.saturating_mul(1_000);
        let mut polls = 0u32;

        loop {
            let now_ms = self.consumption.now_millis();
            let claim = store
                .claim_purchase(&request.order_id, &request.user_id, now_ms, lease_ms)
                .await?;

            let purchase = match claim {
                ClaimOutcome::NotFound => return Err(PurchaseError::NotFound),
                ClaimOutcome::Claimed(purchase) => return self.finish(request, purchase).await,
                ClaimOutcome::Unavailable(purchase) => purchase,
            };

            match purchase.state() {
                PurchaseState::Completed => {
                    tracing::info!("purchase already completed");
                    let snapshot = self
                        .consumption
                        .get_user_tokens(&request.user_id, request.plan)
                        .await?;
                    return Ok(ConfirmOutcome {
                        tokens_added: purchase.token_amount,
                        token_balance: snapshot,
                        already_completed: true,
                    });
                }
                PurchaseState::FailedTerminal => {
                    let reason = purchase
                        .error_message
                        .unwrap_or_else(|| "purchase failed".to_string());
                    return Err(PurchaseError::Failed(reason));
                }
                PurchaseState::Pending
                | PurchaseState::Processing
                | PurchaseState::FailedRetryable => {
                    if polls >= self.config.poll_attempts {
                        tracing::info!(polls, "purchase still processing elsewhere");
                        return Err(PurchaseError::AlreadyProcessing);
                    }
                    polls += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms))
                        .await;
                }
            }
        }
    }

    /// Runs with the claim held: verify, credit, history, complete.
    async fn finish(
        &self,
        request: &ConfirmRequest,
        purchase: PurchaseRecord,
    ) -> Result<ConfirmOutcome, PurchaseError> {
        let signature_ok = match &request.source {
            ConfirmSource::Client { signature } => {
                self.verifier
                    .verify_signature(&request.order_id, &request.payment_id, signature)
            }
            ConfirmSource::Webhook => true,
        };
        if !signature_ok {
            tracing::warn!("payment signature rejected");
            self.mark_failed(
                &request.order_id,
                FailureKind::Terminal,
                "payment signature verification failed",
            )
            .await;
            return Err(PurchaseError::InvalidSignature);
        }

        let credit = match self
            .consumption
            .credit_purchase(&request.order_id, request.plan)
            .await
        {
            Ok(credit) => credit,
            Err(err) => {
                tracing::error!(error = %err, "crediting purchase failed");
                let failure = self.credit_failure_kind(&request.order_id).await;
                self.mark_failed(&request.order_id, failure, &err.to_string())
                    .await;
                return Err(PurchaseError::ConfirmationFailed(err.to_string()));
            }
        };
        let snapshot = match credit {
            PurchaseCredit::Credited(snapshot) | PurchaseCredit::AlreadyCredited(snapshot) => {
                snapshot
            }
            PurchaseCredit::NotOwned => {
                tracing::warn!("claim lost before crediting");
                return Err(PurchaseError::AlreadyProcessing);
            }
        };

        let store = self.consumption.store();
        let now_ms = self.consumption.now_millis();
        let history = PurchaseHistoryRecord {
            order_id: purchase.order_id.clone(),
            user_id: purchase.user_id.clone(),
            token_amount: purchase.token_amount,
            amount_minor: purchase.amount_minor,
            currency: purchase.currency.clone(),
            payment_id: request.payment_id.clone(),
            source: request.source.completion_source(),
            recorded_at_ms: now_ms,
        };
        if let Err(err) = store.append_purchase_history(&history).await {
            return Err(self.finalization_failed(&request.order_id, err).await);
        }

        let already_completed = match store
            .complete_purchase(&request.order_id, &request.payment_id, now_ms)
            .await
        {
            Ok(true) => false,
            Ok(false) => {
                tracing::warn!("purchase completed by another confirmation");
                true
            }
            Err(err) => return Err(self.finalization_failed(&request.order_id, err).await),
        };

        tracing::info!(
            tokens_added = purchase.token_amount,
            purchased_balance = snapshot.purchased_tokens,
            "purchase completed"
        );
        Ok(ConfirmOutcome {
            tokens_added: purchase.token_amount,
            token_balance: snapshot,
            already_completed,
        })
    }

    /// A credit reply can be lost after it committed; the marker on the row decides.
    async fn credit_failure_kind(&self, order_id: &str) -> FailureKind {
        match self.consumption.store().load_purchase(order_id).await {
            Ok(Some(purchase)) if !purchase.is_credited() => FailureKind::Terminal,
            Ok(Some(_)) => FailureKind::Retryable,
            Ok(None) => FailureKind::Terminal,
            Err(err) => {
                tracing::error!(order_id, error = %err, "reloading purchase after credit failure");
                FailureKind::Retryable
            }
        }
    }

    /// The credited marker is already set, so a retry finishes without crediting again.
    async fn finalization_failed(&self, order_id: &str, err: StoreError) -> PurchaseError {
        tracing::error!(error = %err, "finalizing credited purchase failed");
        self.mark_failed(order_id, FailureKind::Retryable, &err.to_string())
            .await;
        PurchaseError::ConfirmationFailed(err.to_string())
    }

    async fn mark_failed(&self, order_id: &str, failure: FailureKind, message: &str) {
        let now_ms = self.consumption.now_millis();
        let result = self
            .consumption
            .store()
            .fail_purchase(
                order_id,
                PurchaseStatus::Processing,
                failure,
                message,
                now_ms,
            )
            .await;
        if let Err(err) = result {
            tracing::error!(order_id, error = %err, "marking purchase failed did not persist");
        }
    }
}

fn confirmation_error(err: PurchaseError) -> PurchaseError {
    match err {
        PurchaseError::Store(err) => {
            tracing::error!(error = %err, "purchase confirmation store failure");
            PurchaseError::ConfirmationFailed(err.to_string())
        }
        other => other,
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), PurchaseError> {
    if value.trim().is_empty() {
        return Err(PurchaseError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}
