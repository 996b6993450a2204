use serde::{Deserialize, Serialize};

use crate::policy::Plan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedgerRecord {
    pub user_id: String,
    pub plan: Plan,
    pub daily_tokens_used: u64,
    pub daily_reset_at_ms: u64,
    pub purchased_balance: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Processing => "processing",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PurchaseStatus::Pending),
            "processing" => Some(PurchaseStatus::Processing),
            "completed" => Some(PurchaseStatus::Completed),
            "failed" => Some(PurchaseStatus::Failed),
            _ => None,
        }
    }
}

/// Sub-tag of a failed purchase. Only `Retryable` rows may be claimed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Terminal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Terminal => "terminal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "retryable" => Some(FailureKind::Retryable),
            "terminal" => Some(FailureKind::Terminal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    Pending,
    Processing,
    Completed,
    FailedRetryable,
    FailedTerminal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchase {
    pub order_id: String,
    pub user_id: String,
    pub token_amount: u64,
    pub amount_minor: u64,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub order_id: String,
    pub user_id: String,
    pub token_amount: u64,
    pub amount_minor: u64,
    pub currency: String,
    pub status: PurchaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credited_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl PurchaseRecord {
    pub fn state(&self) -> PurchaseState {
        match (self.status, self.failure) {
            (PurchaseStatus::Pending, _) => PurchaseState::Pending,
            (PurchaseStatus::Processing, _) => PurchaseState::Processing,
            (PurchaseStatus::Completed, _) => PurchaseState::Completed,
            (PurchaseStatus::Failed, Some(FailureKind::Retryable)) => {
                PurchaseState::FailedRetryable
            }
            // Rows without a sub-tag never become claimable again.
            (PurchaseStatus::Failed, _) => PurchaseState::FailedTerminal,
        }
    }

    pub fn is_credited(&self) -> bool {
        self.credited_at_ms.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Client,
    Webhook,
}

impl CompletionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionSource::Client => "client",
            CompletionSource::Webhook => "webhook",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseHistoryRecord {
    pub order_id: String,
    pub user_id: String,
    pub token_amount: u64,
    pub amount_minor: u64,
    pub currency: String,
    pub payment_id: String,
    pub source: CompletionSource,
    pub recorded_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed {
        ledger: TokenLedgerRecord,
        from_daily: u64,
        from_purchased: u64,
    },
    Insufficient {
        ledger: TokenLedgerRecord,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited(TokenLedgerRecord),
    AlreadyCredited(TokenLedgerRecord),
    /// The order is not in `processing`, so the caller no longer owns it.
    NotOwned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(PurchaseRecord),
    Unavailable(PurchaseRecord),
    NotFound,
}
