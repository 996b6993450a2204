//! Durable storage contract for ledgers, purchases and purchase history.
//!
//! Every method is one atomic store operation. Implementations must not split a
//! check-and-mutate across round trips: SQLite runs each call in an `IMMEDIATE` transaction,
//! Redis runs each call as a single Lua script.

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::Plan;
use crate::store_types::{
    ClaimOutcome, ConsumeOutcome, CreditOutcome, FailureKind, NewPurchase, PurchaseHistoryRecord,
    PurchaseRecord, PurchaseStatus, TokenLedgerRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads the ledger, creating it and rolling the daily window as needed. The reset is
    /// persisted.
    async fn touch_ledger(
        &self,
        user_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError>;

    /// Rolls the daily window, then deducts `cost` daily-first when enough tokens remain.
    async fn consume_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        daily_limit: u64,
        cost: u64,
        now_ms: u64,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Unconditional increment of the purchased balance.
    async fn add_purchased_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        amount: u64,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError>;

    /// Sets the order's credited marker and increments the balance together. A second call for
    /// the same order reports `AlreadyCredited` and leaves the balance alone.
    async fn credit_purchase(
        &self,
        order_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<CreditOutcome, StoreError>;

    /// Returns `false` when the order already exists.
    async fn insert_purchase(&self, purchase: &NewPurchase, now_ms: u64)
    -> Result<bool, StoreError>;

    async fn load_purchase(&self, order_id: &str) -> Result<Option<PurchaseRecord>, StoreError>;

    /// Moves the order to `processing` when it is pending, failed with a retryable tag, or
    /// processing with an expired lease. A zero `lease_ms` disables lease takeover.
    async fn claim_purchase(
        &self,
        order_id: &str,
        user_id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<ClaimOutcome, StoreError>;

    /// `processing -> completed`. Returns `false` when the row was not processing.
    async fn complete_purchase(
        &self,
        order_id: &str,
        payment_id: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Marks the order failed only if it is currently in `expected`.
    async fn fail_purchase(
        &self,
        order_id: &str,
        expected: PurchaseStatus,
        failure: FailureKind,
        message: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Insert-once by order id. Returns `false` when a record already exists.
    async fn append_purchase_history(
        &self,
        record: &PurchaseHistoryRecord,
    ) -> Result<bool, StoreError>;

    /// Newest first.
    async fn list_purchase_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PurchaseHistoryRecord>, StoreError>;
}
