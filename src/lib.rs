//! Token ledger: daily quotas, purchased balances and idempotent purchase confirmation.
//!
//! Every balance mutation is a single atomic store operation, so concurrent requests for the
//! same user or order are serialized by the store rather than by the process.

pub mod clock;
pub mod config;
pub mod consumption;
pub mod observability;
pub mod policy;
pub mod purchase;
pub mod store;
pub mod store_types;
pub mod verifier;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigFormat, LedgerConfig, PaymentConfig, UserConfig};
pub use consumption::{
    Consumption, ConsumptionService, PurchaseCredit, TokenError, TokenSnapshot,
};
pub use policy::{
    DailyLimit, DailyLimits, ModePercents, Plan, PolicyConfig, QuotaPolicy, StudyMode,
    UNLIMITED_TOKENS,
};
pub use purchase::{
    ConfirmOutcome, ConfirmRequest, ConfirmSource, PurchaseConfig, PurchaseError,
    PurchaseStateMachine, RecordedPurchase,
};
pub use store::{StoreError, TokenStore};
pub use store_types::{
    ClaimOutcome, CompletionSource, ConsumeOutcome, CreditOutcome, FailureKind, NewPurchase,
    PurchaseHistoryRecord, PurchaseRecord, PurchaseState, PurchaseStatus, TokenLedgerRecord,
};
pub use verifier::PaymentVerifier;

#[cfg(feature = "http")]
pub use http::{LedgerHttpState, router};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
