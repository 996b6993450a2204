use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::clock::{Clock, SystemClock, format_rfc3339};
use crate::policy::{DailyLimit, Plan, QuotaPolicy, UNLIMITED_TOKENS};
use crate::store::{StoreError, TokenStore};
use crate::store_types::{ConsumeOutcome, CreditOutcome, TokenLedgerRecord};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenSnapshot {
    pub plan: Plan,
    pub available_tokens: u64,
    pub purchased_tokens: u64,
    pub daily_limit: u64,
    pub daily_tokens_used: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_reset_at: Option<String>,
    pub unlimited: bool,
}

impl TokenSnapshot {
    fn unlimited(plan: Plan, purchased_tokens: u64) -> Self {
        Self {
            plan,
            available_tokens: UNLIMITED_TOKENS,
            purchased_tokens,
            daily_limit: UNLIMITED_TOKENS,
            daily_tokens_used: 0,
            total_tokens: UNLIMITED_TOKENS,
            daily_reset_at: None,
            unlimited: true,
        }
    }

    fn from_ledger(ledger: &TokenLedgerRecord, plan: Plan, limit: DailyLimit) -> Self {
        let DailyLimit::Limited(daily_limit) = limit else {
            return Self::unlimited(plan, ledger.purchased_balance);
        };
        let daily_remaining = daily_limit.saturating_sub(ledger.daily_tokens_used);
        Self {
            plan,
            available_tokens: daily_remaining.saturating_add(ledger.purchased_balance),
            purchased_tokens: ledger.purchased_balance,
            daily_limit,
            daily_tokens_used: ledger.daily_tokens_used,
            total_tokens: daily_limit.saturating_add(ledger.purchased_balance),
            daily_reset_at: Some(format_rfc3339(ledger.daily_reset_at_ms)),
            unlimited: false,
        }
    }
}

/// Outcome of one successful debit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Consumption {
    pub cost: u64,
    pub from_daily: u64,
    pub from_purchased: u64,
    pub snapshot: TokenSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurchaseCredit {
    Credited(TokenSnapshot),
    AlreadyCredited(TokenSnapshot),
    NotOwned,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token cost must be at least 1")]
    InvalidCost,
    #[error("insufficient tokens: required={required} available={available}")]
    InsufficientTokens {
        required: u64,
        available: u64,
        snapshot: Box<TokenSnapshot>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Debits and credits user ledgers through the store's atomic operations.
#[derive(Clone)]
pub struct ConsumptionService {
    store: Arc<dyn TokenStore>,
    policy: Arc<QuotaPolicy>,
    clock: Arc<dyn Clock>,
}

impl ConsumptionService {
    pub fn new(store: Arc<dyn TokenStore>, policy: QuotaPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TokenStore>,
        policy: QuotaPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            clock,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub(crate) fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub async fn consume_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        cost: u64,
        context: &str,
    ) -> Result<Consumption, TokenError> {
        if cost == 0 {
            return Err(TokenError::InvalidCost);
        }

        let DailyLimit::Limited(daily_limit) = self.policy.daily_limit(plan) else {
            tracing::debug!(user_id, %plan, cost, context, "unlimited plan bypasses ledger");
            return Ok(Consumption {
                cost,
                from_daily: 0,
                from_purchased: 0,
                snapshot: TokenSnapshot::unlimited(plan, 0),
            });
        };

        let now_ms = self.clock.now_millis();
        let outcome = self
            .store
            .consume_tokens(user_id, plan, daily_limit, cost, now_ms)
            .await?;

        match outcome {
            ConsumeOutcome::Consumed {
                ledger,
                from_daily,
                from_purchased,
            } => {
                tracing::info!(
                    user_id,
                    %plan,
                    cost,
                    from_daily,
                    from_purchased,
                    context,
                    "tokens consumed"
                );
                Ok(Consumption {
                    cost,
                    from_daily,
                    from_purchased,
                    snapshot: TokenSnapshot::from_ledger(
                        &ledger,
                        plan,
                        DailyLimit::Limited(daily_limit),
                    ),
                })
            }
            ConsumeOutcome::Insufficient { ledger } => {
                let snapshot =
                    TokenSnapshot::from_ledger(&ledger, plan, DailyLimit::Limited(daily_limit));
                tracing::info!(
                    user_id,
                    %plan,
                    cost,
                    available = snapshot.available_tokens,
                    context,
                    "insufficient tokens"
                );
                Err(TokenError::InsufficientTokens {
                    required: cost,
                    available: snapshot.available_tokens,
                    snapshot: Box::new(snapshot),
                })
            }
        }
    }

    /// Not idempotent: every call adds `amount`. Returns the new purchased balance.
    pub async fn add_purchased_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        amount: u64,
        context: &str,
    ) -> Result<u64, TokenError> {
        let now_ms = self.clock.now_millis();
        let ledger = self
            .store
            .add_purchased_tokens(user_id, plan, amount, now_ms)
            .await?;
        tracing::info!(
            user_id,
            %plan,
            amount,
            purchased_balance = ledger.purchased_balance,
            context,
            "purchased tokens added"
        );
        Ok(ledger.purchased_balance)
    }

    /// Credits a claimed order's tokens at most once, keyed by the order's credited marker.
    pub async fn credit_purchase(
        &self,
        order_id: &str,
        plan: Plan,
    ) -> Result<PurchaseCredit, TokenError> {
        let now_ms = self.clock.now_millis();
        let limit = self.policy.daily_limit(plan);
        Ok(
            match self.store.credit_purchase(order_id, plan, now_ms).await? {
                CreditOutcome::Credited(ledger) => {
                    tracing::info!(
                        order_id,
                        user_id = %ledger.user_id,
                        purchased_balance = ledger.purchased_balance,
                        "purchase credited"
                    );
                    PurchaseCredit::Credited(TokenSnapshot::from_ledger(&ledger, plan, limit))
                }
                CreditOutcome::AlreadyCredited(ledger) => {
                    tracing::info!(order_id, "purchase already credited");
                    PurchaseCredit::AlreadyCredited(TokenSnapshot::from_ledger(
                        &ledger, plan, limit,
                    ))
                }
                CreditOutcome::NotOwned => PurchaseCredit::NotOwned,
            },
        )
    }

    /// Applies and persists the daily reset before reporting, so reads never lag a boundary.
    /// Unlimited plans are answered without touching the store.
    pub async fn get_user_tokens(
        &self,
        user_id: &str,
        plan: Plan,
    ) -> Result<TokenSnapshot, TokenError> {
        let limit = self.policy.daily_limit(plan);
        if limit == DailyLimit::Unlimited {
            return Ok(TokenSnapshot::unlimited(plan, 0));
        }
        let now_ms = self.clock.now_millis();
        let ledger = self.store.touch_ledger(user_id, plan, now_ms).await?;
        Ok(TokenSnapshot::from_ledger(&ledger, plan, limit))
    }
}

#[cfg(all(test, feature = "store-sqlite"))]
mod tests {
    use super::*;
    use crate::clock::{DAY_MS, ManualClock};
    use crate::sqlite_store::SqliteStore;

    async fn service(start_ms: u64) -> (tempfile::TempDir, ManualClock, ConsumptionService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        let clock = ManualClock::new(start_ms);
        let service = ConsumptionService::with_clock(
            Arc::new(store),
            QuotaPolicy::default(),
            Arc::new(clock.clone()),
        );
        (dir, clock, service)
    }

    #[tokio::test]
    async fn spills_from_daily_into_purchased_balance() {
        let (_dir, _clock, service) = service(3 * DAY_MS).await;
        let balance = service
            .add_purchased_tokens("user-1", Plan::Standard, 10, "grant")
            .await
            .expect("grant");
        assert_eq!(balance, 10);
        service
            .consume_tokens("user-1", Plan::Standard, 18, "study_guide")
            .await
            .expect("consume 18");

        let consumption = service
            .consume_tokens("user-1", Plan::Standard, 5, "study_guide")
            .await
            .expect("consume 5");
        assert_eq!(consumption.from_daily, 2);
        assert_eq!(consumption.from_purchased, 3);
        assert_eq!(consumption.snapshot.daily_tokens_used, 20);
        assert_eq!(consumption.snapshot.purchased_tokens, 7);
        assert_eq!(consumption.snapshot.available_tokens, 7);
        assert_eq!(consumption.snapshot.total_tokens, 27);
    }

    #[tokio::test]
    async fn insufficient_tokens_leave_ledger_untouched() {
        let (_dir, _clock, service) = service(3 * DAY_MS).await;
        let err = service
            .consume_tokens("user-1", Plan::Free, 9, "study_guide")
            .await
            .expect_err("free plan has 8 tokens");
        let TokenError::InsufficientTokens {
            required,
            available,
            snapshot,
        } = err
        else {
            panic!("expected insufficient tokens");
        };
        assert_eq!(required, 9);
        assert_eq!(available, 8);
        assert_eq!(snapshot.daily_tokens_used, 0);

        let snapshot = service
            .get_user_tokens("user-1", Plan::Free)
            .await
            .expect("snapshot");
        assert_eq!(snapshot.available_tokens, 8);
    }

    #[tokio::test]
    async fn zero_cost_is_rejected() {
        let (_dir, _clock, service) = service(3 * DAY_MS).await;
        let err = service
            .consume_tokens("user-1", Plan::Standard, 0, "study_guide")
            .await
            .expect_err("zero cost");
        assert!(matches!(err, TokenError::InvalidCost));
    }

    #[tokio::test]
    async fn daily_usage_resets_at_boundary_without_touching_purchases() {
        let (_dir, clock, service) = service(4 * DAY_MS - 10).await;
        service
            .add_purchased_tokens("user-1", Plan::Standard, 5, "grant")
            .await
            .expect("grant");
        let before = service
            .consume_tokens("user-1", Plan::Standard, 20, "study_guide")
            .await
            .expect("drain daily");
        assert_eq!(before.snapshot.daily_tokens_used, 20);
        assert_eq!(
            before.snapshot.daily_reset_at.as_deref(),
            Some("1970-01-05T00:00:00Z")
        );

        clock.set(4 * DAY_MS);
        let after = service
            .consume_tokens("user-1", Plan::Standard, 1, "study_guide")
            .await
            .expect("consume after reset");
        assert_eq!(after.from_daily, 1);
        assert_eq!(after.snapshot.daily_tokens_used, 1);
        assert_eq!(after.snapshot.purchased_tokens, 5);
    }

    #[tokio::test]
    async fn reads_apply_the_daily_reset() {
        let (_dir, clock, service) = service(DAY_MS + 1).await;
        service
            .consume_tokens("user-1", Plan::Standard, 12, "study_guide")
            .await
            .expect("consume");
        clock.advance(DAY_MS);
        let snapshot = service
            .get_user_tokens("user-1", Plan::Standard)
            .await
            .expect("snapshot");
        assert_eq!(snapshot.daily_tokens_used, 0);
        assert_eq!(snapshot.available_tokens, 20);
    }

    #[tokio::test]
    async fn unlimited_plan_never_touches_counters() {
        let (_dir, _clock, service) = service(DAY_MS).await;
        for _ in 0..50 {
            let consumption = service
                .consume_tokens("user-1", Plan::Premium, 30, "study_guide")
                .await
                .expect("unlimited");
            assert!(consumption.snapshot.unlimited);
            assert_eq!(consumption.snapshot.available_tokens, UNLIMITED_TOKENS);
        }

        let ledger = service
            .store()
            .touch_ledger("user-1", Plan::Standard, DAY_MS)
            .await
            .expect("ledger");
        assert_eq!(ledger.daily_tokens_used, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_cannot_double_spend() {
        let (_dir, _clock, service) = service(DAY_MS).await;
        service
            .consume_tokens("user-1", Plan::Standard, 10, "warmup")
            .await
            .expect("warmup");

        let attempts = (0..8).map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .consume_tokens("user-1", Plan::Standard, 10, "study_guide")
                    .await
            })
        });
        let results = futures_util::future::join_all(attempts).await;

        let mut successes = 0;
        let mut insufficient = 0;
        for result in results {
            match result.expect("join") {
                Ok(_) => successes += 1,
                Err(TokenError::InsufficientTokens { .. }) => insufficient += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(insufficient, 7);
    }
}
