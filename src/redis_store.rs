use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::clock::next_daily_reset;
use crate::policy::Plan;
use crate::store::{StoreError, TokenStore};
use crate::store_types::{
    ClaimOutcome, ConsumeOutcome, CreditOutcome, FailureKind, NewPurchase, PurchaseHistoryRecord,
    PurchaseRecord, PurchaseStatus, TokenLedgerRecord,
};

mod scripts;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "token_ledger".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_ledger(&self, user_id: &str) -> String {
        format!("{}:ledger:{user_id}", self.prefix)
    }

    fn key_purchase(&self, order_id: &str) -> String {
        format!("{}:purchase:{order_id}", self.prefix)
    }

    fn key_history(&self, order_id: &str) -> String {
        format!("{}:history:{order_id}", self.prefix)
    }

    fn key_history_by_user(&self, user_id: &str) -> String {
        format!("{}:history_by_user:{user_id}", self.prefix)
    }
}

fn ledger_script(body: &str) -> redis::Script {
    redis::Script::new(&format!("{}\n{body}", scripts::LEDGER_HELPERS))
}

#[async_trait]
impl TokenStore for RedisStore {
    async fn touch_ledger(
        &self,
        user_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<String> = ledger_script(scripts::TOUCH_LEDGER)
            .key(self.key_ledger(user_id))
            .arg(plan.as_str())
            .arg(now_ms)
            .arg(next_daily_reset(now_ms))
            .invoke_async(&mut conn)
            .await?;
        let (_, ledger, _, _) = parse_ledger_reply(user_id, &reply)?;
        Ok(ledger)
    }

    async fn consume_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        daily_limit: u64,
        cost: u64,
        now_ms: u64,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<String> = ledger_script(scripts::CONSUME_TOKENS)
            .key(self.key_ledger(user_id))
            .arg(plan.as_str())
            .arg(daily_limit)
            .arg(cost)
            .arg(now_ms)
            .arg(next_daily_reset(now_ms))
            .invoke_async(&mut conn)
            .await?;

        let (tag, ledger, from_daily, from_purchased) = parse_ledger_reply(user_id, &reply)?;
        match tag {
            "OK" => Ok(ConsumeOutcome::Consumed {
                ledger,
                from_daily,
                from_purchased,
            }),
            "INSUFFICIENT" => Ok(ConsumeOutcome::Insufficient { ledger }),
            other => Err(unexpected(format!("consume reply: {other}"))),
        }
    }

    async fn add_purchased_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        amount: u64,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<String> = ledger_script(scripts::ADD_PURCHASED_TOKENS)
            .key(self.key_ledger(user_id))
            .arg(plan.as_str())
            .arg(amount)
            .arg(now_ms)
            .arg(next_daily_reset(now_ms))
            .invoke_async(&mut conn)
            .await?;
        let (_, ledger, _, _) = parse_ledger_reply(user_id, &reply)?;
        Ok(ledger)
    }

    async fn credit_purchase(
        &self,
        order_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<CreditOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Vec<String> = ledger_script(scripts::CREDIT_PURCHASE)
            .key(self.key_purchase(order_id))
            .arg(&self.prefix)
            .arg(plan.as_str())
            .arg(now_ms)
            .arg(next_daily_reset(now_ms))
            .invoke_async(&mut conn)
            .await?;

        if reply.first().map(String::as_str) == Some("NOT_OWNED") {
            return Ok(CreditOutcome::NotOwned);
        }
        // The ledger reply does not carry the user id; the purchase row does.
        let user_id: Option<String> = conn.hget(self.key_purchase(order_id), "user_id").await?;
        let user_id = user_id.unwrap_or_default();
        let (tag, ledger, _, _) = parse_ledger_reply(&user_id, &reply)?;
        match tag {
            "CREDITED" => Ok(CreditOutcome::Credited(ledger)),
            "ALREADY_CREDITED" => Ok(CreditOutcome::AlreadyCredited(ledger)),
            other => Err(unexpected(format!("credit reply: {other}"))),
        }
    }

    async fn insert_purchase(
        &self,
        purchase: &NewPurchase,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let inserted: i64 = redis::Script::new(scripts::INSERT_PURCHASE)
            .key(self.key_purchase(&purchase.order_id))
            .arg(&purchase.order_id)
            .arg(&purchase.user_id)
            .arg(purchase.token_amount)
            .arg(purchase.amount_minor)
            .arg(&purchase.currency)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn load_purchase(&self, order_id: &str) -> Result<Option<PurchaseRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_purchase(order_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        parse_purchase(&raw).map(Some)
    }

    async fn claim_purchase(
        &self,
        order_id: &str,
        user_id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let lease_cutoff: i64 = if lease_ms == 0 {
            -1
        } else {
            i64::try_from(now_ms.saturating_sub(lease_ms)).unwrap_or(i64::MAX)
        };
        let reply: Vec<String> = redis::Script::new(scripts::CLAIM_PURCHASE)
            .key(self.key_purchase(order_id))
            .arg(user_id)
            .arg(now_ms)
            .arg(lease_cutoff)
            .invoke_async(&mut conn)
            .await?;

        let Some((tag, fields)) = reply.split_first() else {
            return Err(unexpected("empty claim reply"));
        };
        if tag == "NOT_FOUND" {
            return Ok(ClaimOutcome::NotFound);
        }
        let raw: HashMap<String, String> = fields
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        let purchase = parse_purchase(&raw)?;
        match tag.as_str() {
            "CLAIMED" => Ok(ClaimOutcome::Claimed(purchase)),
            "UNAVAILABLE" => Ok(ClaimOutcome::Unavailable(purchase)),
            other => Err(unexpected(format!("claim reply: {other}"))),
        }
    }

    async fn complete_purchase(
        &self,
        order_id: &str,
        payment_id: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let changed: i64 = redis::Script::new(scripts::COMPLETE_PURCHASE)
            .key(self.key_purchase(order_id))
            .arg(payment_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn fail_purchase(
        &self,
        order_id: &str,
        expected: PurchaseStatus,
        failure: FailureKind,
        message: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let changed: i64 = redis::Script::new(scripts::FAIL_PURCHASE)
            .key(self.key_purchase(order_id))
            .arg(expected.as_str())
            .arg(failure.as_str())
            .arg(message)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn append_purchase_history(
        &self,
        record: &PurchaseHistoryRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(record)?;
        let inserted: i64 = redis::Script::new(scripts::APPEND_HISTORY)
            .key(self.key_history(&record.order_id))
            .key(self.key_history_by_user(&record.user_id))
            .arg(payload)
            .arg(record.recorded_at_ms)
            .arg(&record.order_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn list_purchase_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PurchaseHistoryRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let stop = isize::try_from(limit.max(1)).unwrap_or(isize::MAX) - 1;
        let order_ids: Vec<String> = conn
            .zrevrange(self.key_history_by_user(user_id), 0, stop)
            .await?;

        let mut out = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            let raw: Option<String> = conn.get(self.key_history(&order_id)).await?;
            let Some(raw) = raw else {
                continue;
            };
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}

fn unexpected(message: impl Into<String>) -> StoreError {
    StoreError::UnexpectedResponse(message.into())
}

fn parse_ledger_reply<'a>(
    user_id: &str,
    reply: &'a [String],
) -> Result<(&'a str, TokenLedgerRecord, u64, u64), StoreError> {
    let [tag, plan, used, reset_at, purchased, updated_at, from_daily, from_purchased] = reply
    else {
        return Err(unexpected(format!(
            "ledger reply has {} fields",
            reply.len()
        )));
    };
    let ledger = TokenLedgerRecord {
        user_id: user_id.to_string(),
        plan: plan.parse::<Plan>().map_err(StoreError::UnexpectedResponse)?,
        daily_tokens_used: parse_u64(used),
        daily_reset_at_ms: parse_u64(reset_at),
        purchased_balance: parse_u64(purchased),
        updated_at_ms: parse_u64(updated_at),
    };
    Ok((
        tag.as_str(),
        ledger,
        parse_u64(from_daily),
        parse_u64(from_purchased),
    ))
}

fn parse_purchase(raw: &HashMap<String, String>) -> Result<PurchaseRecord, StoreError> {
    let field = |name: &str| raw.get(name).cloned();
    let number = |name: &str| raw.get(name).map(|value| parse_u64(value));

    let status = field("status").unwrap_or_default();
    let status = PurchaseStatus::parse(&status)
        .ok_or_else(|| unexpected(format!("unknown purchase status: {status}")))?;
    Ok(PurchaseRecord {
        order_id: field("order_id").unwrap_or_default(),
        user_id: field("user_id").unwrap_or_default(),
        token_amount: number("token_amount").unwrap_or(0),
        amount_minor: number("amount_minor").unwrap_or(0),
        currency: field("currency").unwrap_or_default(),
        status,
        failure: raw
            .get("failure_kind")
            .and_then(|value| FailureKind::parse(value)),
        payment_id: field("payment_id"),
        error_message: field("error_message"),
        credited_at_ms: number("credited_at_ms"),
        created_at_ms: number("created_at_ms").unwrap_or(0),
        updated_at_ms: number("updated_at_ms").unwrap_or(0),
        completed_at_ms: number("completed_at_ms"),
    })
}

// Lua hands numbers back either as integers or as "%.17g" strings.
fn parse_u64(raw: &str) -> u64 {
    let raw = raw.trim();
    raw.parse::<u64>()
        .ok()
        .or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value as u64)
        })
        .unwrap_or(0)
}
