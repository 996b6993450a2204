use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::clock::next_daily_reset;
use crate::policy::Plan;
use crate::store::{StoreError, TokenStore};
use crate::store_types::{
    ClaimOutcome, CompletionSource, ConsumeOutcome, CreditOutcome, FailureKind, NewPurchase,
    PurchaseHistoryRecord, PurchaseRecord, PurchaseStatus, TokenLedgerRecord,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn touch_ledger(
        &self,
        user_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<TokenLedgerRecord, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ledger = roll_ledger(&tx, &user_id, plan, now_ms)?;
            tx.commit()?;
            Ok(ledger)
        })
        .await?
    }

    async fn consume_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        daily_limit: u64,
        cost: u64,
        now_ms: u64,
    ) -> Result<ConsumeOutcome, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<ConsumeOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ledger = roll_ledger(&tx, &user_id, plan, now_ms)?;
            let daily_remaining = daily_limit.saturating_sub(ledger.daily_tokens_used);
            let available = daily_remaining.saturating_add(ledger.purchased_balance);
            if available < cost {
                // Keep the rolled window even though nothing is deducted.
                tx.commit()?;
                return Ok(ConsumeOutcome::Insufficient { ledger });
            }

            let from_daily = cost.min(daily_remaining);
            let from_purchased = cost - from_daily;
            let changed = tx.execute(
                "UPDATE token_ledger
                 SET daily_tokens_used = daily_tokens_used + ?2,
                     purchased_balance = purchased_balance - ?3,
                     updated_at_ms = ?4
                 WHERE user_id = ?1
                   AND daily_tokens_used = ?5
                   AND purchased_balance = ?6
                   AND purchased_balance >= ?3",
                rusqlite::params![
                    user_id,
                    u64_to_i64(from_daily),
                    u64_to_i64(from_purchased),
                    u64_to_i64(now_ms),
                    u64_to_i64(ledger.daily_tokens_used),
                    u64_to_i64(ledger.purchased_balance),
                ],
            )?;
            if changed != 1 {
                return Err(StoreError::UnexpectedResponse(format!(
                    "ledger for {user_id} changed during consumption"
                )));
            }

            let ledger = load_ledger(&tx, &user_id)?;
            tx.commit()?;
            Ok(ConsumeOutcome::Consumed {
                ledger,
                from_daily,
                from_purchased,
            })
        })
        .await?
    }

    async fn add_purchased_tokens(
        &self,
        user_id: &str,
        plan: Plan,
        amount: u64,
        now_ms: u64,
    ) -> Result<TokenLedgerRecord, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<TokenLedgerRecord, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            roll_ledger(&tx, &user_id, plan, now_ms)?;
            increment_purchased(&tx, &user_id, amount, now_ms)?;
            let ledger = load_ledger(&tx, &user_id)?;
            tx.commit()?;
            Ok(ledger)
        })
        .await?
    }

    async fn credit_purchase(
        &self,
        order_id: &str,
        plan: Plan,
        now_ms: u64,
    ) -> Result<CreditOutcome, StoreError> {
        let path = self.path.clone();
        let order_id = order_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<CreditOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(purchase) = select_purchase(&tx, &order_id)? else {
                return Ok(CreditOutcome::NotOwned);
            };
            if purchase.is_credited() {
                let ledger = roll_ledger(&tx, &purchase.user_id, plan, now_ms)?;
                tx.commit()?;
                return Ok(CreditOutcome::AlreadyCredited(ledger));
            }

            let marked = tx.execute(
                "UPDATE purchases
                 SET credited_at_ms = ?2,
                     updated_at_ms = ?2
                 WHERE order_id = ?1
                   AND status = 'processing'
                   AND credited_at_ms IS NULL",
                rusqlite::params![order_id, u64_to_i64(now_ms)],
            )?;
            if marked != 1 {
                return Ok(CreditOutcome::NotOwned);
            }

            roll_ledger(&tx, &purchase.user_id, plan, now_ms)?;
            increment_purchased(&tx, &purchase.user_id, purchase.token_amount, now_ms)?;
            let ledger = load_ledger(&tx, &purchase.user_id)?;
            tx.commit()?;
            Ok(CreditOutcome::Credited(ledger))
        })
        .await?
    }

    async fn insert_purchase(
        &self,
        purchase: &NewPurchase,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let purchase = purchase.clone();

        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO purchases
                 (order_id, user_id, token_amount, amount_minor, currency, status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                rusqlite::params![
                    purchase.order_id,
                    purchase.user_id,
                    u64_to_i64(purchase.token_amount),
                    u64_to_i64(purchase.amount_minor),
                    purchase.currency,
                    u64_to_i64(now_ms),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await?
    }

    async fn load_purchase(&self, order_id: &str) -> Result<Option<PurchaseRecord>, StoreError> {
        let path = self.path.clone();
        let order_id = order_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<PurchaseRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            select_purchase(&conn, &order_id)
        })
        .await?
    }

    async fn claim_purchase(
        &self,
        order_id: &str,
        user_id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<ClaimOutcome, StoreError> {
        let path = self.path.clone();
        let order_id = order_id.to_string();
        let user_id = user_id.to_string();
        let lease_cutoff = if lease_ms == 0 {
            -1
        } else {
            u64_to_i64(now_ms.saturating_sub(lease_ms))
        };

        tokio::task::spawn_blocking(move || -> Result<ClaimOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let claimed = tx.execute(
                "UPDATE purchases
                 SET status = 'processing',
                     failure_kind = NULL,
                     error_message = NULL,
                     updated_at_ms = ?3
                 WHERE order_id = ?1
                   AND user_id = ?2
                   AND (status = 'pending'
                        OR (status = 'failed' AND failure_kind = 'retryable')
                        OR (status = 'processing' AND updated_at_ms <= ?4))",
                rusqlite::params![order_id, user_id, u64_to_i64(now_ms), lease_cutoff],
            )?;

            let purchase = select_purchase(&tx, &order_id)?
                .filter(|purchase| purchase.user_id == user_id);
            tx.commit()?;

            Ok(match purchase {
                Some(purchase) if claimed == 1 => ClaimOutcome::Claimed(purchase),
                Some(purchase) => ClaimOutcome::Unavailable(purchase),
                None => ClaimOutcome::NotFound,
            })
        })
        .await?
    }

    async fn complete_purchase(
        &self,
        order_id: &str,
        payment_id: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let order_id = order_id.to_string();
        let payment_id = payment_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE purchases
                 SET status = 'completed',
                     payment_id = ?2,
                     failure_kind = NULL,
                     error_message = NULL,
                     completed_at_ms = ?3,
                     updated_at_ms = ?3
                 WHERE order_id = ?1 AND status = 'processing'",
                rusqlite::params![order_id, payment_id, u64_to_i64(now_ms)],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    async fn fail_purchase(
        &self,
        order_id: &str,
        expected: PurchaseStatus,
        failure: FailureKind,
        message: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let order_id = order_id.to_string();
        let message = message.to_string();

        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let changed = conn.execute(
                "UPDATE purchases
                 SET status = 'failed',
                     failure_kind = ?3,
                     error_message = ?4,
                     updated_at_ms = ?5
                 WHERE order_id = ?1 AND status = ?2",
                rusqlite::params![
                    order_id,
                    expected.as_str(),
                    failure.as_str(),
                    message,
                    u64_to_i64(now_ms),
                ],
            )?;
            Ok(changed == 1)
        })
        .await?
    }

    async fn append_purchase_history(
        &self,
        record: &PurchaseHistoryRecord,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO purchase_history
                 (order_id, user_id, token_amount, amount_minor, currency, payment_id, source, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.order_id,
                    record.user_id,
                    u64_to_i64(record.token_amount),
                    u64_to_i64(record.amount_minor),
                    record.currency,
                    record.payment_id,
                    record.source.as_str(),
                    u64_to_i64(record.recorded_at_ms),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await?
    }

    async fn list_purchase_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PurchaseHistoryRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<PurchaseHistoryRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT order_id, user_id, token_amount, amount_minor, currency, payment_id, source, recorded_at_ms
                 FROM purchase_history
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (
                    order_id,
                    user_id,
                    token_amount,
                    amount_minor,
                    currency,
                    payment_id,
                    source,
                    recorded_at_ms,
                ) = row?;
                let source = match source.as_str() {
                    "client" => CompletionSource::Client,
                    "webhook" => CompletionSource::Webhook,
                    other => {
                        return Err(StoreError::UnexpectedResponse(format!(
                            "unknown history source: {other}"
                        )));
                    }
                };
                out.push(PurchaseHistoryRecord {
                    order_id,
                    user_id,
                    token_amount: i64_to_u64(token_amount),
                    amount_minor: i64_to_u64(amount_minor),
                    currency,
                    payment_id,
                    source,
                    recorded_at_ms: i64_to_u64(recorded_at_ms),
                });
            }
            Ok(out)
        })
        .await?
    }
}

/// Ensures the ledger row exists, applies the daily reset when due and records the caller's
/// current plan.
fn roll_ledger(
    conn: &rusqlite::Connection,
    user_id: &str,
    plan: Plan,
    now_ms: u64,
) -> Result<TokenLedgerRecord, StoreError> {
    let now = u64_to_i64(now_ms);
    let next_reset = u64_to_i64(next_daily_reset(now_ms));

    conn.execute(
        "INSERT OR IGNORE INTO token_ledger
         (user_id, plan, daily_tokens_used, daily_reset_at_ms, purchased_balance, updated_at_ms)
         VALUES (?1, ?2, 0, ?3, 0, ?4)",
        rusqlite::params![user_id, plan.as_str(), next_reset, now],
    )?;
    conn.execute(
        "UPDATE token_ledger
         SET daily_tokens_used = 0,
             daily_reset_at_ms = ?2,
             updated_at_ms = ?3
         WHERE user_id = ?1 AND daily_reset_at_ms <= ?3",
        rusqlite::params![user_id, next_reset, now],
    )?;
    conn.execute(
        "UPDATE token_ledger SET plan = ?2 WHERE user_id = ?1 AND plan <> ?2",
        rusqlite::params![user_id, plan.as_str()],
    )?;
    load_ledger(conn, user_id)
}

fn increment_purchased(
    conn: &rusqlite::Connection,
    user_id: &str,
    amount: u64,
    now_ms: u64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE token_ledger
         SET purchased_balance = purchased_balance + ?2,
             updated_at_ms = ?3
         WHERE user_id = ?1",
        rusqlite::params![user_id, u64_to_i64(amount), u64_to_i64(now_ms)],
    )?;
    Ok(())
}

fn load_ledger(conn: &rusqlite::Connection, user_id: &str) -> Result<TokenLedgerRecord, StoreError> {
    let (plan, used, reset_at, purchased, updated_at): (String, i64, i64, i64, i64) = conn
        .query_row(
            "SELECT plan, daily_tokens_used, daily_reset_at_ms, purchased_balance, updated_at_ms
             FROM token_ledger WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;
    let plan = plan
        .parse::<Plan>()
        .map_err(StoreError::UnexpectedResponse)?;
    Ok(TokenLedgerRecord {
        user_id: user_id.to_string(),
        plan,
        daily_tokens_used: i64_to_u64(used),
        daily_reset_at_ms: i64_to_u64(reset_at),
        purchased_balance: i64_to_u64(purchased),
        updated_at_ms: i64_to_u64(updated_at),
    })
}

type PurchaseRow = (
    String,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
    i64,
    Option<i64>,
);

fn select_purchase(
    conn: &rusqlite::Connection,
    order_id: &str,
) -> Result<Option<PurchaseRecord>, StoreError> {
    let row: Option<PurchaseRow> = conn
        .query_row(
            "SELECT order_id, user_id, token_amount, amount_minor, currency, status, failure_kind,
                    payment_id, error_message, credited_at_ms, created_at_ms, updated_at_ms,
                    completed_at_ms
             FROM purchases WHERE order_id = ?1",
            rusqlite::params![order_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                ))
            },
        )
        .optional()?;

    let Some((
        order_id,
        user_id,
        token_amount,
        amount_minor,
        currency,
        status,
        failure_kind,
        payment_id,
        error_message,
        credited_at_ms,
        created_at_ms,
        updated_at_ms,
        completed_at_ms,
    )) = row
    else {
        return Ok(None);
    };

    let status = PurchaseStatus::parse(&status).ok_or_else(|| {
        StoreError::UnexpectedResponse(format!("unknown purchase status: {status}"))
    })?;
    Ok(Some(PurchaseRecord {
        order_id,
        user_id,
        token_amount: i64_to_u64(token_amount),
        amount_minor: i64_to_u64(amount_minor),
        currency,
        status,
        failure: failure_kind.as_deref().and_then(FailureKind::parse),
        payment_id,
        error_message,
        credited_at_ms: credited_at_ms.map(i64_to_u64),
        created_at_ms: i64_to_u64(created_at_ms),
        updated_at_ms: i64_to_u64(updated_at_ms),
        completed_at_ms: completed_at_ms.map(i64_to_u64),
    }))
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS token_ledger (
            user_id TEXT PRIMARY KEY NOT NULL,
            plan TEXT NOT NULL,
            daily_tokens_used INTEGER NOT NULL DEFAULT 0,
            daily_reset_at_ms INTEGER NOT NULL,
            purchased_balance INTEGER NOT NULL DEFAULT 0 CHECK (purchased_balance >= 0),
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS purchases (
            order_id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            token_amount INTEGER NOT NULL,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL,
            failure_kind TEXT,
            payment_id TEXT,
            error_message TEXT,
            credited_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_purchases_user_id
            ON purchases(user_id);

        CREATE TABLE IF NOT EXISTS purchase_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            token_amount INTEGER NOT NULL,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            payment_id TEXT NOT NULL,
            source TEXT NOT NULL,
            recorded_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_purchase_history_user_id
            ON purchase_history(user_id, id);
        CREATE TRIGGER IF NOT EXISTS purchase_history_no_update
            BEFORE UPDATE ON purchase_history
            BEGIN SELECT RAISE(ABORT, 'purchase_history is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS purchase_history_no_delete
            BEFORE DELETE ON purchase_history
            BEGIN SELECT RAISE(ABORT, 'purchase_history is append-only'); END;",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
