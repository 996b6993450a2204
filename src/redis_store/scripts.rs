// Shared by every script that touches a ledger hash. Numbers are handed to redis.call as Lua
// numbers, never through tostring, so millisecond timestamps keep their integer form.
pub(super) const LEDGER_HELPERS: &str = r#"
local function roll_ledger(ledger_key, plan, now_ms, next_reset)
  if redis.call("EXISTS", ledger_key) == 0 then
    redis.call("HSET", ledger_key,
      "plan", plan,
      "daily_tokens_used", 0,
      "daily_reset_at_ms", next_reset,
      "purchased_balance", 0,
      "updated_at_ms", now_ms)
  end
  local reset_at = tonumber(redis.call("HGET", ledger_key, "daily_reset_at_ms") or "0") or 0
  if reset_at <= now_ms then
    redis.call("HSET", ledger_key,
      "daily_tokens_used", 0,
      "daily_reset_at_ms", next_reset,
      "updated_at_ms", now_ms)
  end
  redis.call("HSET", ledger_key, "plan", plan)
end

local function ledger_reply(tag, ledger_key, from_daily, from_purchased)
  local fields = redis.call("HMGET", ledger_key,
    "plan", "daily_tokens_used", "daily_reset_at_ms", "purchased_balance", "updated_at_ms")
  return { tag, fields[1], fields[2], fields[3], fields[4], fields[5],
    from_daily or 0, from_purchased or 0 }
end
"#;

pub(super) const TOUCH_LEDGER: &str = r#"
local ledger_key = KEYS[1]
local plan = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0
local next_reset = tonumber(ARGV[3]) or 0

roll_ledger(ledger_key, plan, now_ms, next_reset)
return ledger_reply("OK", ledger_key)
"#;

pub(super) const CONSUME_TOKENS: &str = r#"
local ledger_key = KEYS[1]
local plan = ARGV[1]
local daily_limit = tonumber(ARGV[2]) or 0
local cost = tonumber(ARGV[3]) or 0
local now_ms = tonumber(ARGV[4]) or 0
local next_reset = tonumber(ARGV[5]) or 0

roll_ledger(ledger_key, plan, now_ms, next_reset)

local used = tonumber(redis.call("HGET", ledger_key, "daily_tokens_used") or "0") or 0
local purchased = tonumber(redis.call("HGET", ledger_key, "purchased_balance") or "0") or 0
local remaining = daily_limit - used
if remaining < 0 then
  remaining = 0
end
if remaining + purchased < cost then
  return ledger_reply("INSUFFICIENT", ledger_key)
end

local from_daily = math.min(cost, remaining)
local from_purchased = cost - from_daily
redis.call("HINCRBY", ledger_key, "daily_tokens_used", from_daily)
redis.call("HINCRBY", ledger_key, "purchased_balance", -from_purchased)
redis.call("HSET", ledger_key, "updated_at_ms", now_ms)
return ledger_reply("OK", ledger_key, from_daily, from_purchased)
"#;

pub(super) const ADD_PURCHASED_TOKENS: &str = r#"
local ledger_key = KEYS[1]
local plan = ARGV[1]
local amount = tonumber(ARGV[2]) or 0
local now_ms = tonumber(ARGV[3]) or 0
local next_reset = tonumber(ARGV[4]) or 0

roll_ledger(ledger_key, plan, now_ms, next_reset)
redis.call("HINCRBY", ledger_key, "purchased_balance", amount)
redis.call("HSET", ledger_key, "updated_at_ms", now_ms)
return ledger_reply("OK", ledger_key)
"#;

pub(super) const CREDIT_PURCHASE: &str = r#"
local purchase_key = KEYS[1]
local prefix = ARGV[1]
local plan = ARGV[2]
local now_ms = tonumber(ARGV[3]) or 0
local next_reset = tonumber(ARGV[4]) or 0

if redis.call("EXISTS", purchase_key) == 0 then
  return { "NOT_OWNED" }
end

local user_id = redis.call("HGET", purchase_key, "user_id")
if not user_id then
  return { "NOT_OWNED" }
end
local ledger_key = prefix .. ":ledger:" .. user_id

if redis.call("HGET", purchase_key, "credited_at_ms") then
  roll_ledger(ledger_key, plan, now_ms, next_reset)
  return ledger_reply("ALREADY_CREDITED", ledger_key)
end
if redis.call("HGET", purchase_key, "status") ~= "processing" then
  return { "NOT_OWNED" }
end

local amount = tonumber(redis.call("HGET", purchase_key, "token_amount") or "0") or 0
redis.call("HSET", purchase_key, "credited_at_ms", now_ms, "updated_at_ms", now_ms)
roll_ledger(ledger_key, plan, now_ms, next_reset)
redis.call("HINCRBY", ledger_key, "purchased_balance", amount)
redis.call("HSET", ledger_key, "updated_at_ms", now_ms)
return ledger_reply("CREDITED", ledger_key)
"#;

pub(super) const INSERT_PURCHASE: &str = r#"
local purchase_key = KEYS[1]

if redis.call("EXISTS", purchase_key) == 1 then
  return 0
end
redis.call("HSET", purchase_key,
  "order_id", ARGV[1],
  "user_id", ARGV[2],
  "token_amount", ARGV[3],
  "amount_minor", ARGV[4],
  "currency", ARGV[5],
  "status", "pending",
  "created_at_ms", ARGV[6],
  "updated_at_ms", ARGV[6])
return 1
"#;

pub(super) const CLAIM_PURCHASE: &str = r#"
local purchase_key = KEYS[1]
local user_id = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0
local lease_cutoff = tonumber(ARGV[3]) or -1

if redis.call("EXISTS", purchase_key) == 0 then
  return { "NOT_FOUND" }
end
if redis.call("HGET", purchase_key, "user_id") ~= user_id then
  return { "NOT_FOUND" }
end

local status = redis.call("HGET", purchase_key, "status")
local failure = redis.call("HGET", purchase_key, "failure_kind")
local updated_at = tonumber(redis.call("HGET", purchase_key, "updated_at_ms") or "0") or 0

local claimable = status == "pending"
  or (status == "failed" and failure == "retryable")
  or (status == "processing" and lease_cutoff >= 0 and updated_at <= lease_cutoff)

local tag = "UNAVAILABLE"
if claimable then
  redis.call("HSET", purchase_key, "status", "processing", "updated_at_ms", now_ms)
  redis.call("HDEL", purchase_key, "failure_kind", "error_message")
  tag = "CLAIMED"
end

local reply = { tag }
for _, value in ipairs(redis.call("HGETALL", purchase_key)) do
  table.insert(reply, value)
end
return reply
"#;

pub(super) const COMPLETE_PURCHASE: &str = r#"
local purchase_key = KEYS[1]
local payment_id = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0

if redis.call("HGET", purchase_key, "status") ~= "processing" then
  return 0
end
redis.call("HSET", purchase_key,
  "status", "completed",
  "payment_id", payment_id,
  "completed_at_ms", now_ms,
  "updated_at_ms", now_ms)
redis.call("HDEL", purchase_key, "failure_kind", "error_message")
return 1
"#;

pub(super) const FAIL_PURCHASE: &str = r#"
local purchase_key = KEYS[1]
local expected = ARGV[1]
local failure = ARGV[2]
local message = ARGV[3]
local now_ms = tonumber(ARGV[4]) or 0

if redis.call("HGET", purchase_key, "status") ~= expected then
  return 0
end
redis.call("HSET", purchase_key,
  "status", "failed",
  "failure_kind", failure,
  "error_message", message,
  "updated_at_ms", now_ms)
return 1
"#;

pub(super) const APPEND_HISTORY: &str = r#"
local record_key = KEYS[1]
local by_user_key = KEYS[2]
local payload = ARGV[1]
local score = tonumber(ARGV[2]) or 0
local order_id = ARGV[3]

if redis.call("SETNX", record_key, payload) == 0 then
  return 0
end
redis.call("ZADD", by_user_key, score, order_id)
return 1
"#;
