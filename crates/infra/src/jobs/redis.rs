//! Redis-backed broker (durable lanes shared between processes).
//!
//! ## Keys
//!
//! For every lane, with `base = {prefix}:{lane}`:
//!
//! - `{base}:pending` sorted set of pending job ids scored by ready time (ms)
//! - `{base}:job:{id}` hash holding a pending job
//! - `{base}:active` sorted set of claimed job ids scored by lease expiry (ms)
//! - `{base}:active:{id}` hash holding a claimed job
//! - `{base}:claims` claim-token counter
//! - `{base}:failed` sorted set of `{id}:{token}` failure records scored by
//!   failure time (ms), `{base}:failed:{id}:{token}` their hashes
//! - `{base}:completed` completed-job counter
//!
//! Job hashes carry `payload` (JSON), `attempts_made`, `max_attempts`,
//! `backoff_ms`, `dedup_count` and `stalled`; active hashes also carry the
//! `token` of their claim. Counters live in hash fields and are folded into
//! the payload when it is read back. Every state transition
//! is a Lua script, so each one is atomic on the server. Scripts derive
//! per-job keys from `base`, which keeps a lane on a single node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::instrument;

use synctrack_core::{TrackerError, TrackerResult};

use super::store::{
    AddOutcome, Broker, ClaimedJob, DeferOutcome, FailDisposition, FailedJob, LaneCounts,
    StalledJob,
};
use super::types::{JobPayload, Lane};
use crate::config::LaneOptions;

// Pending ids inspected per claim.
const CLAIM_SCAN: usize = 100;

const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('HSET', KEYS[2],
  'payload', ARGV[2], 'attempts_made', 0, 'max_attempts', ARGV[3],
  'backoff_ms', ARGV[4], 'dedup_count', ARGV[6], 'stalled', ARGV[7])
redis.call('ZADD', KEYS[1], ARGV[5], ARGV[1])
return 1
"#;

const DEFER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
  return -1
end
local n = redis.call('HINCRBY', KEYS[2], 'dedup_count', 1)
local score = tonumber(redis.call('ZSCORE', KEYS[1], ARGV[1]) or '0')
if tonumber(ARGV[2]) > score then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
end
return n
"#;

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[4]))
for _, id in ipairs(ids) do
  if not redis.call('ZSCORE', KEYS[2], id) then
    local active = ARGV[1] .. ':active:' .. id
    redis.call('ZREM', KEYS[1], id)
    redis.call('RENAME', ARGV[1] .. ':job:' .. id, active)
    redis.call('HSET', active, 'token', redis.call('INCR', ARGV[1] .. ':claims'))
    redis.call('ZADD', KEYS[2], ARGV[3], id)
    return redis.call('HGETALL', active)
  end
end
return false
"#;

// ARGV: id, base, token
const COMPLETE_SCRIPT: &str = r#"
local active = ARGV[2] .. ':active:' .. ARGV[1]
if redis.call('HGET', active, 'token') ~= ARGV[3] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('DEL', active)
redis.call('INCR', KEYS[2])
return 1
"#;

// ARGV: id, base, now_ms, mode ('fail' | 'retry' | 'stall'), payload or '',
//       delay_ms (retry only), error, token (ignored by 'stall')
//
// 'stall' only settles a claim whose lease has expired; the other modes only
// settle the claim named by the token.
const SETTLE_SCRIPT: &str = r#"
local id = ARGV[1]
local active = ARGV[2] .. ':active:' .. id
local lease = redis.call('ZSCORE', KEYS[1], id)
if not lease then
  return {'superseded', '0', '', '0'}
end
local token = redis.call('HGET', active, 'token')
if ARGV[4] == 'stall' then
  if tonumber(lease) > tonumber(ARGV[3]) then
    return {'superseded', '0', '', '0'}
  end
elseif token ~= ARGV[8] then
  return {'superseded', '0', '', '0'}
end
redis.call('ZREM', KEYS[1], id)
if ARGV[5] ~= '' then
  redis.call('HSET', active, 'payload', ARGV[5])
end
local stalled = tonumber(redis.call('HGET', active, 'stalled') or '0')
if ARGV[4] == 'stall' then
  stalled = redis.call('HINCRBY', active, 'stalled', 1)
end
local payload = redis.call('HGET', active, 'payload')
local delay = 0
if ARGV[4] == 'retry' then
  delay = tonumber(ARGV[6])
else
  local attempts = redis.call('HINCRBY', active, 'attempts_made', 1)
  if attempts >= tonumber(redis.call('HGET', active, 'max_attempts')) then
    local record = id .. ':' .. (token or '0')
    local failed = ARGV[2] .. ':failed:' .. record
    redis.call('RENAME', active, failed)
    redis.call('HSET', failed, 'error', ARGV[7], 'failed_at', ARGV[3])
    redis.call('ZADD', KEYS[3], ARGV[3], record)
    return {'failed', '0', payload, tostring(stalled)}
  end
  if ARGV[4] == 'fail' then
    delay = tonumber(redis.call('HGET', active, 'backoff_ms'))
  end
end
local job = ARGV[2] .. ':job:' .. id
if redis.call('EXISTS', job) == 1 then
  redis.call('DEL', active)
  return {'superseded', '0', payload, tostring(stalled)}
end
redis.call('RENAME', active, job)
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) + delay, id)
return {'retrying', tostring(delay), payload, tostring(stalled)}
"#;

/// How [`SETTLE_SCRIPT`] leaves the active set.
enum Settle<'a> {
    Fail { token: u64, error: &'a str },
    Retry {
        token: u64,
        payload: &'a JobPayload,
        delay: Duration,
    },
    Stall,
}

/// Broker over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    prefix: String,
    add: Arc<Script>,
    defer: Arc<Script>,
    claim: Arc<Script>,
    complete: Arc<Script>,
    settle: Arc<Script>,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> TrackerResult<Self> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            add: Arc::new(Script::new(ADD_SCRIPT)),
            defer: Arc::new(Script::new(DEFER_SCRIPT)),
            claim: Arc::new(Script::new(CLAIM_SCRIPT)),
            complete: Arc::new(Script::new(COMPLETE_SCRIPT)),
            settle: Arc::new(Script::new(SETTLE_SCRIPT)),
        })
    }

    fn base(&self, lane: Lane) -> String {
        format!("{}:{}", self.prefix, lane.name())
    }

    fn key(&self, lane: Lane, suffix: &str) -> String {
        format!("{}:{}", self.base(lane), suffix)
    }

    async fn settle(
        &self,
        lane: Lane,
        job_id: &str,
        settle: Settle<'_>,
    ) -> TrackerResult<(FailDisposition, Option<JobPayload>)> {
        let (mode, token, payload_json, delay, error) = match settle {
            Settle::Fail { token, error } => ("fail", token, String::new(), Duration::ZERO, error),
            Settle::Retry {
                token,
                payload,
                delay,
            } => ("retry", token, payload.to_json()?, delay, ""),
            Settle::Stall => ("stall", 0, String::new(), Duration::ZERO, "job stalled"),
        };
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .settle
            .key(self.key(lane, "active"))
            .key(self.key(lane, "pending"))
            .key(self.key(lane, "failed"))
            .arg(job_id)
            .arg(self.base(lane))
            .arg(now_ms())
            .arg(mode)
            .arg(payload_json)
            .arg(delay.as_millis() as u64)
            .arg(error)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let [status, delay_ms, payload, stalled] = reply.as_slice() else {
            return Err(TrackerError::queue("malformed settle reply"));
        };
        let disposition = match status.as_str() {
            "retrying" => FailDisposition::Retrying {
                delay: Duration::from_millis(parse_num(delay_ms)?),
            },
            "failed" => FailDisposition::Failed,
            _ => FailDisposition::Superseded,
        };
        let payload = if payload.is_empty() {
            None
        } else {
            let mut payload = JobPayload::from_json(payload)?;
            payload.stalled = parse_num(stalled)?;
            Some(payload)
        };
        Ok((disposition, payload))
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, job, options), fields(lane = %lane, job_id = %job.id), err)]
    async fn add(
        &self,
        lane: Lane,
        job: &JobPayload,
        options: &LaneOptions,
        delay: Duration,
    ) -> TrackerResult<AddOutcome> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .add
            .key(self.key(lane, "pending"))
            .key(self.key(lane, &format!("job:{}", job.id)))
            .arg(&job.id)
            .arg(job.to_json()?)
            .arg(options.attempts.max(1))
            .arg(options.backoff.as_millis() as u64)
            .arg(now_ms() + delay.as_millis() as i64)
            .arg(job.dedup_count)
            .arg(job.stalled)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(if added == 1 {
            AddOutcome::Added
        } else {
            AddOutcome::Exists
        })
    }

    async fn defer(
        &self,
        lane: Lane,
        job_id: &str,
        delay: Duration,
    ) -> TrackerResult<DeferOutcome> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .defer
            .key(self.key(lane, "pending"))
            .key(self.key(lane, &format!("job:{job_id}")))
            .arg(job_id)
            .arg(now_ms() + delay.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(if count < 0 {
            DeferOutcome::Missing
        } else {
            DeferOutcome::Deferred {
                dedup_count: count as u32,
            }
        })
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> TrackerResult<Option<ClaimedJob>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let fields: Option<HashMap<String, String>> = self
            .claim
            .key(self.key(lane, "pending"))
            .key(self.key(lane, "active"))
            .arg(self.base(lane))
            .arg(now)
            .arg(now + lease.as_millis() as i64)
            .arg(CLAIM_SCAN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some(fields) = fields.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ClaimedJob {
            payload: payload_from_fields(&fields)?,
            token: field_num(&fields, "token")?,
            attempts_made: field_num(&fields, "attempts_made")?,
            max_attempts: field_num(&fields, "max_attempts")?,
        }))
    }

    async fn complete(&self, lane: Lane, job_id: &str, token: u64) -> TrackerResult<bool> {
        let mut conn = self.conn.clone();
        let acknowledged: i64 = self
            .complete
            .key(self.key(lane, "active"))
            .key(self.key(lane, "completed"))
            .arg(job_id)
            .arg(self.base(lane))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(acknowledged == 1)
    }

    async fn fail(
        &self,
        lane: Lane,
        job_id: &str,
        token: u64,
        error: &str,
    ) -> TrackerResult<FailDisposition> {
        let (disposition, _) = self
            .settle(lane, job_id, Settle::Fail { token, error })
            .await?;
        Ok(disposition)
    }

    async fn retry_later(
        &self,
        lane: Lane,
        payload: &JobPayload,
        token: u64,
        delay: Duration,
    ) -> TrackerResult<FailDisposition> {
        let (disposition, _) = self
            .settle(
                lane,
                &payload.id,
                Settle::Retry {
                    token,
                    payload,
                    delay,
                },
            )
            .await?;
        Ok(disposition)
    }

    async fn recover_stalled(&self, lane: Lane) -> TrackerResult<Vec<StalledJob>> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(self.key(lane, "active"), "-inf", now_ms())
            .await
            .map_err(map_redis_error)?;

        let mut stalled = Vec::with_capacity(expired.len());
        for job_id in expired {
            let (disposition, payload) = self
                .settle(lane, &job_id, Settle::Stall)
                .await?;
            // Settled or reclaimed between the scan and the settle.
            if let Some(payload) = payload {
                stalled.push(StalledJob {
                    payload,
                    disposition,
                });
            }
        }
        Ok(stalled)
    }

    async fn counts(&self, lane: Lane) -> TrackerResult<LaneCounts> {
        let mut conn = self.conn.clone();
        let pending_key = self.key(lane, "pending");
        let (pending, waiting, active, completed, failed): (u64, u64, u64, Option<u64>, u64) =
            redis::pipe()
                .zcard(&pending_key)
                .zcount(&pending_key, "-inf", now_ms())
                .zcard(self.key(lane, "active"))
                .get(self.key(lane, "completed"))
                .zcard(self.key(lane, "failed"))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
        Ok(LaneCounts {
            waiting,
            delayed: pending.saturating_sub(waiting),
            active,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    async fn failed_jobs(&self, lane: Lane) -> TrackerResult<Vec<FailedJob>> {
        let mut conn = self.conn.clone();
        let records: Vec<String> = conn
            .zrange(self.key(lane, "failed"), 0, -1)
            .await
            .map_err(map_redis_error)?;

        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            let fields: HashMap<String, String> = conn
                .hgetall(self.key(lane, &format!("failed:{record}")))
                .await
                .map_err(map_redis_error)?;
            if fields.is_empty() {
                continue;
            }
            let failed_at_ms: i64 = field_num(&fields, "failed_at")?;
            jobs.push(FailedJob {
                payload: payload_from_fields(&fields)?,
                attempts_made: field_num(&fields, "attempts_made")?,
                error: fields.get("error").cloned().unwrap_or_default(),
                failed_at: Utc
                    .timestamp_millis_opt(failed_at_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(jobs)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn payload_from_fields(fields: &HashMap<String, String>) -> TrackerResult<JobPayload> {
    let raw = fields
        .get("payload")
        .ok_or_else(|| TrackerError::queue("job hash without payload"))?;
    let mut payload = JobPayload::from_json(raw)?;
    payload.dedup_count = field_num(fields, "dedup_count")?;
    payload.stalled = field_num(fields, "stalled")?;
    Ok(payload)
}

fn field_num<T: std::str::FromStr + Default>(
    fields: &HashMap<String, String>,
    name: &str,
) -> TrackerResult<T> {
    match fields.get(name) {
        Some(raw) => parse_num(raw),
        None => Ok(T::default()),
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str) -> TrackerResult<T> {
    raw.parse()
        .map_err(|_| TrackerError::queue(format!("expected a number, got '{raw}'")))
}

fn map_redis_error(err: redis::RedisError) -> TrackerError {
    TrackerError::queue(format!("redis error: {err}"))
}
