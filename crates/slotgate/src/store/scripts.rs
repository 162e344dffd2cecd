//! Server-side Lua for the Redis store.
//!
//! Each mutating operation runs as one script, so capacity checks and the
//! membership writes they guard are indivisible. Scripts read the server's
//! `TIME` so every instance agrees on lease expiry.
//!
//! Key layout (`KEYS`): `active` sorted set (score = lease expiry ms, `+inf`
//! without leases), `queue` list, `enqueued` hash (task -> enqueue ms).

use redis::Script;

const PRELUDE: &str = r#"
local function now_ms()
  local t = redis.call('TIME')
  return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local function expiry(now, lease_ms)
  if lease_ms > 0 then
    return now + lease_ms
  end
  return '+inf'
end

local function promote(active, queue, enqueued, capacity, lease_ms, now, channel, skip)
  redis.call('ZREMRANGEBYSCORE', active, '-inf', now)
  local promoted = 0
  while redis.call('ZCARD', active) < capacity do
    local head = redis.call('LPOP', queue)
    if not head then
      break
    end
    redis.call('HDEL', enqueued, head)
    redis.call('ZADD', active, expiry(now, lease_ms), head)
    promoted = promoted + 1
    if head ~= skip then
      redis.call('PUBLISH', channel, cjson.encode({kind = 'granted', task_id = head}))
    end
  end
  return promoted
end
"#;

/// ARGV: task, capacity, lease_ms, channel. Returns 1 granted, 0 queued, 2 already active.
const ADMIT: &str = r#"
local task = ARGV[1]
local capacity = tonumber(ARGV[2])
local lease_ms = tonumber(ARGV[3])
local now = now_ms()

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if redis.call('ZSCORE', KEYS[1], task) then
  return 2
end

if redis.call('HEXISTS', KEYS[3], task) == 0 then
  if redis.call('LLEN', KEYS[2]) == 0 and redis.call('ZCARD', KEYS[1]) < capacity then
    redis.call('ZADD', KEYS[1], expiry(now, lease_ms), task)
    return 1
  end
  redis.call('RPUSH', KEYS[2], task)
  redis.call('HSET', KEYS[3], task, now)
end

promote(KEYS[1], KEYS[2], KEYS[3], capacity, lease_ms, now, ARGV[4], task)
if redis.call('ZSCORE', KEYS[1], task) then
  return 1
end
return 0
"#;

/// ARGV: capacity, lease_ms, channel. Returns the number of promoted waiters.
const PROMOTE: &str = r#"
return promote(KEYS[1], KEYS[2], KEYS[3], tonumber(ARGV[1]), tonumber(ARGV[2]), now_ms(), ARGV[3], '')
"#;

/// ARGV: task, capacity, lease_ms, channel. Returns {removed, promoted}.
const RELEASE: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
local promoted = promote(KEYS[1], KEYS[2], KEYS[3], tonumber(ARGV[2]), tonumber(ARGV[3]), now_ms(), ARGV[4], '')
return {removed, promoted}
"#;

/// ARGV: task, lease_ms. Returns 1 renewed, 0 not a holder.
const RENEW: &str = r#"
local now = now_ms()
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', expiry(now, tonumber(ARGV[2])), ARGV[1])
return 1
"#;

/// ARGV: task. Returns 1 withdrawn, 2 already granted, 0 not queued.
const WITHDRAW: &str = r#"
local removed = redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 2
end
if removed > 0 then
  return 1
end
return 0
"#;

/// ARGV: task. Returns 1 active, 2 queued, 0 absent.
const POSITION: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 1
end
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then
  return 2
end
return 0
"#;

/// ARGV: channel. Returns {cleared_active, cleared_queued}.
const RESET: &str = r#"
local active = redis.call('ZCARD', KEYS[1])
local queued = redis.call('LLEN', KEYS[2])
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
redis.call('PUBLISH', ARGV[1], cjson.encode({kind = 'reset'}))
return {active, queued}
"#;

pub(super) struct Scripts {
    pub admit: Script,
    pub promote: Script,
    pub release: Script,
    pub renew: Script,
    pub withdraw: Script,
    pub position: Script,
    pub reset: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            admit: with_prelude(ADMIT),
            promote: with_prelude(PROMOTE),
            release: with_prelude(RELEASE),
            renew: with_prelude(RENEW),
            withdraw: Script::new(WITHDRAW),
            position: Script::new(POSITION),
            reset: Script::new(RESET),
        }
    }
}

fn with_prelude(body: &str) -> Script {
    Script::new(&format!("{PRELUDE}{body}"))
}
