//! Stored scripts backing the atomic composites. Each runs as one
//! round trip; the store's single-threaded execution provides the
//! atomicity the callers rely on.

use once_cell::sync::Lazy;
use redis::Script;

/// KEYS[1] window zset; ARGV: now_ms, window_ms, max_requests, member.
/// Returns {allowed, post_insert_count, reset_at_ms}.
pub static WINDOW_PROBE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local member = ARGV[4]
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local current = redis.call('ZCARD', key)
local allowed = 0
if current < max then
  redis.call('ZADD', key, now, member)
  allowed = 1
  current = current + 1
end
redis.call('PEXPIRE', key, window)
local reset = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = tonumber(oldest[2]) + window
end
return {allowed, current, reset}
",
    )
});

/// KEYS[1] lock key; ARGV[1] expected holder token.
/// Deletes only when the current value matches the token.
pub static DEL_IF_EQUALS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

/// KEYS[1] source list, KEYS[2] destination list.
/// Moves the head of source to the tail of destination.
pub static POP_TO_PROCESSING: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local v = redis.call('LPOP', KEYS[1])
if v then
  redis.call('RPUSH', KEYS[2], v)
end
return v
",
    )
});

/// KEYS[1] retry zset, KEYS[2] destination list; ARGV: now_score, limit.
/// Drains entries due at or before now_score, oldest first.
pub static MOVE_DUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for i, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('RPUSH', KEYS[2], member)
end
return due
",
    )
});
