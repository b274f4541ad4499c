//! Lua scripts for the schedule index operations that must be atomic.
//!
//! The index is a sorted set (`member = endpoint id`, `score = due time in
//! epoch ms`) plus a hash of endpoint snapshots keyed the same way.

/// Insert entries that have no live entry yet.
/// `KEYS[1]` -> schedule sorted set
/// `KEYS[2]` -> snapshot hash
/// `ARGV` -> repeated `endpoint_id, due_at_ms, snapshot`
/// Returns the number of entries inserted.
pub const ADMIT: &str = r#"
local admitted = 0
for i = 1, #ARGV, 3 do
    if redis.call("ZADD", KEYS[1], "NX", ARGV[i + 1], ARGV[i]) == 1 then
        redis.call("HSET", KEYS[2], ARGV[i], ARGV[i + 2])
        admitted = admitted + 1
    end
end
return admitted
"#;

/// Append the jobs of due entries and re-arm them in one step.
/// `KEYS[1]` -> schedule sorted set
/// `KEYS[2]` -> snapshot hash
/// `ARGV` -> repeated dispatch blocks:
///   `endpoint_id, expected_due_ms, next_due_ms, snapshot, job_count`
///   followed by `job_count` job blocks of `stream_key, field_count, fields...`
/// A dispatch whose stored score differs from `expected_due_ms` (or whose
/// entry is gone) is skipped entirely.
/// Returns the number of dispatches applied.
pub const DISPATCH: &str = r#"
local applied = 0
local i = 1
while i <= #ARGV do
    local id = ARGV[i]
    local expected = tonumber(ARGV[i + 1])
    local next_due = ARGV[i + 2]
    local snapshot = ARGV[i + 3]
    local job_count = tonumber(ARGV[i + 4])
    i = i + 5

    local score = redis.call("ZSCORE", KEYS[1], id)
    local live = score and tonumber(score) == expected

    for _ = 1, job_count do
        local stream = ARGV[i]
        local n = tonumber(ARGV[i + 1])
        if live then
            redis.call("XADD", stream, "*", unpack(ARGV, i + 2, i + 1 + n))
        end
        i = i + 2 + n
    end

    if live then
        redis.call("ZADD", KEYS[1], next_due, id)
        redis.call("HSET", KEYS[2], id, snapshot)
        applied = applied + 1
    end
end
return applied
"#;

/// Overwrite snapshots of entries that are still live. Due times are untouched.
/// `KEYS[1]` -> schedule sorted set
/// `KEYS[2]` -> snapshot hash
/// `ARGV` -> repeated `endpoint_id, snapshot`
/// Returns the number of snapshots replaced.
pub const REPLACE_SNAPSHOTS: &str = r#"
local replaced = 0
for i = 1, #ARGV, 2 do
    if redis.call("ZSCORE", KEYS[1], ARGV[i]) then
        redis.call("HSET", KEYS[2], ARGV[i], ARGV[i + 1])
        replaced = replaced + 1
    end
end
return replaced
"#;
