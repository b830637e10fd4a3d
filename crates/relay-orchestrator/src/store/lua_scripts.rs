//! Lua scripts for the distributed lock.
//!
//! The lock value is a random token owned by the acquirer; releasing is a
//! compare-and-delete so a process whose lock already expired can never
//! delete a lock re-acquired by another process.

/// Lua script for releasing a lock only if still held by the caller.
///
/// Arguments:
/// - KEYS[1]: Lock name (e.g. `instance-registry-lock`)
/// - ARGV[1]: Token set at acquisition
///
/// Returns:
/// - 1: Released
/// - 0: Not held by this token (expired or taken over)
pub const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;
