//! Atomic compare-and-swap scripts for the population lock.
//!
//! Ownership checks and mutations must happen in one server-side step:
//! between a GET and a DEL issued as separate commands the key could expire
//! and be re-acquired by another client, and the DEL would then destroy the
//! new owner's lock. Both scripts are process-wide constants; the store
//! layer caches their SHA1 and runs them via EVALSHA.

/// Delete `KEYS[1]` only while its value still equals `ARGV[1]`.
pub const DEL_IF_OWNED: &str =
    r#"if redis.call("GET",KEYS[1]) == ARGV[1] then return redis.call("DEL",KEYS[1]) else return 0 end"#;

/// Replace `KEYS[1]` with `ARGV[2]` (expiry `ARGV[3]` in milliseconds) only
/// while its value still equals `ARGV[1]`.
pub const SET_IF_OWNED: &str =
    r#"if redis.call("GET",KEYS[1]) == ARGV[1] then return redis.call("SET",KEYS[1],ARGV[2],"PX",ARGV[3]) else return 0 end"#;
