//! Time-sortable prefixed identifiers.
//!
//! An identifier looks like `plan_018f3a2b4c5dXk3Lp9QzR2mW7a`: a kind prefix,
//! an underscore, then 26 characters. The first 12 are lowercase hex encoding
//! `timestamp_ms * 4096 + counter` truncated to 48 bits; the remaining 14 are
//! random base62. Within one process, identifiers compare lexically in
//! creation order, including several created in the same millisecond.
//!
//! The 48-bit window wraps roughly every 2.2 years of milliseconds, and more
//! than 4096 identifiers in one millisecond spill into the timestamp bits.

use std::sync::Mutex;

use uuid::Uuid;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BODY_LEN: usize = 26;
const TIME_LEN: usize = 12;
const MASK_48: u64 = 0xFFFF_FFFF_FFFF;

/// Entity kinds that get their own identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Plan,
    Execution,
    Session,
    Message,
    Question,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Plan => "plan",
            IdKind::Execution => "exec",
            IdKind::Session => "ses",
            IdKind::Message => "msg",
            IdKind::Question => "que",
        }
    }
}

struct Clock {
    last_ms: u64,
    counter: u64,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock {
    last_ms: 0,
    counter: 0,
});

fn next_time_component() -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut clock = match CLOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if now != clock.last_ms {
        clock.last_ms = now;
        clock.counter = 0;
    } else {
        clock.counter += 1;
    }
    now.wrapping_mul(4096).wrapping_add(clock.counter) & MASK_48
}

fn random_suffix(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let uuid = Uuid::new_v4();
        // Bytes 6 and 8 carry the version and variant bits.
        for (i, byte) in uuid.as_bytes().iter().enumerate() {
            if i == 6 || i == 8 || out.len() == len {
                continue;
            }
            out.push(BASE62[(*byte as usize) % BASE62.len()] as char);
        }
    }
    out
}

/// Generate a new identifier for `kind`.
pub fn generate_id(kind: IdKind) -> String {
    generate_with_prefix(kind.prefix())
}

/// Generate a new identifier with an arbitrary prefix.
pub fn generate_with_prefix(prefix: &str) -> String {
    let time = next_time_component();
    format!(
        "{}_{:012x}{}",
        prefix,
        time,
        random_suffix(BODY_LEN - TIME_LEN)
    )
}

/// Recover the (48-bit truncated) millisecond timestamp from an identifier.
pub fn extract_timestamp(id: &str) -> Option<u64> {
    let (_, body) = id.split_once('_')?;
    let hex = body.get(..TIME_LEN)?;
    let value = u64::from_str_radix(hex, 16).ok()?;
    Some(value / 4096)
}

/// Check that `id` is a well-formed identifier carrying `prefix`.
pub fn is_valid_id(prefix: &str, id: &str) -> bool {
    let Some(body) = id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
    else {
        return false;
    };
    body.len() == BODY_LEN
        && body.is_char_boundary(TIME_LEN)
        && body[..TIME_LEN]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        && body[TIME_LEN..].chars().all(|c| c.is_ascii_alphanumeric())
}
