use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Shortens a content hash or peer id for log lines: `01234567..89abcdef`.
pub fn redact_hex(value: &str) -> String {
    const HEAD: usize = 8;
    const TAIL: usize = 8;
    if value.len() <= HEAD + TAIL || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}..{}", &value[..HEAD], &value[value.len() - TAIL..])
}

/// Returns `true` when a warning keyed by `key` may be emitted now.
///
/// At most one warning per `interval` passes; when one does after a quiet
/// period, a summary with the number of swallowed warnings is logged first.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = throttle(key, interval, Instant::now()) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "throttled warnings were suppressed"
        );
    }
    true
}

fn throttle(key: &'static str, interval: Duration, now: Instant) -> Option<u64> {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, WarnThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    match guard.get_mut(key) {
        Some(state) if now.saturating_duration_since(state.last) < interval => {
            state.suppressed = state.suppressed.saturating_add(1);
            None
        }
        Some(state) => {
            let suppressed = state.suppressed;
            state.last = now;
            state.suppressed = 0;
            Some(suppressed)
        }
        None => {
            guard.insert(
                key,
                WarnThrottleState {
                    last: now,
                    suppressed: 0,
                },
            );
            Some(0)
        }
    }
}
