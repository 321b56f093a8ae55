//! Per-site extraction plans and response models.
//!
//! A target turns a request (a username, a post URL) into a typed model with
//! every media URL redistributed. Browser-backed targets run a [`RacePlan`];
//! targets whose upstream answers plain HTTP go through reqwest.
//!
//! [`RacePlan`]: crate::race::RacePlan

pub mod instagram;
pub mod tiktok;

use crate::error::MirageError;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// A field as text. Numbers are accepted and rendered as strings.
pub(crate) fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn require_text(value: &Value, key: &str) -> Result<String, MirageError> {
    text(value, key).ok_or_else(|| MirageError::Decode(format!("missing field `{key}`")))
}

/// First present field among `keys`.
pub(crate) fn text_any(value: &Value, keys: &[&str]) -> Result<String, MirageError> {
    keys.iter()
        .find_map(|key| text(value, key))
        .ok_or_else(|| MirageError::Decode(format!("missing field `{}`", keys.join("`/`"))))
}

pub(crate) fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// A counter at a JSON pointer, zero when absent.
pub(crate) fn count(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// String at a JSON pointer.
pub(crate) fn string_at(value: &Value, pointer: &str) -> Result<String, MirageError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MirageError::Decode(format!("missing `{pointer}`")))
}

/// Unix seconds into a UTC timestamp.
pub(crate) fn timestamp(value: &Value, key: &str) -> Result<DateTime<Utc>, MirageError> {
    value
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| MirageError::Decode(format!("missing or invalid timestamp `{key}`")))
}

/// Fetch headers presenting `referer` as the origin page.
pub(crate) fn referer(referer: &str) -> Vec<(String, String)> {
    vec![("Referer".to_string(), referer.to_string())]
}

/// Trim `value` to `length` characters for link labels.
pub(crate) fn shorten(value: &str, length: usize) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '(' | ')'))
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    if cleaned.chars().count() <= length {
        return cleaned;
    }
    let mut short: String = cleaned.chars().take(length.saturating_sub(2)).collect();
    short.push_str("..");
    short
}

/// Markdown link for a bio URL, labelled without scheme or query.
/// Discord invites are left bare.
pub(crate) fn pretty_url(url: &str) -> String {
    if url.contains("discord.gg") {
        return url.to_string();
    }
    let stripped = url.replace("https://", "").replace("http://", "");
    let stripped = stripped.split(['?', '&']).next().unwrap_or_default();
    let href = if url.starts_with("http") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    format!("[{}]({href})", shorten(stripped, 42))
}

/// Run `op` up to `attempts` times, sleeping `wait` after each failure.
/// The last error is returned when every attempt fails.
pub(crate) async fn retry<T, E, F, Fut>(attempts: usize, wait: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::debug!("attempt {attempt}/{attempts} failed: {e}");
                attempt += 1;
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_text_coerces_numbers() {
        let value = json!({"pk": 123, "name": "a", "flag": true});
        assert_eq!(text(&value, "pk").as_deref(), Some("123"));
        assert_eq!(text(&value, "name").as_deref(), Some("a"));
        assert_eq!(text(&value, "flag"), None);
        assert_eq!(text_any(&value, &["id", "pk"]).unwrap(), "123");
        assert!(require_text(&value, "missing").is_err());
    }

    #[test]
    fn test_count_and_timestamp() {
        let value = json!({"edge": {"count": 5}, "taken_at": 1_700_000_000});
        assert_eq!(count(&value, "/edge/count"), 5);
        assert_eq!(count(&value, "/nothing/count"), 0);
        assert_eq!(timestamp(&value, "taken_at").unwrap().timestamp(), 1_700_000_000);
        assert!(timestamp(&value, "edge").is_err());
    }

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("short", 42), "short");
        assert_eq!(shorten("[a](b)\nc", 42), "ab c");
        assert_eq!(shorten("abcdefghij", 6), "abcd..");
    }

    #[test]
    fn test_pretty_url() {
        assert_eq!(
            pretty_url("https://example.com/shop?ref=bio"),
            "[example.com/shop](https://example.com/shop?ref=bio)"
        );
        assert_eq!(pretty_url("linktr.ee/alice"), "[linktr.ee/alice](https://linktr.ee/alice)");
        assert_eq!(pretty_url("https://discord.gg/abc"), "https://discord.gg/abc");
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<usize, String> = retry(3, Duration::from_millis(1), move || async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(format!("failure {call}"))
            } else {
                Ok(call)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry(2, Duration::from_millis(1), move || async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {call}"))
        })
        .await;
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
