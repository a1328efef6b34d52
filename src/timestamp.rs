//! Normalization of the remote store's time representations to unix millis.
//!
//! The remote side may hand us a resolved server timestamp object, a bare
//! `{seconds, nanoseconds}` pair, an ISO-8601 string, plain millis, or an
//! unresolved write-time sentinel. Nothing un-normalized is ever persisted or
//! compared: every remote → local crossing goes through [`to_millis`].

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    Millis(i64),
    /// Fractional millis as produced by some JSON encoders.
    FloatMillis(f64),
    Pair {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(alias = "_nanoseconds", alias = "nanos", default)]
        nanoseconds: i64,
    },
    Iso(String),
    /// Server timestamp placeholder not yet resolved (`{".sv": "timestamp"}`).
    Sentinel {
        #[serde(rename = ".sv")]
        sv: String,
    },
}

/// `None` for the unresolved sentinel or an unparsable value.
pub fn to_millis(ts: &RemoteTimestamp) -> Option<i64> {
    match ts {
        RemoteTimestamp::Millis(ms) => Some(*ms),
        RemoteTimestamp::FloatMillis(ms) if ms.is_finite() => Some(ms.trunc() as i64),
        RemoteTimestamp::FloatMillis(_) => None,
        RemoteTimestamp::Pair {
            seconds,
            nanoseconds,
        } => seconds.checked_mul(1000)?.checked_add(nanoseconds / 1_000_000),
        RemoteTimestamp::Iso(s) => parse_iso(s),
        RemoteTimestamp::Sentinel { .. } => None,
    }
}

/// Normalize an optional remote value, substituting `fallback` when the value
/// is missing or still unresolved.
pub fn to_millis_or(ts: Option<&RemoteTimestamp>, fallback: i64) -> i64 {
    ts.and_then(to_millis).unwrap_or(fallback)
}

fn parse_iso(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // Offset-less strings are taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
