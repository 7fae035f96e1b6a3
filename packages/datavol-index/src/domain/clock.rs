//! Write timestamps
//!
//! Rows carry microseconds since the Unix epoch. Timestamps issued by this
//! process are strictly increasing, so two writes for the same key never tie
//! and last-writer-wins reads are deterministic within one writer.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Next write timestamp (wall clock, bumped past the previous one)
pub fn next_timestamp() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return from_micros(next),
            Err(observed) => last = observed,
        }
    }
}

pub fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}
