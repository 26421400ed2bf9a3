use chrono::{DateTime, Utc};

/// Minor currency units (kobo/cents) per token.
pub const MINOR_UNITS_PER_TOKEN: u64 = 50;

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Whole calendar days (UTC) between two unix timestamps, later minus earlier.
pub fn days_between(earlier_ts: i64, later_ts: i64) -> i64 {
    let earlier = DateTime::<Utc>::from_timestamp(earlier_ts, 0)
        .unwrap_or_default()
        .date_naive();
    let later = DateTime::<Utc>::from_timestamp(later_ts, 0)
        .unwrap_or_default()
        .date_naive();
    (later - earlier).num_days()
}

pub fn same_calendar_day(a_ts: i64, b_ts: i64) -> bool {
    days_between(a_ts, b_ts) == 0
}

/// Locally generated payment reference. Generated before the gateway call so
/// the reference survives a gateway failure partway through initialization.
pub fn new_payment_reference(user_id: &str) -> String {
    let user_part = user_id.replace(':', "-");
    format!("sema-{}-{}", Utc::now().timestamp_millis(), user_part)
}

pub fn tokens_for_amount(amount_minor: u64) -> u64 {
    amount_minor / MINOR_UNITS_PER_TOKEN
}
