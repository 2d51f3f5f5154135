//! Display helpers for rendering messages in a host UI.

use chrono::{DateTime, Local, TimeZone};

pub const PENDING_LABEL: &str = "sending...";

/// Human readable size: `512B`, `1.5KB`, `40.0MB`.
pub fn format_file_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes < KIB {
        format!("{bytes}B")
    } else if bytes < MIB {
        format!("{:.1}KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1}MB", bytes as f64 / MIB as f64)
    }
}

pub fn format_sent_at(sent_at: Option<u64>) -> String {
    format_sent_at_relative(sent_at, &Local::now())
}

/// Time of day for messages sent on the same calendar day as `now`,
/// otherwise month/day plus time, always 24-hour.
pub fn format_sent_at_relative<Tz: TimeZone>(sent_at: Option<u64>, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let Some(ms) = sent_at else {
        return PENDING_LABEL.to_owned();
    };
    let Some(utc) = i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
    else {
        return "now".to_owned();
    };
    let sent = utc.with_timezone(&now.timezone());
    if sent.date_naive() == now.date_naive() {
        sent.format("%H:%M").to_string()
    } else {
        sent.format("%m/%d %H:%M").to_string()
    }
}
