//! Conversions between the `time` instants used on the wire by `async-nats`
//! and the `chrono` instants used everywhere else.
use chrono::{DateTime, TimeZone, Utc};
use time::OffsetDateTime;

pub fn to_chrono(instant: OffsetDateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(instant.unix_timestamp(), instant.nanosecond())
        .single()
        .unwrap_or_default()
}

/// Instants outside the range of `time` collapse to the Unix epoch.
pub fn to_offset(instant: DateTime<Utc>) -> OffsetDateTime {
    let nanos = i128::from(instant.timestamp()) * 1_000_000_000
        + i128::from(instant.timestamp_subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
