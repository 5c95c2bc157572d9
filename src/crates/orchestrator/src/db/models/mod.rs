//! Row models
//!
//! Rows mirror the SQL tables one to one. Timestamps are stored as RFC 3339
//! UTC strings with millisecond precision, so lexical order in SQL equals
//! chronological order. JSON-valued columns are stored as TEXT.

pub mod automation;
pub mod checkpoint;
pub mod preference;
pub mod task;

pub use automation::AutomationRow;
pub use checkpoint::CheckpointRow;
pub use preference::PreferenceRow;
pub use task::TaskRow;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::db::error::{DatabaseError, DbResult};

/// Current time at the precision the store keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Format a timestamp for storage
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn format_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_ts)
}

/// Parse a stored timestamp
pub fn parse_ts(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::type_error(format!("timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: &Option<String>) -> DbResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_ts(&ts), "2025-03-04T05:06:07.000Z");
        assert_eq!(parse_ts("2025-03-04T05:06:07.000Z").unwrap(), ts);
    }

    #[test]
    fn test_now_round_trips() {
        let ts = now();
        assert_eq!(parse_ts(&format_ts(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_bad_timestamp_is_type_error() {
        assert!(matches!(
            parse_ts("yesterday"),
            Err(DatabaseError::TypeError(_))
        ));
    }
}
