// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::LineError;
use chrono::{DateTime, SubsecRound, Utc};

/// Precision kept for line timestamps, matching what the SQL store can hold.
const TIMESTAMP_DIGITS: u16 = 6;

/// Splits a pod log line of the form `<RFC3339Nano timestamp> <message>` into its timestamp and
/// the trimmed message. The timestamp is truncated to microseconds.
///
/// The log API prefixes every line with its timestamp when asked to, so the first space is the
/// separator. Neither failure is fatal: both carry the remainder so the caller can log it before
/// skipping the line.
pub fn parse_timestamp_line(line: &str) -> Result<(DateTime<Utc>, &str), LineError> {
    let Some((prefix, rest)) = line.split_once(' ') else {
        return Err(LineError::MalformedLine {
            remainder: line.to_string(),
        });
    };
    let rest = rest.trim();

    match DateTime::parse_from_rfc3339(prefix) {
        Ok(ts) => Ok((ts.with_timezone(&Utc).trunc_subsecs(TIMESTAMP_DIGITS), rest)),
        Err(source) => Err(LineError::BadTimestamp {
            remainder: rest.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use proptest::prelude::*;

    #[test]
    fn parses_nanosecond_timestamp_truncated_to_micros() {
        let (ts, rest) = parse_timestamp_line("2024-01-01T00:00:00.123456789Z hello").unwrap();
        assert_eq!(
            ts,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::microseconds(123_456)
        );
        assert_eq!(ts.nanosecond(), 123_456_000);
        assert_eq!(rest, "hello");
    }

    #[test]
    fn sub_microsecond_digits_do_not_change_the_timestamp() {
        let (a, _) = parse_timestamp_line("2024-01-01T00:00:00.000001999Z x").unwrap();
        let (b, _) = parse_timestamp_line("2024-01-01T00:00:00.000001Z x").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp_subsec_micros(), 1);
    }

    #[test]
    fn trims_trailing_whitespace_and_newline() {
        let (_, rest) = parse_timestamp_line("2024-01-01T00:00:00Z   {\"event\":\"X\"} \r\n").unwrap();
        assert_eq!(rest, "{\"event\":\"X\"}");
    }

    #[test]
    fn converts_offsets_to_utc() {
        let (ts, _) = parse_timestamp_line("2024-01-01T02:00:00+02:00 x").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn missing_separator_returns_whole_line() {
        let err = parse_timestamp_line("2024-01-01T00:00:00Z").unwrap_err();
        assert!(matches!(err, LineError::MalformedLine { .. }));
        assert_eq!(err.remainder(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn bad_timestamp_keeps_remainder() {
        let err = parse_timestamp_line("yesterday  some message ").unwrap_err();
        assert!(matches!(err, LineError::BadTimestamp { .. }));
        assert_eq!(err.remainder(), "some message");
    }

    #[test]
    fn empty_message_is_not_an_error() {
        let (_, rest) = parse_timestamp_line("2024-01-01T00:00:00Z ").unwrap();
        assert_eq!(rest, "");
    }

    proptest! {
        #[test]
        fn formatted_timestamps_round_trip(secs in 0i64..4_000_000_000, nanos in 0u32..1_000_000_000) {
            let ts = Utc.timestamp_opt(secs, nanos).unwrap();
            let line = format!("{} payload", ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
            let (parsed, rest) = parse_timestamp_line(&line).unwrap();
            prop_assert_eq!(parsed, ts.trunc_subsecs(6));
            prop_assert_eq!(rest, "payload");
        }

        #[test]
        fn never_panics(line in ".*") {
            let _ = parse_timestamp_line(&line);
        }
    }
}
