//! Truncation of timestamps to bucket boundaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_HOUR: i64 = 3_600_000;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Maps a timestamp to the start of the bucket that contains it.
///
/// Implementations must be idempotent (`process(process(t)) == process(t)`) and monotonic. An
/// interval that maps every timestamp to `0` puts a counter into non-temporal mode, where only a
/// single bucket exists.
pub trait Interval: fmt::Debug + Send + Sync {
    /// Returns the bucket start in milliseconds since the epoch.
    fn process(&self, timestamp: i64) -> i64;
}

/// The bucket granularities shipped with the store, all computed in UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricInterval {
    /// A single bucket at the epoch.
    #[default]
    None,
    /// Start of the hour.
    Hourly,
    /// Midnight.
    Daily,
    /// Midnight of the Monday starting the ISO week.
    Weekly,
    /// Midnight of the first day of the month.
    Monthly,
    /// Midnight of January 1st.
    Yearly,
}

impl MetricInterval {
    /// Returns the name used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

fn truncate_date(timestamp: i64, f: impl FnOnce(NaiveDate) -> Option<NaiveDate>) -> i64 {
    DateTime::from_timestamp_millis(timestamp)
        .and_then(|datetime| f(datetime.date_naive()))
        .map(|date| date.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
        .unwrap_or(timestamp)
}

impl Interval for MetricInterval {
    fn process(&self, timestamp: i64) -> i64 {
        match self {
            Self::None => 0,
            Self::Hourly => timestamp.div_euclid(MILLIS_PER_HOUR) * MILLIS_PER_HOUR,
            Self::Daily => timestamp.div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY,
            Self::Weekly => truncate_date(timestamp, |date| {
                date.checked_sub_days(Days::new(date.weekday().num_days_from_monday().into()))
            }),
            Self::Monthly => truncate_date(timestamp, |date| date.with_day(1)),
            Self::Yearly => truncate_date(timestamp, |date| date.with_ordinal(1)),
        }
    }
}

impl fmt::Display for MetricInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error returned when parsing an unknown [`MetricInterval`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval `{0}`")]
pub struct ParseIntervalError(String);

impl FromStr for MetricInterval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "hourly" => Self::Hourly,
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "monthly" => Self::Monthly,
            "yearly" => Self::Yearly,
            _ => return Err(ParseIntervalError(s.to_owned())),
        })
    }
}

/// Converts a millisecond timestamp into a UTC date time.
pub(crate) fn to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp).unwrap_or_default()
}
