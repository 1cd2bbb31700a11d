//! Fixed-width binary encoding of a single metric row.
//!
//! Every row stores a 20 byte big-endian payload:
//!
//! | bytes  | field                  | encoding                                   |
//! |--------|------------------------|--------------------------------------------|
//! | 0-3    | quantized event time   | whole minutes since the epoch as `i32`     |
//! | 4-11   | cumulative amount      | `round(amount * 10^6)` as `i64`            |
//! | 12-19  | delta amount           | `round(amount * 10^6)` as `i64`            |
//!
//! Since the timestamp occupies the leading bytes, byte-wise ordering of payloads of a single
//! counter equals ordering by time. The same offsets are used by the [`SqlVendor`] to express
//! in-place arithmetic on the stored payload, so they must only ever be taken from this module.
//!
//! [`SqlVendor`]: crate::SqlVendor

use std::fmt;

use crate::MetricError;

/// Number of decimal places retained for amounts.
pub const AMOUNT_DECIMAL_PLACES: u32 = 6;

/// Multiplier converting an amount into its fixed-point representation.
pub const AMOUNT_DECIMAL_SHIFT: i64 = 10_i64.pow(AMOUNT_DECIMAL_PLACES);

/// Divisor converting milliseconds into the stored minute resolution.
pub const DATE_DECIMAL_SHIFT: i64 = 60_000;

/// Width of the timestamp field in bytes.
pub const DATE_BYTE_SIZE: usize = 4;

/// Width of each amount field in bytes.
pub const AMOUNT_BYTE_SIZE: usize = 8;

/// Total width of an encoded payload in bytes.
pub const DATA_BYTE_SIZE: usize = DATE_BYTE_SIZE + 2 * AMOUNT_BYTE_SIZE;

/// Selects one of the two amount fields of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmountPosition {
    /// The running total up to and including the row's event time.
    Cumulative,
    /// The amount contributed at exactly the row's event time.
    Delta,
}

impl AmountPosition {
    /// Byte offset of the field within the payload.
    pub const fn offset(self) -> usize {
        match self {
            Self::Cumulative => DATE_BYTE_SIZE,
            Self::Delta => DATE_BYTE_SIZE + AMOUNT_BYTE_SIZE,
        }
    }
}

/// Converts an amount into its fixed-point integer representation.
pub fn to_fixed_point(amount: f64) -> i64 {
    (amount * AMOUNT_DECIMAL_SHIFT as f64).round() as i64
}

/// Converts a fixed-point integer back into an amount.
pub fn from_fixed_point(value: i64) -> f64 {
    value as f64 / AMOUNT_DECIMAL_SHIFT as f64
}

/// Quantizes a millisecond timestamp into whole minutes.
fn to_minutes(timestamp: i64) -> i32 {
    (timestamp / DATE_DECIMAL_SHIFT) as i32
}

/// Truncates a millisecond timestamp to the resolution stored in a payload.
pub fn truncate_timestamp(timestamp: i64) -> i64 {
    i64::from(to_minutes(timestamp)) * DATE_DECIMAL_SHIFT
}

/// An encoded metric payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricData([u8; DATA_BYTE_SIZE]);

impl MetricData {
    /// Encodes a payload from a millisecond timestamp and two amounts.
    pub fn encode(timestamp: i64, cumulative: f64, delta: f64) -> Self {
        Self::from_fixed(timestamp, to_fixed_point(cumulative), to_fixed_point(delta))
    }

    /// Encodes a payload from amounts already in fixed-point representation.
    pub fn from_fixed(timestamp: i64, cumulative: i64, delta: i64) -> Self {
        let mut bytes = [0; DATA_BYTE_SIZE];
        bytes[..DATE_BYTE_SIZE].copy_from_slice(&to_minutes(timestamp).to_be_bytes());
        Self::write_amount(&mut bytes, AmountPosition::Cumulative, cumulative);
        Self::write_amount(&mut bytes, AmountPosition::Delta, delta);
        Self(bytes)
    }

    /// Returns the smallest payload sorting at the given timestamp.
    ///
    /// Used as an inclusive lower bound when comparing raw payloads in SQL.
    pub fn lower_bound(timestamp: i64) -> Self {
        Self::bound(timestamp, 0x00)
    }

    /// Returns the largest payload sorting at the given timestamp.
    ///
    /// Used as an inclusive upper bound when comparing raw payloads in SQL.
    pub fn upper_bound(timestamp: i64) -> Self {
        Self::bound(timestamp, 0xff)
    }

    fn bound(timestamp: i64, fill: u8) -> Self {
        let mut bytes = [fill; DATA_BYTE_SIZE];
        bytes[..DATE_BYTE_SIZE].copy_from_slice(&to_minutes(timestamp).to_be_bytes());
        Self(bytes)
    }

    fn write_amount(bytes: &mut [u8; DATA_BYTE_SIZE], position: AmountPosition, amount: i64) {
        let offset = position.offset();
        bytes[offset..offset + AMOUNT_BYTE_SIZE].copy_from_slice(&amount.to_be_bytes());
    }

    /// Parses a payload read from the database.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MetricError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| MetricError::MalformedData(bytes.len()))
    }

    /// Returns the event time in milliseconds since the epoch, truncated to the minute.
    pub fn timestamp(&self) -> i64 {
        let mut minutes = [0; DATE_BYTE_SIZE];
        minutes.copy_from_slice(&self.0[..DATE_BYTE_SIZE]);
        i64::from(i32::from_be_bytes(minutes)) * DATE_DECIMAL_SHIFT
    }

    /// Returns a copy of this payload with both amount fields replaced.
    pub fn with_amounts(&self, cumulative: i64, delta: i64) -> Self {
        Self::from_fixed(self.timestamp(), cumulative, delta)
    }

    /// Returns the fixed-point value of an amount field.
    pub fn fixed_amount(&self, position: AmountPosition) -> i64 {
        let offset = position.offset();
        let mut amount = [0; AMOUNT_BYTE_SIZE];
        amount.copy_from_slice(&self.0[offset..offset + AMOUNT_BYTE_SIZE]);
        i64::from_be_bytes(amount)
    }

    /// Returns an amount field.
    pub fn amount(&self, position: AmountPosition) -> f64 {
        from_fixed_point(self.fixed_amount(position))
    }

    /// Returns the cumulative amount.
    pub fn cumulative(&self) -> f64 {
        self.amount(AmountPosition::Cumulative)
    }

    /// Returns the delta amount.
    pub fn delta(&self) -> f64 {
        self.amount(AmountPosition::Delta)
    }

    /// Returns the raw payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MetricData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricData")
            .field("timestamp", &self.timestamp())
            .field("cumulative", &self.cumulative())
            .field("delta", &self.delta())
            .finish()
    }
}

/// Applies the range differencing formula to the newest and oldest row of a range.
///
/// Everything before the oldest row is subtracted while the delta recorded exactly at the oldest
/// row is still credited.
pub fn range_amount(max: &MetricData, min: &MetricData) -> f64 {
    let max_cumulative = max.fixed_amount(AmountPosition::Cumulative);
    let min_cumulative = min.fixed_amount(AmountPosition::Cumulative);
    let min_delta = min.fixed_amount(AmountPosition::Delta);
    from_fixed_point(max_cumulative - (min_cumulative - min_delta))
}
