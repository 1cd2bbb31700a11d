//! Dialect specific SQL fragments.
//!
//! Amount arithmetic on stored payloads happens inside the database, so that concurrent writers
//! never read-modify-write a row from the application. The dialect only has to know how to cut a
//! fixed-width field out of a binary column, how to turn it into an integer and back, and how to
//! put a binary value together again. The field layout itself is owned by [`crate::codec`].

use std::fmt;

use crate::codec::{AMOUNT_BYTE_SIZE, AmountPosition, DATE_BYTE_SIZE};

/// Alphabet of the upper case hexadecimal digits produced by the dialect's hex function.
const HEX_DIGITS: &str = "0123456789ABCDEF";

/// A database dialect used to generate metric statements.
pub trait SqlVendor: fmt::Debug + Send + Sync {
    /// Quotes a table or column name.
    fn quote(&self, identifier: &str) -> String;

    /// Returns the placeholder of a positional bind parameter.
    fn placeholder(&self) -> &'static str;

    /// Returns an expression evaluating to the upper case hex text of a binary expression.
    fn hex(&self, expression: &str) -> String;

    /// Returns an expression cutting `length` bytes starting at byte `offset` out of hex text.
    fn hex_substring(&self, hex: &str, offset: usize, length: usize) -> String;

    /// Returns an expression decoding `length` bytes of big-endian hex text into a signed integer.
    fn hex_to_integer(&self, hex: &str, length: usize) -> String;

    /// Returns an expression encoding an integer into `length` bytes of big-endian hex text.
    fn integer_to_hex(&self, expression: &str, length: usize) -> String;

    /// Returns an expression turning hex text back into a binary value.
    fn unhex(&self, hex: &str) -> String;

    /// Returns an expression concatenating text expressions.
    fn concat(&self, parts: &[String]) -> String;

    /// Returns the clause limiting a result set to `limit` rows.
    fn limit(&self, limit: usize) -> String;

    /// Returns `true` if the error was caused by a uniqueness constraint.
    fn is_duplicate_key(&self, error: &sqlx::Error) -> bool;

    /// Returns an integer expression reading one amount field of a payload column.
    fn read_amount(&self, column: &str, position: AmountPosition) -> String {
        let hex = self.hex(column);
        let field = self.hex_substring(&hex, position.offset(), AMOUNT_BYTE_SIZE);
        self.hex_to_integer(&field, AMOUNT_BYTE_SIZE)
    }

    /// Returns a hex text expression holding the unchanged amount field of a payload column.
    fn keep_amount(&self, column: &str, position: AmountPosition) -> String {
        self.hex_substring(&self.hex(column), position.offset(), AMOUNT_BYTE_SIZE)
    }

    /// Returns a hex text expression holding the unchanged timestamp of a payload column.
    fn keep_timestamp(&self, column: &str) -> String {
        self.hex_substring(&self.hex(column), 0, DATE_BYTE_SIZE)
    }

    /// Returns a hex text expression for an amount field from an integer expression.
    fn write_amount(&self, expression: &str) -> String {
        self.integer_to_hex(expression, AMOUNT_BYTE_SIZE)
    }
}

/// SQL dialect of SQLite 3.41 and newer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteVendor;

impl SqlVendor for SqliteVendor {
    fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn placeholder(&self) -> &'static str {
        "?"
    }

    fn hex(&self, expression: &str) -> String {
        format!("hex({expression})")
    }

    fn hex_substring(&self, hex: &str, offset: usize, length: usize) -> String {
        format!("substr({hex}, {}, {})", 2 * offset + 1, 2 * length)
    }

    fn hex_to_integer(&self, hex: &str, length: usize) -> String {
        // SQLite has no base-16 integer parsing, so the value is assembled nibble by nibble. The
        // top nibble shifted into the sign bit restores negative amounts.
        let nibbles = 2 * length;
        let terms: Vec<String> = (0..nibbles)
            .map(|nibble| {
                let shift = 4 * (nibbles - 1 - nibble);
                format!(
                    "((instr('{HEX_DIGITS}', substr({hex}, {}, 1)) - 1) << {shift})",
                    nibble + 1
                )
            })
            .collect();
        format!("({})", terms.join(" | "))
    }

    fn integer_to_hex(&self, expression: &str, length: usize) -> String {
        format!("printf('%0{}X', {expression})", 2 * length)
    }

    fn unhex(&self, hex: &str) -> String {
        format!("unhex({hex})")
    }

    fn concat(&self, parts: &[String]) -> String {
        parts.join(" || ")
    }

    fn limit(&self, limit: usize) -> String {
        format!("LIMIT {limit}")
    }

    fn is_duplicate_key(&self, error: &sqlx::Error) -> bool {
        match error {
            sqlx::Error::Database(error) => error.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments() {
        let vendor = SqliteVendor;
        assert_eq!(vendor.quote("typeId"), r#""typeId""#);
        assert_eq!(vendor.keep_timestamp(r#""data""#), r#"substr(hex("data"), 1, 8)"#);
        assert_eq!(
            vendor.keep_amount(r#""data""#, AmountPosition::Delta),
            r#"substr(hex("data"), 25, 16)"#
        );
        assert_eq!(vendor.write_amount("x + ?"), "printf('%016X', x + ?)");
        assert_eq!(vendor.limit(200), "LIMIT 200");
    }

    #[test]
    fn test_hex_to_integer_single_byte() {
        insta::assert_snapshot!(SqliteVendor.hex_to_integer("'7F'", 1), @"(((instr('0123456789ABCDEF', substr('7F', 1, 1)) - 1) << 4) | ((instr('0123456789ABCDEF', substr('7F', 2, 1)) - 1) << 0))");
    }

    #[tokio::test]
    async fn test_amount_arithmetic_in_database() {
        use sqlx::Row;

        use crate::codec::MetricData;

        let db = crate::testutils::setup_db().await;
        let vendor = SqliteVendor;
        let data = MetricData::encode(1_714_644_000_000, -3.5, 2.25);

        let column = vendor.quote("data");
        let cumulative = vendor.read_amount(&column, AmountPosition::Cumulative);
        let rewritten = vendor.unhex(&vendor.concat(&[
            vendor.keep_timestamp(&column),
            vendor.write_amount(&format!("{cumulative} + 1000000")),
            vendor.keep_amount(&column, AmountPosition::Delta),
        ]));

        let row = sqlx::query(&format!(
            "WITH payload({column}) AS (SELECT ?) SELECT {rewritten} FROM payload"
        ))
        .bind(data.as_bytes())
        .fetch_one(&db)
        .await
        .unwrap();

        let bytes: Vec<u8> = row.try_get(0).unwrap();
        let rewritten = MetricData::from_slice(&bytes).unwrap();
        assert_eq!(rewritten, MetricData::encode(1_714_644_000_000, -2.5, 2.25));
    }
}
