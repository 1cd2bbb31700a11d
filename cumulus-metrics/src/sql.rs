//! Statements of the metric store.
//!
//! All statements are generated through a [`SqlVendor`] and carry their bind values, so callers
//! only pick an executor. Subject, type and dimension identifiers are stored as 16 byte blobs.

use std::fmt;
use std::sync::Arc;

use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use uuid::Uuid;

use crate::codec::{AmountPosition, MetricData};
use crate::vendor::{SqlVendor, SqliteVendor};

const METRIC: &str = "Metric";
const DIMENSION: &str = "MetricDimension";
const SYMBOL: &str = "MetricSymbol";
const RESUMMARIZATION: &str = "MetricResummarization";
const LOCK: &str = "MetricLock";

/// Identifies all rows of one counter attached to one subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    /// The record the counter is attached to.
    pub subject_id: Uuid,
    /// The declared type of the subject.
    pub type_id: Uuid,
    /// The interned counter name.
    pub symbol_id: i64,
}

impl CounterKey {
    /// Narrows the key to a single dimension.
    pub fn dimension(self, dimension_id: Uuid) -> MetricKey {
        MetricKey {
            subject_id: self.subject_id,
            type_id: self.type_id,
            symbol_id: self.symbol_id,
            dimension_id,
        }
    }
}

/// The logical key of a metric: one counter of one subject in one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    /// The record the counter is attached to.
    pub subject_id: Uuid,
    /// The declared type of the subject.
    pub type_id: Uuid,
    /// The interned counter name.
    pub symbol_id: i64,
    /// The dimension, nil for the aggregate across all dimensions.
    pub dimension_id: Uuid,
}

impl MetricKey {
    /// Returns the key without its dimension.
    pub fn counter(&self) -> CounterKey {
        CounterKey {
            subject_id: self.subject_id,
            type_id: self.type_id,
            symbol_id: self.symbol_id,
        }
    }

    /// Returns the key of the aggregate across all dimensions.
    pub fn aggregate(&self) -> Self {
        self.counter().dimension(Uuid::nil())
    }
}

/// Restricts the newest payload considered by a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpperBound {
    /// Rows strictly before the minute of the timestamp.
    Before(i64),
    /// Rows at or before the minute of the timestamp.
    Through(i64),
}

/// A value bound to a statement placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlValue {
    /// An identifier, stored as 16 bytes.
    Uuid(Uuid),
    /// An integer.
    Int(i64),
    /// A binary value.
    Bytes(Vec<u8>),
    /// A text value.
    Text(String),
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<MetricData> for SqlValue {
    fn from(value: MetricData) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// A generated statement together with its bind values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    values: Vec<SqlValue>,
}

impl Statement {
    /// Returns the generated SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Returns the bind values in placeholder order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Creates an executable query borrowing the statement.
    pub fn query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.values {
            query = match value {
                SqlValue::Uuid(uuid) => query.bind(uuid.as_bytes().as_slice()),
                SqlValue::Int(int) => query.bind(*int),
                SqlValue::Bytes(bytes) => query.bind(bytes.as_slice()),
                SqlValue::Text(text) => query.bind(text.as_str()),
            };
        }
        query
    }
}

/// Incrementally assembles a [`Statement`], keeping SQL text and bind values in step.
struct StatementBuilder<'a> {
    vendor: &'a dyn SqlVendor,
    sql: String,
    values: Vec<SqlValue>,
}

impl<'a> StatementBuilder<'a> {
    fn new(vendor: &'a dyn SqlVendor) -> Self {
        Self {
            vendor,
            sql: String::new(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn ident(&mut self, identifier: &str) -> &mut Self {
        let quoted = self.vendor.quote(identifier);
        self.push(&quoted)
    }

    fn bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.values.push(value.into());
        let placeholder = self.vendor.placeholder();
        self.push(placeholder)
    }

    /// Pushes ` AND <column> = ?`.
    fn and_eq(&mut self, column: &str, value: impl Into<SqlValue>) -> &mut Self {
        self.push(" AND ").ident(column).push(" = ").bind(value)
    }

    /// Pushes the filter on every column of a counter key, starting the `WHERE` clause.
    fn where_counter(&mut self, key: &CounterKey) -> &mut Self {
        self.push(" WHERE ").ident("id").push(" = ").bind(key.subject_id);
        self.and_eq("typeId", key.type_id)
            .and_eq("symbolId", key.symbol_id)
    }

    /// Pushes the filter on every column of a metric key, starting the `WHERE` clause.
    fn where_key(&mut self, key: &MetricKey) -> &mut Self {
        self.where_counter(&key.counter())
            .and_eq("dimensionId", key.dimension_id)
    }

    /// Pushes the filter selecting the rows of exactly one minute.
    fn and_minute(&mut self, timestamp: i64) -> &mut Self {
        self.and_from(Some(timestamp))
            .and_to(Some(UpperBound::Through(timestamp)))
    }

    fn and_from(&mut self, from: Option<i64>) -> &mut Self {
        if let Some(from) = from {
            self.push(" AND ")
                .ident("data")
                .push(" >= ")
                .bind(MetricData::lower_bound(from));
        }
        self
    }

    fn and_to(&mut self, to: Option<UpperBound>) -> &mut Self {
        match to {
            Some(UpperBound::Before(to)) => self
                .push(" AND ")
                .ident("data")
                .push(" < ")
                .bind(MetricData::lower_bound(to)),
            Some(UpperBound::Through(to)) => self
                .push(" AND ")
                .ident("data")
                .push(" <= ")
                .bind(MetricData::upper_bound(to)),
            None => self,
        }
    }

    fn build(self) -> Statement {
        Statement {
            sql: self.sql,
            values: self.values,
        }
    }
}

/// Generates every statement of the metric store for one dialect.
#[derive(Clone)]
pub struct MetricSql {
    vendor: Arc<dyn SqlVendor>,
}

impl fmt::Debug for MetricSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetricSql").field(&self.vendor).finish()
    }
}

impl Default for MetricSql {
    fn default() -> Self {
        Self::new(Arc::new(SqliteVendor))
    }
}

impl MetricSql {
    /// Creates statements for the given dialect.
    pub fn new(vendor: Arc<dyn SqlVendor>) -> Self {
        Self { vendor }
    }

    /// Returns the dialect.
    pub fn vendor(&self) -> &dyn SqlVendor {
        self.vendor.as_ref()
    }

    fn builder(&self) -> StatementBuilder<'_> {
        StatementBuilder::new(self.vendor.as_ref())
    }

    /// Selects the newest payload of a key, optionally bounded.
    pub fn select_max(&self, key: &MetricKey, to: Option<UpperBound>) -> Statement {
        let mut b = self.builder();
        b.push("SELECT MAX(").ident("data").push(") FROM ").ident(METRIC);
        b.where_key(key).and_to(to);
        b.build()
    }

    /// Selects the oldest payload of a key at or after `from`.
    pub fn select_min(&self, key: &MetricKey, from: Option<i64>) -> Statement {
        let mut b = self.builder();
        b.push("SELECT MIN(").ident("data").push(") FROM ").ident(METRIC);
        b.where_key(key).and_from(from);
        b.build()
    }

    /// Selects the oldest and newest payload of a key within a range.
    pub fn select_extrema(
        &self,
        key: &MetricKey,
        from: Option<i64>,
        to: Option<UpperBound>,
    ) -> Statement {
        let mut b = self.builder();
        b.push("SELECT MIN(")
            .ident("data")
            .push("), MAX(")
            .ident("data")
            .push(") FROM ")
            .ident(METRIC);
        b.where_key(key).and_from(from).and_to(to);
        b.build()
    }

    /// Inserts a new row.
    pub fn insert(&self, key: &MetricKey, data: MetricData) -> Statement {
        let mut b = self.builder();
        b.push("INSERT INTO ").ident(METRIC).push(" (");
        b.ident("id").push(", ").ident("typeId").push(", ");
        b.ident("symbolId").push(", ").ident("dimensionId").push(", ");
        b.ident("data").push(") VALUES (");
        b.bind(key.subject_id).push(", ").bind(key.type_id).push(", ");
        b.bind(key.symbol_id).push(", ").bind(key.dimension_id).push(", ");
        b.bind(data).push(")");
        b.build()
    }

    /// Adds `delta` to both amounts of the row at exactly the minute of `timestamp`.
    pub fn update_bucket(&self, key: &MetricKey, timestamp: i64, delta: i64) -> Statement {
        let vendor = self.vendor();
        let data = vendor.quote("data");
        let placeholder = vendor.placeholder();

        let cumulative = vendor.read_amount(&data, AmountPosition::Cumulative);
        let current_delta = vendor.read_amount(&data, AmountPosition::Delta);
        let payload = vendor.unhex(&vendor.concat(&[
            vendor.keep_timestamp(&data),
            vendor.write_amount(&format!("{cumulative} + {placeholder}")),
            vendor.write_amount(&format!("{current_delta} + {placeholder}")),
        ]));

        let mut b = self.builder();
        b.push("UPDATE ").ident(METRIC).push(" SET ");
        b.push(&data).push(" = ").push(&payload);
        b.values.extend([SqlValue::Int(delta), SqlValue::Int(delta)]);
        b.where_key(key).and_minute(timestamp);
        b.build()
    }

    /// Adds `delta` to the cumulative amount of every row at or after the minute of `timestamp`
    /// and to the delta amount of the row at exactly that minute.
    pub fn update_from(&self, key: &MetricKey, timestamp: i64, delta: i64) -> Statement {
        let vendor = self.vendor();
        let data = vendor.quote("data");
        let placeholder = vendor.placeholder();

        let cumulative = vendor.read_amount(&data, AmountPosition::Cumulative);
        let current_delta = vendor.read_amount(&data, AmountPosition::Delta);
        let delta_field = format!(
            "CASE WHEN {data} <= {placeholder} THEN {} ELSE {} END",
            vendor.write_amount(&format!("{current_delta} + {placeholder}")),
            vendor.keep_amount(&data, AmountPosition::Delta),
        );
        let payload = vendor.unhex(&vendor.concat(&[
            vendor.keep_timestamp(&data),
            vendor.write_amount(&format!("{cumulative} + {placeholder}")),
            delta_field,
        ]));

        let mut b = self.builder();
        b.push("UPDATE ").ident(METRIC).push(" SET ");
        b.push(&data).push(" = ").push(&payload);
        b.values.extend([
            SqlValue::Int(delta),
            MetricData::upper_bound(timestamp).into(),
            SqlValue::Int(delta),
        ]);
        b.where_key(key).and_from(Some(timestamp));
        b.build()
    }

    /// Replaces the payload of the row at exactly the minute of `data`.
    pub fn replace(&self, key: &MetricKey, data: MetricData) -> Statement {
        let mut b = self.builder();
        b.push("UPDATE ")
            .ident(METRIC)
            .push(" SET ")
            .ident("data")
            .push(" = ")
            .bind(data);
        b.where_key(key).and_minute(data.timestamp());
        b.build()
    }

    /// Rewrites the type of the row at exactly the minute of `timestamp`, whatever type it has.
    pub fn repair(&self, key: &MetricKey, timestamp: i64) -> Statement {
        let mut b = self.builder();
        b.push("UPDATE ")
            .ident(METRIC)
            .push(" SET ")
            .ident("typeId")
            .push(" = ")
            .bind(key.type_id);
        b.push(" WHERE ").ident("id").push(" = ").bind(key.subject_id);
        b.and_eq("symbolId", key.symbol_id)
            .and_eq("dimensionId", key.dimension_id)
            .and_minute(timestamp);
        b.build()
    }

    /// Deletes all rows of a counter.
    pub fn delete_counter(&self, key: &CounterKey) -> Statement {
        let mut b = self.builder();
        b.push("DELETE FROM ").ident(METRIC);
        b.where_counter(key);
        b.build()
    }

    /// Deletes the rows of a key between two minutes, both inclusive.
    pub fn delete_range(&self, key: &MetricKey, first: i64, last: i64) -> Statement {
        let mut b = self.builder();
        b.push("DELETE FROM ").ident(METRIC);
        b.where_key(key)
            .and_from(Some(first))
            .and_to(Some(UpperBound::Through(last)));
        b.build()
    }

    /// Selects `(dimensionId, data)` of a counter ordered by dimension and time.
    pub fn select_rows(
        &self,
        key: &CounterKey,
        dimension_id: Option<Uuid>,
        from: Option<i64>,
        to: Option<UpperBound>,
    ) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ")
            .ident("dimensionId")
            .push(", ")
            .ident("data")
            .push(" FROM ")
            .ident(METRIC);
        b.where_counter(key);
        if let Some(dimension_id) = dimension_id {
            b.and_eq("dimensionId", dimension_id);
        }
        b.and_from(from).and_to(to);
        b.push(" ORDER BY ")
            .ident("dimensionId")
            .push(", ")
            .ident("data");
        b.build()
    }

    /// Selects the oldest and newest payload per dimension value, excluding the aggregate.
    pub fn select_breakdown(
        &self,
        key: &CounterKey,
        from: Option<i64>,
        to: Option<UpperBound>,
    ) -> Statement {
        let vendor = self.vendor();
        let metric = |column: &str| format!("m.{}", vendor.quote(column));
        let dimension = |column: &str| format!("d.{}", vendor.quote(column));

        let mut b = self.builder();
        b.push("SELECT ")
            .push(&dimension("value"))
            .push(", MIN(")
            .push(&metric("data"))
            .push("), MAX(")
            .push(&metric("data"))
            .push(") FROM ")
            .ident(METRIC)
            .push(" m JOIN ")
            .ident(DIMENSION)
            .push(" d ON ")
            .push(&metric("dimensionId"))
            .push(" = ")
            .push(&dimension("dimensionId"));
        b.push(" WHERE ")
            .push(&metric("id"))
            .push(" = ")
            .bind(key.subject_id);
        b.push(" AND ")
            .push(&metric("typeId"))
            .push(" = ")
            .bind(key.type_id);
        b.push(" AND ")
            .push(&metric("symbolId"))
            .push(" = ")
            .bind(key.symbol_id);
        b.push(" AND ")
            .push(&metric("dimensionId"))
            .push(" <> ")
            .bind(Uuid::nil());
        if let Some(from) = from {
            b.push(" AND ")
                .push(&metric("data"))
                .push(" >= ")
                .bind(MetricData::lower_bound(from));
        }
        match to {
            Some(UpperBound::Before(to)) => {
                b.push(" AND ")
                    .push(&metric("data"))
                    .push(" < ")
                    .bind(MetricData::lower_bound(to));
            }
            Some(UpperBound::Through(to)) => {
                b.push(" AND ")
                    .push(&metric("data"))
                    .push(" <= ")
                    .bind(MetricData::upper_bound(to));
            }
            None => {}
        }
        b.push(" GROUP BY ").push(&dimension("value"));
        b.build()
    }

    /// Selects the oldest payload at or after `from` and the newest payload at or before `to` per
    /// counter, for several counters of one subject.
    pub fn select_prefetch(
        &self,
        subject_id: Uuid,
        type_id: Uuid,
        symbol_ids: &[i64],
        dimension_id: Uuid,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ").ident("symbolId").push(", MIN(");
        match from {
            Some(from) => {
                b.push("CASE WHEN ")
                    .ident("data")
                    .push(" >= ")
                    .bind(MetricData::lower_bound(from))
                    .push(" THEN ")
                    .ident("data")
                    .push(" END");
            }
            None => {
                b.ident("data");
            }
        }
        b.push("), MAX(");
        match to {
            Some(to) => {
                b.push("CASE WHEN ")
                    .ident("data")
                    .push(" <= ")
                    .bind(MetricData::upper_bound(to))
                    .push(" THEN ")
                    .ident("data")
                    .push(" END");
            }
            None => {
                b.ident("data");
            }
        }
        b.push(") FROM ").ident(METRIC);
        b.push(" WHERE ").ident("id").push(" = ").bind(subject_id);
        b.and_eq("typeId", type_id);
        b.push(" AND ").ident("symbolId").push(" IN (");
        for (index, symbol_id) in symbol_ids.iter().enumerate() {
            if index > 0 {
                b.push(", ");
            }
            b.bind(*symbol_id);
        }
        b.push(")");
        b.and_eq("dimensionId", dimension_id);
        b.push(" GROUP BY ").ident("symbolId");
        b.build()
    }

    /// Selects the cumulative amounts of every dimension of a counter, excluding the aggregate.
    pub fn select_dimension_rows(&self, key: &CounterKey) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ").ident("data").push(" FROM ").ident(METRIC);
        b.where_counter(key);
        b.push(" AND ")
            .ident("dimensionId")
            .push(" <> ")
            .bind(Uuid::nil());
        b.build()
    }

    /// Selects one page of distinct `(typeId, id, dimensionId)` triples of a counter.
    ///
    /// Pages are ordered by the triple and continue strictly after `after`.
    pub fn select_keys_page(
        &self,
        symbol_id: i64,
        from: Option<i64>,
        to: Option<UpperBound>,
        after: Option<&MetricKey>,
        page_size: usize,
    ) -> Statement {
        let mut b = self.builder();
        b.push("SELECT DISTINCT ")
            .ident("typeId")
            .push(", ")
            .ident("id")
            .push(", ")
            .ident("dimensionId")
            .push(" FROM ")
            .ident(METRIC);
        b.push(" WHERE ").ident("symbolId").push(" = ").bind(symbol_id);
        b.and_from(from).and_to(to);
        if let Some(after) = after {
            b.push(" AND (").ident("typeId").push(" > ").bind(after.type_id);
            b.push(" OR (").ident("typeId").push(" = ").bind(after.type_id);
            b.push(" AND (").ident("id").push(" > ").bind(after.subject_id);
            b.push(" OR (").ident("id").push(" = ").bind(after.subject_id);
            b.push(" AND ")
                .ident("dimensionId")
                .push(" > ")
                .bind(after.dimension_id);
            b.push("))))");
        }
        b.push(" ORDER BY ")
            .ident("typeId")
            .push(", ")
            .ident("id")
            .push(", ")
            .ident("dimensionId");
        let limit = self.vendor.limit(page_size);
        b.push(" ").push(&limit);
        b.build()
    }

    /// Selects the identifier of a dimension value.
    pub fn select_dimension(&self, value: &str) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ")
            .ident("dimensionId")
            .push(" FROM ")
            .ident(DIMENSION);
        b.push(" WHERE ").ident("value").push(" = ").bind(value);
        b.build()
    }

    /// Inserts a new dimension value.
    pub fn insert_dimension(&self, dimension_id: Uuid, value: &str) -> Statement {
        let mut b = self.builder();
        b.push("INSERT INTO ")
            .ident(DIMENSION)
            .push(" (")
            .ident("dimensionId")
            .push(", ")
            .ident("value")
            .push(") VALUES (")
            .bind(dimension_id)
            .push(", ")
            .bind(value)
            .push(")");
        b.build()
    }

    /// Selects the symbol of a counter name.
    pub fn select_symbol(&self, value: &str) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ")
            .ident("symbolId")
            .push(" FROM ")
            .ident(SYMBOL);
        b.push(" WHERE ").ident("value").push(" = ").bind(value);
        b.build()
    }

    /// Selects every interned counter name.
    pub fn select_symbols(&self) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ")
            .ident("value")
            .push(" FROM ")
            .ident(SYMBOL)
            .push(" ORDER BY ")
            .ident("value");
        b.build()
    }

    /// Interns a new counter name, letting the database assign the symbol.
    pub fn insert_symbol(&self, value: &str) -> Statement {
        let mut b = self.builder();
        b.push("INSERT INTO ")
            .ident(SYMBOL)
            .push(" (")
            .ident("value")
            .push(") VALUES (")
            .bind(value)
            .push(")");
        b.build()
    }

    /// Selects the last periodic resummarization of a job.
    pub fn select_resummarization(&self, key: &str) -> Statement {
        let mut b = self.builder();
        b.push("SELECT ")
            .ident("startDate")
            .push(", ")
            .ident("endDate")
            .push(", ")
            .ident("runDate")
            .push(" FROM ")
            .ident(RESUMMARIZATION);
        b.push(" WHERE ").ident("key").push(" = ").bind(key);
        b.build()
    }

    /// Records a periodic resummarization of a job, replacing the previous record.
    pub fn upsert_resummarization(
        &self,
        key: &str,
        start_date: Option<i64>,
        end_date: i64,
        run_date: i64,
    ) -> Statement {
        let mut b = self.builder();
        b.push("INSERT INTO ")
            .ident(RESUMMARIZATION)
            .push(" (")
            .ident("key")
            .push(", ")
            .ident("startDate")
            .push(", ")
            .ident("endDate")
            .push(", ")
            .ident("runDate")
            .push(") VALUES (")
            .bind(key)
            .push(", ");
        match start_date {
            Some(start_date) => b.bind(start_date),
            None => b.push("NULL"),
        };
        b.push(", ")
            .bind(end_date)
            .push(", ")
            .bind(run_date)
            .push(") ON CONFLICT (")
            .ident("key")
            .push(") DO UPDATE SET ");
        for (index, column) in ["startDate", "endDate", "runDate"].into_iter().enumerate() {
            if index > 0 {
                b.push(", ");
            }
            b.ident(column).push(" = excluded.").ident(column);
        }
        b.build()
    }

    /// Deletes locks acquired before `acquired_before`.
    pub fn delete_stale_locks(&self, acquired_before: i64) -> Statement {
        let mut b = self.builder();
        b.push("DELETE FROM ").ident(LOCK);
        b.push(" WHERE ")
            .ident("acquiredAt")
            .push(" < ")
            .bind(acquired_before);
        b.build()
    }

    /// Inserts a lock row, failing with a duplicate key if the lock is held.
    pub fn insert_lock(&self, name: &str, owner: &str, acquired_at: i64) -> Statement {
        let mut b = self.builder();
        b.push("INSERT INTO ")
            .ident(LOCK)
            .push(" (")
            .ident("name")
            .push(", ")
            .ident("owner")
            .push(", ")
            .ident("acquiredAt")
            .push(") VALUES (")
            .bind(name)
            .push(", ")
            .bind(owner)
            .push(", ")
            .bind(acquired_at)
            .push(")");
        b.build()
    }

    /// Moves the acquisition time of a lock row held by `owner`.
    pub fn refresh_lock(&self, name: &str, owner: &str, acquired_at: i64) -> Statement {
        let mut b = self.builder();
        b.push("UPDATE ").ident(LOCK).push(" SET ");
        b.ident("acquiredAt").push(" = ").bind(acquired_at);
        b.push(" WHERE ").ident("name").push(" = ").bind(name);
        b.and_eq("owner", owner);
        b.build()
    }

    /// Deletes a lock row held by `owner`.
    pub fn delete_lock(&self, name: &str, owner: &str) -> Statement {
        let mut b = self.builder();
        b.push("DELETE FROM ").ident(LOCK);
        b.push(" WHERE ").ident("name").push(" = ").bind(name);
        b.and_eq("owner", owner);
        b.build()
    }
}
