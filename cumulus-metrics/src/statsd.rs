use cumulus_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics of the metric store.
pub enum MetricCounters {
    /// Incremented for every row written by an increment.
    ///
    /// This metric is tagged with:
    ///  - `path`: `fast`, `append`, `update`, `late` or `absolute`.
    Write,
    /// Incremented when an append lost the race against a concurrent writer and fell back to the
    /// in-place update.
    InsertRace,
    /// Incremented for every corrupted row detected by a write.
    ///
    /// This metric is tagged with:
    ///  - `outcome`: `repaired` or `failed`.
    Corrupted,
    /// Incremented for every read answered from the subject cache.
    CacheHit,
    /// Incremented for every read that had to query the database.
    CacheMiss,
    /// Incremented for every newly created dimension.
    DimensionCreated,
    /// Incremented for every newly interned counter name.
    SymbolCreated,
    /// Number of rows merged away by resummarization.
    RowsCollapsed,
    /// Number of rows rewritten by reconstruction.
    RowsFixed,
    /// Number of keys handed to pipeline workers.
    PipelineKeys,
    /// Number of merged increments written by the increment queue.
    ///
    /// This metric is tagged with:
    ///  - `outcome`: `success` or `failure`.
    IncrementsFlushed,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::Write => "metrics.write",
            Self::InsertRace => "metrics.write.insert_race",
            Self::Corrupted => "metrics.write.corrupted",
            Self::CacheHit => "metrics.cache.hit",
            Self::CacheMiss => "metrics.cache.miss",
            Self::DimensionCreated => "metrics.dimension.created",
            Self::SymbolCreated => "metrics.symbol.created",
            Self::RowsCollapsed => "metrics.resummarize.collapsed",
            Self::RowsFixed => "metrics.reconstruct.fixed",
            Self::PipelineKeys => "metrics.pipeline.keys",
            Self::IncrementsFlushed => "metrics.increment_queue.flushed",
        }
    }
}

/// Timer metrics of the metric store.
pub enum MetricTimers {
    /// Time spent writing an increment including the aggregate dimension.
    Increment,
    /// Time spent answering a read.
    ///
    /// This metric is tagged with:
    ///  - `operation`: the read operation.
    Read,
    /// Time spent resummarizing one key.
    Resummarize,
    /// Time spent reconstructing one counter of one subject.
    Reconstruct,
    /// Total time of a counter-wide resummarization run.
    ///
    /// This metric is tagged with:
    ///  - `state`: the final job state.
    Pipeline,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::Increment => "metrics.increment.duration",
            Self::Read => "metrics.read.duration",
            Self::Resummarize => "metrics.resummarize.duration",
            Self::Reconstruct => "metrics.reconstruct.duration",
            Self::Pipeline => "metrics.pipeline.duration",
        }
    }
}

/// Gauge metrics of the metric store.
pub enum MetricGauges {
    /// Number of merged increments waiting to be flushed.
    IncrementQueueSize,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::IncrementQueueSize => "metrics.increment_queue.size",
        }
    }
}
