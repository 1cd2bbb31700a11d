//! Opportunistic read cache keyed by subject.

use std::fmt;
use std::num::NonZeroUsize;

use hashbrown::HashMap;
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::MetricData;

/// Which end of a range a cached payload belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extremum {
    /// The oldest row at or after the boundary.
    Min,
    /// The newest row at or before the boundary.
    Max,
}

/// Identifies one cached read of a subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The counter.
    pub symbol_id: i64,
    /// The dimension.
    pub dimension_id: Uuid,
    /// The range boundary in milliseconds, truncated to the minute. `None` for unbounded reads.
    pub boundary: Option<i64>,
    /// The end of the range.
    pub extremum: Extremum,
}

/// A cached read result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachedData {
    /// The database had no row for the read.
    Empty,
    /// The row returned by the read.
    Data(MetricData),
}

impl CachedData {
    /// Returns the cached payload, if any.
    pub fn data(self) -> Option<MetricData> {
        match self {
            Self::Empty => None,
            Self::Data(data) => Some(data),
        }
    }
}

impl From<Option<MetricData>> for CachedData {
    fn from(value: Option<MetricData>) -> Self {
        match value {
            Some(data) => Self::Data(data),
            None => Self::Empty,
        }
    }
}

/// A cache of read results, invalidated per subject on every write.
pub trait SubjectCache: fmt::Debug + Send + Sync {
    /// Returns a cached read result.
    fn get(&self, subject_id: Uuid, key: &CacheKey) -> Option<CachedData>;

    /// Stores a read result.
    fn put(&self, subject_id: Uuid, key: CacheKey, data: CachedData);

    /// Drops all cached results of a subject.
    fn invalidate(&self, subject_id: Uuid);
}

/// An in-memory [`SubjectCache`] evicting the least recently used subjects.
pub struct MemoryCache {
    subjects: Mutex<LruCache<Uuid, HashMap<CacheKey, CachedData>>>,
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` subjects.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            subjects: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("subjects", &self.subjects.lock().len())
            .finish()
    }
}

impl SubjectCache for MemoryCache {
    fn get(&self, subject_id: Uuid, key: &CacheKey) -> Option<CachedData> {
        self.subjects.lock().get(&subject_id)?.get(key).copied()
    }

    fn put(&self, subject_id: Uuid, key: CacheKey, data: CachedData) {
        self.subjects
            .lock()
            .get_or_insert_mut(subject_id, HashMap::new)
            .insert(key, data);
    }

    fn invalidate(&self, subject_id: Uuid) {
        self.subjects.lock().pop(&subject_id);
    }
}

/// A [`SubjectCache`] that never holds anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

impl SubjectCache for NoopCache {
    fn get(&self, _subject_id: Uuid, _key: &CacheKey) -> Option<CachedData> {
        None
    }

    fn put(&self, _subject_id: Uuid, _key: CacheKey, _data: CachedData) {}

    fn invalidate(&self, _subject_id: Uuid) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol_id: i64, extremum: Extremum) -> CacheKey {
        CacheKey {
            symbol_id,
            dimension_id: Uuid::nil(),
            boundary: None,
            extremum,
        }
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = MemoryCache::new(NonZeroUsize::new(10).unwrap());
        let subject = Uuid::new_v4();
        let data = MetricData::encode(0, 1.0, 1.0);

        cache.put(subject, key(1, Extremum::Max), CachedData::Data(data));
        cache.put(subject, key(2, Extremum::Max), CachedData::Empty);

        assert_eq!(cache.get(subject, &key(1, Extremum::Max)), Some(CachedData::Data(data)));
        assert_eq!(cache.get(subject, &key(2, Extremum::Max)), Some(CachedData::Empty));
        assert_eq!(cache.get(subject, &key(1, Extremum::Min)), None);

        cache.invalidate(subject);
        assert_eq!(cache.get(subject, &key(1, Extremum::Max)), None);
    }

    #[test]
    fn test_evicts_least_recent_subject() {
        let cache = MemoryCache::new(NonZeroUsize::new(2).unwrap());
        let subjects = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        for subject in subjects {
            cache.put(subject, key(1, Extremum::Max), CachedData::Empty);
        }

        assert_eq!(cache.get(subjects[0], &key(1, Extremum::Max)), None);
        assert!(cache.get(subjects[2], &key(1, Extremum::Max)).is_some());
    }
}
