//! Freshness predicates deciding whether a cached record may be shown before
//! the network refresh completes.

use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};

use crate::record::Record;

/// Pure decision over a cached record.
pub trait FreshnessPredicate<T>: Send + Sync {
    /// Returns true when `record` is recent enough to display without waiting
    /// for the network.
    fn is_fresh(&self, record: &Record<T>) -> bool;
}

impl<T, F> FreshnessPredicate<T> for F
where
    F: Fn(&Record<T>) -> bool + Send + Sync,
{
    fn is_fresh(&self, record: &Record<T>) -> bool {
        self(record)
    }
}

/// Fresh when the record was updated on the current calendar day in `offset`.
#[derive(Debug, Clone, Copy)]
pub struct UpdatedToday {
    pub offset: UtcOffset,
}

impl UpdatedToday {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Evaluates the predicate against an explicit "now".
    pub fn is_fresh_at<T>(&self, record: &Record<T>, now: OffsetDateTime) -> bool {
        match record.last_updated_at {
            Some(updated) => {
                updated.to_offset(self.offset).date() == now.to_offset(self.offset).date()
            }
            None => false,
        }
    }
}

impl Default for UpdatedToday {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl<T> FreshnessPredicate<T> for UpdatedToday {
    fn is_fresh(&self, record: &Record<T>) -> bool {
        self.is_fresh_at(record, OffsetDateTime::now_utc())
    }
}

/// Fresh when the record was updated no longer than `max_age` ago.
#[derive(Debug, Clone, Copy)]
pub struct UpdatedWithin(pub Duration);

impl UpdatedWithin {
    pub fn is_fresh_at<T>(&self, record: &Record<T>, now: OffsetDateTime) -> bool {
        let Some(updated) = record.last_updated_at else {
            return false;
        };
        let age = now - updated;
        // Timestamps from the future (clock skew) count as fresh.
        age.is_negative() || age <= self.0
    }
}

impl<T> FreshnessPredicate<T> for UpdatedWithin {
    fn is_fresh(&self, record: &Record<T>) -> bool {
        self.is_fresh_at(record, OffsetDateTime::now_utc())
    }
}

/// Every cached record is shown.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFresh;

impl<T> FreshnessPredicate<T> for AlwaysFresh {
    fn is_fresh(&self, _record: &Record<T>) -> bool {
        true
    }
}

/// Cached records are never shown; callers always wait for the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFresh;

impl<T> FreshnessPredicate<T> for NeverFresh {
    fn is_fresh(&self, _record: &Record<T>) -> bool {
        false
    }
}
