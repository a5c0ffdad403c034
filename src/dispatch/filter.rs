//! Server-side entry filtering.
//!
//! Filters run on new entries before a consumer is selected. A rejected
//! entry is acknowledged on the cursor without ever reaching a consumer; a
//! rescheduled one goes to the replay pool and is retried on a later cycle
//! without being filtered again.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Entry, SubType};

/// Outcome of filtering one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Accept,
    Reject,
    Reschedule,
}

/// What a filter knows about the subscription it runs in.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub subscription: &'a str,
    pub sub_type: SubType,
}

pub trait EntryFilter: Send + Sync {
    fn filter(&self, entry: &Entry, ctx: &FilterContext<'_>) -> FilterResult;
}

impl<F> EntryFilter for F
where
    F: Fn(&Entry, &FilterContext<'_>) -> FilterResult + Send + Sync,
{
    fn filter(&self, entry: &Entry, ctx: &FilterContext<'_>) -> FilterResult {
        self(entry, ctx)
    }
}

/// Running totals of filter outcomes.
#[derive(Debug, Default)]
pub(crate) struct FilterCounters {
    processed: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    rescheduled: AtomicU64,
}

impl FilterCounters {
    pub(crate) fn record(&self, result: FilterResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            FilterResult::Accept => &self.accepted,
            FilterResult::Reject => &self.rejected,
            FilterResult::Reschedule => &self.rescheduled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn rescheduled(&self) -> u64 {
        self.rescheduled.load(Ordering::Relaxed)
    }
}

/// Run `filters` in order; the first non-accept result wins.
pub(crate) fn apply_filters(
    filters: &[std::sync::Arc<dyn EntryFilter>],
    entry: &Entry,
    ctx: &FilterContext<'_>,
) -> FilterResult {
    for filter in filters {
        match filter.filter(entry, ctx) {
            FilterResult::Accept => continue,
            other => return other,
        }
    }
    FilterResult::Accept
}
