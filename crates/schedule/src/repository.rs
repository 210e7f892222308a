use serde::Serialize;

use crate::{Event, EventId, Interstitial, OrderSpan, OrderStats, Run, RunId, ScheduleError};

/// Run rows of one transaction. Every `lock_*` call takes write locks on the
/// rows it returns and holds them until the transaction ends.
pub trait RunRepository {
    fn event(&mut self, id: EventId) -> Result<Option<Event>, ScheduleError>;

    /// Count and maximum of the event's non-null orders.
    fn order_stats(&mut self, event: EventId) -> Result<OrderStats, ScheduleError>;

    /// Lock runs by id. Unknown ids are skipped.
    fn lock_by_id(&mut self, ids: &[RunId]) -> Result<Vec<Run>, ScheduleError>;

    /// Lock the event's ordered runs whose order falls in `span`, sorted by
    /// order.
    fn lock_range(&mut self, event: EventId, span: OrderSpan) -> Result<Vec<Run>, ScheduleError>;

    fn save_runs(&mut self, runs: &[Run]) -> Result<(), ScheduleError>;
}

pub trait InterstitialRepository {
    /// Lock every interstitial anchored to one of `anchors`.
    fn lock_by_anchor(&mut self, anchors: &[RunId]) -> Result<Vec<Interstitial>, ScheduleError>;

    fn save_interstitials(&mut self, items: &[Interstitial]) -> Result<(), ScheduleError>;
}

/// One unit of work. Dropping it without `commit` rolls everything back.
pub trait ScheduleTx: RunRepository + InterstitialRepository + Sized {
    fn commit(self) -> Result<(), ScheduleError>;
}

/// Storage backend the scheduler runs against.
pub trait ScheduleStore {
    type Tx<'a>: ScheduleTx
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Tx<'_>, ScheduleError>;

    /// Committed rows of one event, read without taking locks.
    fn snapshot(&self, event: EventId) -> Result<ScheduleSnapshot, ScheduleError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSnapshot {
    pub event: Event,
    pub runs: Vec<Run>,
    pub interstitials: Vec<Interstitial>,
}

impl ScheduleSnapshot {
    /// Ordered runs, each followed by its interstitials by suborder.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let mut runs: Vec<&Run> = self.runs.iter().filter(|r| r.is_ordered()).collect();
        runs.sort_by_key(|r| r.order);

        let mut entries = Vec::with_capacity(runs.len() + self.interstitials.len());
        for run in runs {
            entries.push(ScheduleEntry::Run(run.clone()));
            let mut attached: Vec<&Interstitial> = self
                .interstitials
                .iter()
                .filter(|i| i.anchor == run.id)
                .collect();
            attached.sort_by_key(|i| i.suborder);
            entries.extend(attached.into_iter().cloned().map(ScheduleEntry::Interstitial));
        }
        entries
    }

    /// Runs that exist but are not on the timeline.
    pub fn unordered(&self) -> impl Iterator<Item = &Run> {
        self.runs.iter().filter(|r| !r.is_ordered())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleEntry {
    Run(Run),
    Interstitial(Interstitial),
}
