//! In-process store with real row locks.
//!
//! Each transaction stages its writes privately and only publishes them on
//! commit. Row locks are taken all-or-nothing per call and waited on with a
//! deadline, so overlapping transactions serialize while disjoint ones run
//! side by side.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{
    Event, EventId, Interstitial, InterstitialId, InterstitialRepository, OrderSpan, OrderStats,
    Run, RunId, RunRepository, ScheduleError, ScheduleSnapshot, ScheduleStore, ScheduleTx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// How long a transaction waits for contended rows before giving up.
    pub lock_timeout: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Run(RunId),
    Interstitial(InterstitialId),
}

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<EventId, Event>,
    runs: HashMap<RunId, Run>,
    interstitials: HashMap<InterstitialId, Interstitial>,
    locks: HashMap<RowKey, TxId>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    released: Condvar,
    next_tx: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::default(),
            config,
        }
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    pub fn insert_event(&self, event: Event) {
        self.shared.tables.lock().events.insert(event.id, event);
    }

    pub fn insert_run(&self, run: Run) -> Result<(), ScheduleError> {
        let mut tables = self.shared.tables.lock();
        if !tables.events.contains_key(&run.event) {
            return Err(ScheduleError::EventNotFound(run.event));
        }
        let staged = Staged {
            runs: HashMap::from([(run.id, run.clone())]),
            ..Staged::default()
        };
        check_unique(&tables, &staged)?;
        tables.runs.insert(run.id, run);
        Ok(())
    }

    pub fn insert_interstitial(&self, item: Interstitial) -> Result<(), ScheduleError> {
        let mut tables = self.shared.tables.lock();
        match tables.runs.get(&item.anchor) {
            Some(anchor) if anchor.event == item.event => {}
            _ => {
                return Err(ScheduleError::Constraint(format!(
                    "interstitial {} must anchor to a run of event {}",
                    item.id, item.event
                )))
            }
        }
        let staged = Staged {
            interstitials: HashMap::from([(item.id, item.clone())]),
            ..Staged::default()
        };
        check_unique(&tables, &staged)?;
        tables.interstitials.insert(item.id, item);
        Ok(())
    }

    pub fn run(&self, id: RunId) -> Option<Run> {
        self.shared.tables.lock().runs.get(&id).cloned()
    }

    pub fn interstitial(&self, id: InterstitialId) -> Option<Interstitial> {
        self.shared.tables.lock().interstitials.get(&id).cloned()
    }

    /// Committed runs of an event, ordered ones first.
    pub fn runs(&self, event: EventId) -> Vec<Run> {
        let tables = self.shared.tables.lock();
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|r| r.event == event)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.order.is_none(), r.order, r.id));
        runs
    }

    /// Number of row locks currently held by open transactions.
    pub fn held_locks(&self) -> usize {
        self.shared.tables.lock().locks.len()
    }
}

impl ScheduleStore for MemoryStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&self) -> Result<MemoryTx<'_>, ScheduleError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MemoryTx {
            store: self,
            id,
            staged: Staged::default(),
        })
    }

    fn snapshot(&self, event: EventId) -> Result<ScheduleSnapshot, ScheduleError> {
        let tables = self.shared.tables.lock();
        let event = tables
            .events
            .get(&event)
            .cloned()
            .ok_or(ScheduleError::EventNotFound(event))?;
        Ok(ScheduleSnapshot {
            runs: tables
                .runs
                .values()
                .filter(|r| r.event == event.id)
                .cloned()
                .collect(),
            interstitials: tables
                .interstitials
                .values()
                .filter(|i| i.event == event.id)
                .cloned()
                .collect(),
            event,
        })
    }
}

#[derive(Debug, Default)]
struct Staged {
    runs: HashMap<RunId, Run>,
    interstitials: HashMap<InterstitialId, Interstitial>,
}

impl Staged {
    fn run<'a>(&'a self, tables: &'a Tables, id: &RunId) -> Option<&'a Run> {
        self.runs.get(id).or_else(|| tables.runs.get(id))
    }

    fn runs<'a>(&'a self, tables: &'a Tables) -> impl Iterator<Item = &'a Run> {
        tables
            .runs
            .iter()
            .map(move |(id, run)| self.runs.get(id).unwrap_or(run))
    }

    fn interstitials<'a>(&'a self, tables: &'a Tables) -> impl Iterator<Item = &'a Interstitial> {
        tables
            .interstitials
            .iter()
            .map(move |(id, item)| self.interstitials.get(id).unwrap_or(item))
    }
}

/// Uniqueness rules of the schema, checked against committed rows overlaid
/// with `staged`.
fn check_unique(tables: &Tables, staged: &Staged) -> Result<(), ScheduleError> {
    let runs = tables
        .runs
        .iter()
        .filter(|(id, _)| !staged.runs.contains_key(*id))
        .map(|(_, run)| run)
        .chain(staged.runs.values());
    let mut orders = HashSet::new();
    for run in runs {
        if let Some(order) = run.order {
            if !orders.insert((run.event, order)) {
                return Err(ScheduleError::Constraint(format!(
                    "order {order} is already taken in event {}",
                    run.event
                )));
            }
        }
    }

    let items = tables
        .interstitials
        .iter()
        .filter(|(id, _)| !staged.interstitials.contains_key(*id))
        .map(|(_, item)| item)
        .chain(staged.interstitials.values());
    let mut slots = HashSet::new();
    let mut suborders = HashSet::new();
    for item in items {
        if !suborders.insert((item.anchor, item.suborder)) {
            return Err(ScheduleError::Constraint(format!(
                "suborder {} is already taken under run {}",
                item.suborder, item.anchor
            )));
        }
        if let Some(order) = item.order {
            if !slots.insert((item.event, order, item.suborder)) {
                return Err(ScheduleError::Constraint(format!(
                    "interstitial slot {order}.{} is already taken in event {}",
                    item.suborder, item.event
                )));
            }
        }
    }
    Ok(())
}

pub struct MemoryTx<'a> {
    store: &'a MemoryStore,
    id: TxId,
    staged: Staged,
}

impl MemoryTx<'_> {
    /// Lock the rows `select` picks, re-selecting after every wait since the
    /// rows may have changed underneath, then read under the same guard.
    fn with_locks<T>(
        &self,
        select: impl Fn(&Tables, &Staged) -> Vec<RowKey>,
        read: impl FnOnce(&Tables, &Staged) -> T,
    ) -> Result<T, ScheduleError> {
        let shared = &self.store.shared;
        let deadline = Instant::now() + self.store.config.lock_timeout;
        let mut tables = shared.tables.lock();
        loop {
            let keys = select(&tables, &self.staged);
            let contended = keys
                .iter()
                .filter_map(|key| tables.locks.get(key))
                .any(|owner| *owner != self.id);
            if !contended {
                if !keys.is_empty() {
                    tracing::trace!(tx = self.id, rows = keys.len(), "row locks acquired");
                }
                for key in keys {
                    tables.locks.insert(key, self.id);
                }
                return Ok(read(&tables, &self.staged));
            }
            if shared.released.wait_until(&mut tables, deadline).timed_out() {
                tracing::debug!(tx = self.id, "row lock wait timed out");
                return Err(ScheduleError::LockTimeout);
            }
        }
    }

    fn release(&self) {
        let shared = &self.store.shared;
        let mut tables = shared.tables.lock();
        tables.locks.retain(|_, owner| *owner != self.id);
        drop(tables);
        shared.released.notify_all();
    }
}

impl RunRepository for MemoryTx<'_> {
    fn event(&mut self, id: EventId) -> Result<Option<Event>, ScheduleError> {
        Ok(self.store.shared.tables.lock().events.get(&id).cloned())
    }

    fn order_stats(&mut self, event: EventId) -> Result<OrderStats, ScheduleError> {
        let tables = self.store.shared.tables.lock();
        Ok(OrderStats::from_orders(
            self.staged
                .runs(&tables)
                .filter(|r| r.event == event)
                .filter_map(|r| r.order),
        ))
    }

    fn lock_by_id(&mut self, ids: &[RunId]) -> Result<Vec<Run>, ScheduleError> {
        let mut unique: Vec<RunId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        self.with_locks(
            |tables, staged| {
                unique
                    .iter()
                    .filter(|id| staged.run(tables, id).is_some())
                    .map(|id| RowKey::Run(*id))
                    .collect()
            },
            |tables, staged| {
                unique
                    .iter()
                    .filter_map(|id| staged.run(tables, id).cloned())
                    .collect()
            },
        )
    }

    fn lock_range(&mut self, event: EventId, span: OrderSpan) -> Result<Vec<Run>, ScheduleError> {
        let in_span = move |run: &Run| run.event == event && run.order.map_or(false, |o| span.contains(o));
        self.with_locks(
            |tables, staged| {
                staged
                    .runs(tables)
                    .filter(|r| in_span(r))
                    .map(|r| RowKey::Run(r.id))
                    .collect()
            },
            |tables, staged| {
                let mut runs: Vec<Run> = staged.runs(tables).filter(|r| in_span(r)).cloned().collect();
                runs.sort_by_key(|r| r.order);
                runs
            },
        )
    }

    fn save_runs(&mut self, runs: &[Run]) -> Result<(), ScheduleError> {
        if runs.is_empty() {
            return Ok(());
        }
        let ids: Vec<RunId> = runs.iter().map(|r| r.id).collect();
        let missing = self.with_locks(
            |_, _| ids.iter().map(|id| RowKey::Run(*id)).collect(),
            |tables, _| ids.iter().find(|id| !tables.runs.contains_key(*id)).copied(),
        )?;
        if let Some(id) = missing {
            return Err(ScheduleError::Constraint(format!("run {id} does not exist")));
        }

        let mut candidate = Staged {
            runs: self.staged.runs.clone(),
            interstitials: HashMap::new(),
        };
        candidate
            .runs
            .extend(runs.iter().map(|r| (r.id, r.clone())));
        check_unique(&self.store.shared.tables.lock(), &candidate)?;
        self.staged.runs = candidate.runs;
        Ok(())
    }
}

impl InterstitialRepository for MemoryTx<'_> {
    fn lock_by_anchor(&mut self, anchors: &[RunId]) -> Result<Vec<Interstitial>, ScheduleError> {
        if anchors.is_empty() {
            return Ok(Vec::new());
        }
        let anchors: HashSet<RunId> = anchors.iter().copied().collect();
        self.with_locks(
            |tables, staged| {
                staged
                    .interstitials(tables)
                    .filter(|i| anchors.contains(&i.anchor))
                    .map(|i| RowKey::Interstitial(i.id))
                    .collect()
            },
            |tables, staged| {
                let mut items: Vec<Interstitial> = staged
                    .interstitials(tables)
                    .filter(|i| anchors.contains(&i.anchor))
                    .cloned()
                    .collect();
                items.sort_by_key(|i| (i.anchor, i.suborder));
                items
            },
        )
    }

    fn save_interstitials(&mut self, items: &[Interstitial]) -> Result<(), ScheduleError> {
        if items.is_empty() {
            return Ok(());
        }
        let ids: Vec<InterstitialId> = items.iter().map(|i| i.id).collect();
        let missing = self.with_locks(
            |_, _| ids.iter().map(|id| RowKey::Interstitial(*id)).collect(),
            |tables, _| ids.iter().find(|id| !tables.interstitials.contains_key(*id)).copied(),
        )?;
        if let Some(id) = missing {
            return Err(ScheduleError::Constraint(format!(
                "interstitial {id} does not exist"
            )));
        }

        let mut candidate = Staged {
            runs: self.staged.runs.clone(),
            interstitials: self.staged.interstitials.clone(),
        };
        candidate
            .interstitials
            .extend(items.iter().map(|i| (i.id, i.clone())));
        check_unique(&self.store.shared.tables.lock(), &candidate)?;
        self.staged.interstitials = candidate.interstitials;
        Ok(())
    }
}

impl ScheduleTx for MemoryTx<'_> {
    fn commit(mut self) -> Result<(), ScheduleError> {
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.store.shared.tables.lock();
        check_unique(&tables, &staged)?;
        let (runs, items) = (staged.runs.len(), staged.interstitials.len());
        tables.runs.extend(staged.runs);
        tables.interstitials.extend(staged.interstitials);
        drop(tables);
        tracing::trace!(tx = self.id, runs, interstitials = items, "committed");
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
