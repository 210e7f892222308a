//! Pure planning: given locked rows, work out every row a request mutates.
//!
//! Planning never performs I/O. When the rows it was handed do not cover
//! everything a request touches it answers [`Planned::NeedsRows`] and the
//! caller locks that span and plans again.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::cascade::{Cascade, Step};
use crate::{
    resolve, AnchorChange, Event, Interstitial, MoveRequest, Order, OrderSpan, OrderStats,
    RequestField, RetimeRequest, Run, RunId, ScheduleError,
};

/// Rows locked so far for one request.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub event: Event,
    pub stats: OrderStats,
    /// The run being moved or retimed.
    pub subject: Run,
    /// Run referenced by a before/after directive.
    pub other: Option<Run>,
    /// Interstitials anchored to the subject.
    pub anchored: Vec<Interstitial>,
    /// Closed order span whose runs are all in `runs`.
    pub window: Option<OrderSpan>,
    pub runs: BTreeMap<Order, Run>,
}

impl ScheduleState {
    pub fn new(event: Event, stats: OrderStats, subject: Run) -> Self {
        Self {
            event,
            stats,
            subject,
            other: None,
            anchored: Vec::new(),
            window: None,
            runs: BTreeMap::new(),
        }
    }

    pub fn with_other(mut self, other: Option<Run>) -> Self {
        self.other = other;
        self
    }

    pub fn with_anchored(mut self, anchored: Vec<Interstitial>) -> Self {
        self.anchored = anchored;
        self
    }

    /// Add the rows locked for `span`. Spans are requested contiguously, so
    /// the window stays a single closed span.
    pub fn load(&mut self, span: OrderSpan, rows: Vec<Run>) {
        let max = span.max.unwrap_or(span.min);
        self.window = Some(match self.window {
            Some(window) => OrderSpan::new(
                window.min.min(span.min),
                window.max.unwrap_or(window.min).max(max),
            ),
            None => OrderSpan::new(span.min, max),
        });
        for run in rows {
            if let Some(order) = run.order {
                self.runs.insert(order, run);
            }
        }
    }

    pub fn covers(&self, span: OrderSpan) -> bool {
        match (self.window, span.max) {
            (Some(window), Some(max)) => window.contains(span.min) && window.contains(max),
            _ => false,
        }
    }

    fn last_loaded(&self) -> Order {
        self.window.and_then(|w| w.max).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Ready(SchedulePlan),
    NeedsRows(OrderSpan),
}

/// Final state of every run a request mutates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulePlan {
    pub runs: Vec<Run>,
    /// Runs whose order changes. They are detached before any final write
    /// so no two rows ever share an order.
    pub reordered: Vec<RunId>,
}

impl SchedulePlan {
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn assemble(touched: Vec<Run>, cascaded: Vec<Run>, reordered: Vec<RunId>) -> Self {
        let mut by_id: BTreeMap<RunId, Run> = touched.into_iter().map(|r| (r.id, r)).collect();
        for run in cascaded {
            by_id.insert(run.id, run);
        }
        let mut runs: Vec<Run> = by_id.into_values().collect();
        runs.sort_by_key(|r| (r.order.is_none(), r.order, r.id));
        Self { runs, reordered }
    }
}

/// Plan a move against the rows locked so far.
pub fn compute_moves(
    state: &ScheduleState,
    request: &MoveRequest,
    chunk: u32,
) -> Result<Planned, ScheduleError> {
    let reorder = resolve(
        request,
        &state.subject,
        state.other.as_ref(),
        state.stats,
        &state.anchored,
    )?;
    if let Some(span) = reorder.lock_span() {
        if !state.covers(span) {
            return Ok(Planned::NeedsRows(span));
        }
    }

    let mut moved = state.subject.clone();
    match reorder.to {
        Some(to) => moved.order = Some(to),
        None => moved.clear_schedule(),
    }

    let mut reordered = vec![moved.id];
    let mut touched = vec![moved.clone()];
    let mut sequence = BTreeMap::new();
    for run in state.runs.values().filter(|r| r.id != moved.id) {
        let mut run = run.clone();
        if let (Some(order), Some(shift)) = (run.order, reorder.shift) {
            if shift.contains(order) {
                run.order = Some(shift.apply(order));
                reordered.push(run.id);
                touched.push(run.clone());
            }
        }
        if let Some(order) = run.order {
            sequence.insert(order, run);
        }
    }
    if let Some(to) = reorder.to {
        sequence.insert(to, moved);
    }

    match cascade_window(state, &sequence, reorder.cascade_from(), reorder.upper(), chunk)? {
        Cascaded::Done(cascaded) => Ok(Planned::Ready(SchedulePlan::assemble(
            touched, cascaded, reordered,
        ))),
        Cascaded::NeedsRows(span) => Ok(Planned::NeedsRows(span)),
    }
}

/// Plan a change to one run's durations or anchor.
pub fn compute_retime(
    state: &ScheduleState,
    request: &RetimeRequest,
    chunk: u32,
) -> Result<Planned, ScheduleError> {
    let mut run = state.subject.clone();
    if let Some(run_time) = request.run_time {
        if run_time < 0 {
            return Err(ScheduleError::invalid(RequestField::RunTime, "run time must not be negative"));
        }
        run.run_time = run_time;
    }
    if let Some(setup_time) = request.setup_time {
        if setup_time < 0 {
            return Err(ScheduleError::invalid(
                RequestField::SetupTime,
                "setup time must not be negative",
            ));
        }
        run.setup_time = setup_time;
    }
    match request.anchor {
        AnchorChange::Keep => {}
        AnchorChange::Set(_) if run.order.is_none() => {
            return Err(ScheduleError::invalid(
                RequestField::AnchorTime,
                "only runs on the timeline can be anchored",
            ));
        }
        AnchorChange::Set(at) => run.anchor_time = Some(at),
        AnchorChange::Clear => run.anchor_time = None,
    }
    if run == state.subject {
        return Err(ScheduleError::NoChange {
            field: RequestField::Run,
        });
    }

    let Some(order) = run.order else {
        return Ok(Planned::Ready(SchedulePlan::assemble(vec![run], Vec::new(), Vec::new())));
    };
    let span = OrderSpan::new(order.saturating_sub(1).max(1), order);
    if !state.covers(span) {
        return Ok(Planned::NeedsRows(span));
    }

    let mut sequence = state.runs.clone();
    sequence.insert(order, run.clone());
    match cascade_window(state, &sequence, order, order, chunk)? {
        Cascaded::Done(cascaded) => Ok(Planned::Ready(SchedulePlan::assemble(
            vec![run],
            cascaded,
            Vec::new(),
        ))),
        Cascaded::NeedsRows(span) => Ok(Planned::NeedsRows(span)),
    }
}

/// Compact `runs` to orders `1..=N` and recompute every time from the event
/// start. Running it on an already clean event yields an empty plan.
pub fn normalize(event: &Event, mut runs: Vec<Run>) -> Result<SchedulePlan, ScheduleError> {
    runs.retain(|r| r.event == event.id && r.order.is_some());
    runs.sort_by_key(|r| (r.order, r.id));

    let mut reordered = Vec::new();
    let mut touched = Vec::new();
    let mut cascade = Cascade::new(event.start_datetime);
    for (position, mut run) in (1..).zip(runs) {
        if run.order != Some(position) {
            run.order = Some(position);
            reordered.push(run.id);
            touched.push(run.clone());
        }
        cascade.push(run)?;
    }
    Ok(SchedulePlan::assemble(touched, cascade.finish(), reordered))
}

/// Point interstitials at their anchor run's final order. Returns only the
/// ones that changed.
pub fn realign_interstitials(runs: &[Run], interstitials: Vec<Interstitial>) -> Vec<Interstitial> {
    let orders: HashMap<RunId, Option<Order>> = runs.iter().map(|r| (r.id, r.order)).collect();
    interstitials
        .into_iter()
        .filter_map(|mut item| {
            let order = *orders.get(&item.anchor)?;
            if item.order == order {
                return None;
            }
            item.order = order;
            Some(item)
        })
        .collect()
}

enum Cascaded {
    Done(Vec<Run>),
    NeedsRows(OrderSpan),
}

/// Cascade `sequence` (post-move orders) from `from`, stopping at the first
/// settled run at or past `upper`. Asks for more rows when the cascade runs
/// off the loaded window with times still moving.
fn cascade_window(
    state: &ScheduleState,
    sequence: &BTreeMap<Order, Run>,
    from: Order,
    upper: Order,
    chunk: u32,
) -> Result<Cascaded, ScheduleError> {
    let event_start = state.event.start_datetime;
    let seed = sequence
        .range(..from)
        .rev()
        .find(|(_, run)| run.start_time.is_some());

    let (mut cascade, begin) = match seed {
        Some((&order, run)) => (Cascade::after(event_start, run.clone()), order + 1),
        None => match state.window.map(|w| w.min) {
            Some(low) if low > 1 => {
                return Ok(Cascaded::NeedsRows(OrderSpan::new(1, state.last_loaded())));
            }
            _ => (Cascade::new(event_start), 1),
        },
    };

    for (&order, run) in sequence.range(begin..) {
        if cascade.push(run.clone())? == Step::Settled && order >= upper {
            tracing::trace!(order, "cascade settled");
            return Ok(Cascaded::Done(cascade.finish()));
        }
    }

    let last = state.last_loaded();
    if last < state.stats.max.unwrap_or(0) {
        return Ok(Cascaded::NeedsRows(OrderSpan::new(last + 1, last + chunk.max(1))));
    }
    Ok(Cascaded::Done(cascade.finish()))
}
