use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::plan::{compute_moves, compute_retime, normalize, realign_interstitials};
use crate::{
    Event, EventId, Interstitial, InterstitialId, InterstitialRepository, MoveRequest,
    MoveRequestBody, OrderSpan, Planned, Reply, RequestField, RetimeRequest, RetimeRequestBody,
    Run, RunId, RunRepository, ScheduleEntry, ScheduleError, SchedulePlan, ScheduleState,
    ScheduleStore, ScheduleTx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Orders locked per step when the cascade runs past the loaded window.
    pub suffix_chunk: u32,
    /// Keep orders compact: close holes before resolving a move and after
    /// writing it.
    pub normalize_after_move: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            suffix_chunk: 16,
            normalize_after_move: true,
        }
    }
}

/// Every row a request mutated, in final state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MoveOutcome {
    pub runs: Vec<Run>,
    pub interstitials: Vec<Interstitial>,
}

impl MoveOutcome {
    pub fn new(runs: Vec<Run>, interstitials: Vec<Interstitial>) -> Self {
        let mut outcome = Self {
            runs,
            interstitials,
        };
        outcome.sort();
        outcome
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.interstitials.is_empty()
    }

    pub fn run(&self, id: RunId) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == id)
    }

    /// Fold in a later pass over the same transaction; later rows win.
    pub fn merge(&mut self, later: MoveOutcome) {
        let mut runs: BTreeMap<RunId, Run> = self.runs.drain(..).map(|r| (r.id, r)).collect();
        runs.extend(later.runs.into_iter().map(|r| (r.id, r)));
        let mut items: BTreeMap<InterstitialId, Interstitial> =
            self.interstitials.drain(..).map(|i| (i.id, i)).collect();
        items.extend(later.interstitials.into_iter().map(|i| (i.id, i)));
        self.runs = runs.into_values().collect();
        self.interstitials = items.into_values().collect();
        self.sort();
    }

    fn sort(&mut self) {
        self.runs.sort_by_key(|r| (r.order.is_none(), r.order, r.id));
        self.interstitials
            .sort_by_key(|i| (i.order.is_none(), i.order, i.suborder, i.id));
    }
}

/// Transactional shell around the planner.
pub struct Scheduler<S> {
    store: S,
    config: SchedulerConfig,
}

impl<S: ScheduleStore> Scheduler<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    pub fn with_config(store: S, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Relocate a run. All rows are locked and written in one transaction;
    /// any error rolls the whole move back.
    pub fn move_run(&self, request: MoveRequest) -> Result<MoveOutcome, ScheduleError> {
        let span = info_span!("move_run", moving = %request.moving, directive = ?request.directive);
        let _enter = span.enter();
        let result = self.try_move(&request);
        if let Err(err) = &result {
            debug!(code = err.code(), "move rejected: {err}");
        }
        result
    }

    fn try_move(&self, request: &MoveRequest) -> Result<MoveOutcome, ScheduleError> {
        let mut tx = self.store.begin()?;

        let (moving, other) = lock_subjects(&mut tx, request)?;
        let event = load_event(&mut tx, moving.event)?;
        let mut outcome = MoveOutcome::default();
        let mut stats = tx.order_stats(event.id)?;
        let (moving, other) = if self.config.normalize_after_move && stats.has_holes() {
            warn!(event = %event.id, "order holes found before move, normalizing");
            outcome = normalize_in(&mut tx, &event)?;
            stats = tx.order_stats(event.id)?;
            lock_subjects(&mut tx, request)?
        } else {
            (moving, other)
        };

        let anchored = tx.lock_by_anchor(&[moving.id])?;
        let mut state = ScheduleState::new(event.clone(), stats, moving)
            .with_other(other)
            .with_anchored(anchored);
        let plan = self.plan(&mut tx, &mut state, |state| {
            compute_moves(state, request, self.config.suffix_chunk)
        })?;

        outcome.merge(apply(&mut tx, plan)?);
        if self.config.normalize_after_move && tx.order_stats(event.id)?.has_holes() {
            warn!(event = %event.id, "order holes found after move, normalizing");
            outcome.merge(normalize_in(&mut tx, &event)?);
        }
        tx.commit()?;
        info!(
            runs = outcome.runs.len(),
            interstitials = outcome.interstitials.len(),
            "move committed"
        );
        Ok(outcome)
    }

    /// Change a run's durations or anchor and cascade the times after it.
    pub fn retime_run(&self, request: RetimeRequest) -> Result<MoveOutcome, ScheduleError> {
        let span = info_span!("retime_run", run = %request.run);
        let _enter = span.enter();

        let mut tx = self.store.begin()?;
        let run = tx
            .lock_by_id(&[request.run])?
            .pop()
            .ok_or(ScheduleError::RunNotFound {
                field: RequestField::Run,
                id: request.run,
            })?;
        let event = load_event(&mut tx, run.event)?;
        let stats = tx.order_stats(event.id)?;
        let mut state = ScheduleState::new(event, stats, run);
        let plan = self.plan(&mut tx, &mut state, |state| {
            compute_retime(state, &request, self.config.suffix_chunk)
        })?;
        let outcome = apply(&mut tx, plan)?;
        tx.commit()?;
        info!(runs = outcome.runs.len(), "retime committed");
        Ok(outcome)
    }

    /// Compact the event's orders to `1..=N` and recompute all times.
    /// A second call in a row changes nothing.
    pub fn normalize_event(&self, event: EventId) -> Result<MoveOutcome, ScheduleError> {
        let span = info_span!("normalize_event", event = %event);
        let _enter = span.enter();

        let mut tx = self.store.begin()?;
        let event = load_event(&mut tx, event)?;
        let outcome = normalize_in(&mut tx, &event)?;
        tx.commit()?;
        if outcome.is_empty() {
            debug!("event already normalized");
        } else {
            info!(runs = outcome.runs.len(), "event normalized");
        }
        Ok(outcome)
    }

    /// Committed timeline of an event with interstitials interleaved.
    pub fn schedule(&self, event: EventId) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(self.store.snapshot(event)?.entries())
    }

    /// Wire entry point for moves.
    pub fn handle_move(&self, body: MoveRequestBody) -> Reply {
        Reply::from_result(body.into_request().and_then(|request| self.move_run(request)))
    }

    /// Wire entry point for retimes.
    pub fn handle_retime(&self, body: RetimeRequestBody) -> Reply {
        Reply::from_result(body.into_request().and_then(|request| self.retime_run(request)))
    }

    /// Plan until the locked rows cover the request. The order stats are
    /// read again once they do: a concurrent move that committed while this
    /// one waited for its rows forces a fresh plan against the new tail.
    fn plan<T: ScheduleTx>(
        &self,
        tx: &mut T,
        state: &mut ScheduleState,
        compute: impl Fn(&ScheduleState) -> Result<Planned, ScheduleError>,
    ) -> Result<SchedulePlan, ScheduleError> {
        loop {
            match compute(state)? {
                Planned::NeedsRows(span) => self.lock_more(tx, state, span)?,
                Planned::Ready(plan) => {
                    let stats = tx.order_stats(state.event.id)?;
                    if stats == state.stats {
                        return Ok(plan);
                    }
                    debug!(?stats, previous = ?state.stats, "order stats moved while locking, replanning");
                    state.stats = stats;
                }
            }
        }
    }

    fn lock_more<T: ScheduleTx>(
        &self,
        tx: &mut T,
        state: &mut ScheduleState,
        span: OrderSpan,
    ) -> Result<(), ScheduleError> {
        let rows = tx.lock_range(state.event.id, span)?;
        debug!(min = span.min, max = ?span.max, rows = rows.len(), "locked order span");
        state.load(span, rows);
        Ok(())
    }
}

/// Lock the moving run and the run its directive references.
fn lock_subjects<T: ScheduleTx>(
    tx: &mut T,
    request: &MoveRequest,
) -> Result<(Run, Option<Run>), ScheduleError> {
    let mut ids = vec![request.moving];
    ids.extend(request.directive.reference());
    let locked = tx.lock_by_id(&ids)?;
    let find = |id: RunId| locked.iter().find(|r| r.id == id).cloned();
    let moving = find(request.moving).ok_or(ScheduleError::RunNotFound {
        field: RequestField::Moving,
        id: request.moving,
    })?;
    let other = match request.directive.reference() {
        Some(id) => Some(find(id).ok_or(ScheduleError::RunNotFound {
            field: request.directive.field(),
            id,
        })?),
        None => None,
    };
    Ok((moving, other))
}

fn load_event<T: ScheduleTx>(tx: &mut T, id: EventId) -> Result<Event, ScheduleError> {
    tx.event(id)?.ok_or(ScheduleError::EventNotFound(id))
}

fn normalize_in<T: ScheduleTx>(tx: &mut T, event: &Event) -> Result<MoveOutcome, ScheduleError> {
    let runs = tx.lock_range(event.id, OrderSpan::starting_at(1))?;
    let plan = normalize(event, runs)?;
    apply(tx, plan)
}

/// Write a plan: detach reordered runs and their interstitials, write final
/// rows, then point the interstitials at their anchors' new orders.
fn apply<T: ScheduleTx>(tx: &mut T, plan: SchedulePlan) -> Result<MoveOutcome, ScheduleError> {
    if plan.is_empty() {
        return Ok(MoveOutcome::default());
    }

    let attached = tx.lock_by_anchor(&plan.reordered)?;
    if !plan.reordered.is_empty() {
        let detached_items: Vec<Interstitial> = attached
            .iter()
            .filter(|i| i.order.is_some())
            .cloned()
            .map(|mut i| {
                i.order = None;
                i
            })
            .collect();
        tx.save_interstitials(&detached_items)?;

        let detached_runs: Vec<Run> = plan
            .runs
            .iter()
            .filter(|r| plan.reordered.contains(&r.id))
            .cloned()
            .map(|mut r| {
                r.order = None;
                r
            })
            .collect();
        debug!(runs = detached_runs.len(), interstitials = detached_items.len(), "detached");
        tx.save_runs(&detached_runs)?;
    }

    tx.save_runs(&plan.runs)?;
    let interstitials = realign_interstitials(&plan.runs, attached);
    tx.save_interstitials(&interstitials)?;
    Ok(MoveOutcome::new(plan.runs, interstitials))
}
