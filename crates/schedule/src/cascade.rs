use chrono::{DateTime, Utc};

use crate::{Run, ScheduleError};

/// Outcome of pushing one run through a [`Cascade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The run's start or end moved.
    Changed,
    /// The run kept its stored start and end.
    Settled,
}

/// Worklist form of the time cascade.
///
/// Runs are pushed in timeline order. Each push fixes the run's start and end
/// from its predecessor, or from its own anchor, in which case the
/// predecessor's setup time is solved instead. A run is only emitted once
/// its successor has been seen, because an anchored successor can still
/// rewrite its setup time.
#[derive(Debug)]
pub struct Cascade {
    event_start: DateTime<Utc>,
    prev: Option<Pending>,
    changed: Vec<Run>,
}

#[derive(Debug)]
struct Pending {
    run: Run,
    dirty: bool,
}

impl Cascade {
    pub fn new(event_start: DateTime<Utc>) -> Self {
        Self {
            event_start,
            prev: None,
            changed: Vec::new(),
        }
    }

    /// Continue after an untouched predecessor. The predecessor is only
    /// emitted if an anchored successor solves a new setup time for it.
    pub fn after(event_start: DateTime<Utc>, predecessor: Run) -> Self {
        Self {
            event_start,
            prev: Some(Pending {
                run: predecessor,
                dirty: false,
            }),
            changed: Vec::new(),
        }
    }

    pub fn push(&mut self, mut run: Run) -> Result<Step, ScheduleError> {
        let start = match (run.anchor_time, self.prev.as_mut()) {
            (Some(anchor), Some(prev)) => {
                solve_setup(prev, &run, anchor)?;
                anchor
            }
            (Some(anchor), None) => anchor,
            (None, Some(prev)) => end_of(&prev.run).unwrap_or(self.event_start),
            (None, None) => self.event_start,
        };
        let end = start + run.total();

        let step = if run.start_time == Some(start) && run.end_time == Some(end) {
            Step::Settled
        } else {
            Step::Changed
        };
        run.start_time = Some(start);
        run.end_time = Some(end);

        if let Some(prev) = self.prev.take() {
            if prev.dirty {
                self.changed.push(prev.run);
            }
        }
        self.prev = Some(Pending {
            run,
            dirty: step == Step::Changed,
        });
        Ok(step)
    }

    /// Runs whose times changed, in the order they were pushed.
    pub fn finish(mut self) -> Vec<Run> {
        if let Some(prev) = self.prev.take() {
            if prev.dirty {
                self.changed.push(prev.run);
            }
        }
        self.changed
    }
}

fn solve_setup(prev: &mut Pending, anchored: &Run, anchor: DateTime<Utc>) -> Result<(), ScheduleError> {
    let Some(prev_start) = prev.run.start_time else {
        return Ok(());
    };
    let setup_time = (anchor - prev_start).num_milliseconds() - prev.run.run_time;
    if setup_time < 0 {
        return Err(ScheduleError::AnchorConflict {
            run: prev.run.id,
            anchored: anchored.id,
            setup_time,
        });
    }
    if prev.run.setup_time != setup_time || prev.run.end_time != Some(anchor) {
        prev.run.setup_time = setup_time;
        prev.run.end_time = Some(anchor);
        prev.dirty = true;
    }
    Ok(())
}

/// Stored end time, or the one implied by start plus durations.
pub(crate) fn end_of(run: &Run) -> Option<DateTime<Utc>> {
    run.end_time.or_else(|| run.start_time.map(|start| start + run.total()))
}

/// Recompute every run from the event start with no early stop.
pub fn recalculate(
    event_start: DateTime<Utc>,
    runs: impl IntoIterator<Item = Run>,
) -> Result<Vec<Run>, ScheduleError> {
    let mut cascade = Cascade::new(event_start);
    for run in runs {
        cascade.push(run)?;
    }
    Ok(cascade.finish())
}
