use serde::Serialize;

use crate::{
    Interstitial, MoveDirective, MoveRequest, Order, OrderSpan, OrderStats, RequestField, Run,
    ScheduleError,
};

/// Runs in `[min, max]` move by `delta` (always +1 or -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Shift {
    pub min: Order,
    pub max: Order,
    pub delta: i8,
}

impl Shift {
    fn new(min: Order, max: Order, delta: i8) -> Option<Self> {
        (min <= max).then_some(Self { min, max, delta })
    }

    fn up(min: Order, max: Order) -> Option<Self> {
        Self::new(min, max, 1)
    }

    fn down(min: Order, max: Order) -> Option<Self> {
        Self::new(min, max, -1)
    }

    pub fn contains(&self, order: Order) -> bool {
        (self.min..=self.max).contains(&order)
    }

    pub fn apply(&self, order: Order) -> Order {
        if self.delta < 0 {
            order - 1
        } else {
            order + 1
        }
    }

    /// Highest order a shifted run ends up on.
    fn landing_max(&self) -> Order {
        self.apply(self.max)
    }
}

/// Order changes a validated move request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reorder {
    pub from: Option<Order>,
    /// `None` takes the moving run off the timeline.
    pub to: Option<Order>,
    pub shift: Option<Shift>,
}

impl Reorder {
    /// First order, after the move, whose run changed position.
    pub fn cascade_from(&self) -> Order {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from.min(to),
            (None, Some(to)) => to,
            (Some(from), None) => from,
            (None, None) => 1,
        }
    }

    /// Last order, after the move, whose run changed position.
    pub fn upper(&self) -> Order {
        let shifted = self.shift.map_or(0, |s| s.landing_max());
        self.to.unwrap_or(0).max(shifted)
    }

    /// Orders, before the move, that must be locked to plan it: every run
    /// that shifts plus the predecessor of the first changed position.
    pub fn lock_span(&self) -> Option<OrderSpan> {
        let low = self.cascade_from().saturating_sub(1).max(1);
        let high = [self.from, self.to, self.shift.map(|s| s.max)]
            .into_iter()
            .flatten()
            .max()?;
        // unordering the last run leaves only the predecessor to read
        Some(OrderSpan::new(low, high.max(low)))
    }
}

/// Check a move request against the locked rows and resolve it to concrete
/// order changes. Nothing here looks at times.
pub fn resolve(
    request: &MoveRequest,
    moving: &Run,
    other: Option<&Run>,
    stats: OrderStats,
    anchored: &[Interstitial],
) -> Result<Reorder, ScheduleError> {
    let field = request.directive.field();
    let old = moving.order;

    let reorder = match request.directive {
        MoveDirective::Before(id) | MoveDirective::After(id) => {
            let other = referenced(moving, other, id, field)?;
            let Some(target) = other.order else {
                return Err(ScheduleError::UnorderedReference { field, id });
            };
            let before = matches!(request.directive, MoveDirective::Before(_));
            match (old, before) {
                (None, true) => insert(target, stats),
                (None, false) => insert(target + 1, stats),
                (Some(old), true) if old < target => Reorder {
                    from: Some(old),
                    to: Some(target - 1),
                    shift: Shift::down(old + 1, target - 1),
                },
                (Some(old), false) if old < target => Reorder {
                    from: Some(old),
                    to: Some(target),
                    shift: Shift::down(old + 1, target),
                },
                (Some(old), true) => Reorder {
                    from: Some(old),
                    to: Some(target),
                    shift: Shift::up(target, old - 1),
                },
                (Some(old), false) => Reorder {
                    from: Some(old),
                    to: Some(target + 1),
                    shift: Shift::up(target + 1, old - 1),
                },
            }
        }
        MoveDirective::ToOrder(0) => {
            return Err(ScheduleError::invalid(field, "order must be at least 1"));
        }
        MoveDirective::ToOrder(requested) => match old {
            None => insert(requested.min(tail(stats) + 1), stats),
            Some(old) => {
                let target = requested.min(tail(stats).max(1));
                if target < old {
                    Reorder {
                        from: Some(old),
                        to: Some(target),
                        shift: Shift::up(target, old - 1),
                    }
                } else {
                    Reorder {
                        from: Some(old),
                        to: Some(target),
                        shift: Shift::down(old + 1, target),
                    }
                }
            }
        },
        MoveDirective::ToLast => match (old, stats.max) {
            (None, max) => Reorder {
                from: None,
                to: Some(max.unwrap_or(0) + 1),
                shift: None,
            },
            (Some(old), Some(max)) if old < max => Reorder {
                from: Some(old),
                to: Some(max),
                shift: Shift::down(old + 1, max),
            },
            (Some(old), _) => Reorder {
                from: Some(old),
                to: Some(old),
                shift: None,
            },
        },
        MoveDirective::Unorder => {
            let Some(old) = old else {
                return Err(ScheduleError::NoChange { field });
            };
            let dangling: Vec<_> = anchored
                .iter()
                .filter(|i| i.anchor == moving.id)
                .map(|i| i.id)
                .collect();
            if !dangling.is_empty() {
                return Err(ScheduleError::DanglingInterstitial {
                    run: moving.id,
                    interstitials: dangling,
                });
            }
            Reorder {
                from: Some(old),
                to: None,
                shift: stats.max.and_then(|max| Shift::down(old + 1, max)),
            }
        }
    };

    if reorder.from.is_some() && reorder.from == reorder.to {
        return Err(ScheduleError::NoChange { field });
    }
    Ok(reorder)
}

fn referenced<'a>(
    moving: &Run,
    other: Option<&'a Run>,
    id: crate::RunId,
    field: RequestField,
) -> Result<&'a Run, ScheduleError> {
    if id == moving.id {
        return Err(ScheduleError::NoChange { field });
    }
    let other = other
        .filter(|run| run.id == id)
        .ok_or(ScheduleError::RunNotFound { field, id })?;
    if other.event != moving.event {
        return Err(ScheduleError::CrossEvent {
            field,
            other: other.id,
            event: moving.event,
            other_event: other.event,
        });
    }
    Ok(other)
}

/// Highest order a run can be placed on. Past a hole this is the maximum
/// order, not the count.
fn tail(stats: OrderStats) -> Order {
    stats.max.unwrap_or(0).max(stats.count)
}

/// An unordered run entering the timeline at `target`.
fn insert(target: Order, stats: OrderStats) -> Reorder {
    Reorder {
        from: None,
        to: Some(target),
        shift: stats.max.and_then(|max| Shift::up(target, max)),
    }
}
