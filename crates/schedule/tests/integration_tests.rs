//! End-to-end schedule tests against the in-memory store.
use chrono::{DateTime, Duration, TimeZone, Utc};
use schedule::duration::{parse, MS_PER_MINUTE};
use schedule::*;
use std::thread;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 14, 16, 0, 0).unwrap()
}

struct Marathon {
    scheduler: Scheduler<MemoryStore>,
    event: Event,
    /// Runs by their initial order, 1-based at index 0.
    runs: Vec<RunId>,
}

impl Marathon {
    /// `count` runs of 45:00 + 5:00 with consistent times.
    fn new(count: u32) -> Self {
        Self::with(count, SchedulerConfig::default(), MemoryStoreConfig::default(), |_| {})
    }

    fn with(
        count: u32,
        config: SchedulerConfig,
        store_config: MemoryStoreConfig,
        tweak: impl Fn(&mut Vec<Run>),
    ) -> Self {
        let store = MemoryStore::with_config(store_config);
        let event = Event::new("Winter Marathon", t0());
        store.insert_event(event.clone());

        let mut runs: Vec<Run> = (1..=count)
            .map(|order| {
                Run::new(
                    event.id,
                    format!("run {order}"),
                    parse("45:00").unwrap(),
                    parse("5:00").unwrap(),
                )
                .with_order(order)
            })
            .collect();
        tweak(&mut runs);
        let mut ordered: Vec<Run> = runs.iter().filter(|r| r.is_ordered()).cloned().collect();
        ordered.sort_by_key(|r| r.order);
        let mut timed = recalculate(event.start_datetime, ordered).unwrap();
        timed.extend(runs.iter().filter(|r| !r.is_ordered()).cloned());

        let ids = runs.iter().map(|r| r.id).collect();
        for run in timed {
            store.insert_run(run).unwrap();
        }
        Self {
            scheduler: Scheduler::with_config(store, config),
            event,
            runs: ids,
        }
    }

    fn id(&self, initial_order: usize) -> RunId {
        self.runs[initial_order - 1]
    }

    fn run(&self, initial_order: usize) -> Run {
        self.scheduler.store().run(self.id(initial_order)).unwrap()
    }

    fn all(&self) -> Vec<Run> {
        self.scheduler.store().runs(self.event.id)
    }

    fn add_interstitial(&self, initial_order: usize, suborder: u32) -> Interstitial {
        let item = Interstitial::new(
            &self.run(initial_order),
            suborder,
            parse("1:30").unwrap(),
            InterstitialKind::Ad {
                sponsor_name: "Sponsor".into(),
                ad_name: format!("spot {suborder}"),
                ad_type: AdType::Video,
            },
        );
        self.scheduler.store().insert_interstitial(item.clone()).unwrap();
        item
    }

    fn orders(&self) -> Vec<(RunId, Option<Order>)> {
        self.all().into_iter().map(|r| (r.id, r.order)).collect()
    }

    /// Contiguity, chaining and anchor invariants over committed rows.
    fn assert_consistent(&self) {
        let runs: Vec<Run> = self.all().into_iter().filter(|r| r.is_ordered()).collect();
        let orders: Vec<Order> = runs.iter().filter_map(|r| r.order).collect();
        let expected: Vec<Order> = (1..=runs.len() as Order).collect();
        assert_eq!(orders, expected, "orders are not contiguous");

        for run in &runs {
            let start = run.start_time.expect("ordered run without start");
            assert_eq!(run.end_time, Some(start + run.total()), "{} end", run.name);
            assert!(run.setup_time >= 0);
            if let Some(anchor) = run.anchor_time {
                assert_eq!(start, anchor, "{} ignores its anchor", run.name);
            }
        }
        if let Some(first) = runs.first() {
            assert_eq!(
                first.start_time,
                Some(first.anchor_time.unwrap_or(self.event.start_datetime))
            );
        }
        for pair in runs.windows(2) {
            assert_eq!(pair[1].start_time, pair[0].end_time, "{} -> {}", pair[0].name, pair[1].name);
        }
        for run in self.all().iter().filter(|r| !r.is_ordered()) {
            assert_eq!(run.start_time, None);
            assert_eq!(run.end_time, None);
        }
    }
}

#[test]
fn test_scenario_a_move_before_first() {
    let m = Marathon::new(3);
    m.scheduler
        .move_run(MoveRequest::before(m.id(2), m.id(1)))
        .unwrap();

    assert_eq!(m.run(2).order, Some(1));
    assert_eq!(m.run(1).order, Some(2));
    assert_eq!(m.run(3).order, Some(3));
    assert_eq!(m.run(1).start_time, Some(t0() + Duration::minutes(50)));
    assert_eq!(m.run(2).start_time, Some(t0()));
    m.assert_consistent();
}

#[test]
fn test_scenario_b_unordered_run_inserted() {
    // run 3 starts off the timeline, run 4 sits at order 3
    let m = Marathon::with(4, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[2].order = None;
        runs[3].order = Some(3);
    });
    let outcome = m
        .scheduler
        .move_run(MoveRequest::before(m.id(3), m.id(2)))
        .unwrap();

    assert_eq!(m.run(1).order, Some(1));
    assert_eq!(m.run(3).order, Some(2));
    assert_eq!(m.run(2).order, Some(3));
    assert_eq!(m.run(4).order, Some(4));
    assert_eq!(m.run(4).start_time, Some(t0() + Duration::minutes(150)));
    assert_eq!(outcome.runs.len(), 3);
    m.assert_consistent();
}

#[test]
fn test_scenario_c_anchor_conflict_rolls_back() {
    let anchor = t0() + Duration::hours(1);
    let m = Marathon::with(3, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[1].anchor_time = Some(anchor);
    });
    assert_eq!(m.run(1).setup_time, 15 * MS_PER_MINUTE);
    let before = m.all();

    let err = m
        .scheduler
        .move_run(MoveRequest::before(m.id(3), m.id(2)))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::AnchorConflict { .. }), "{err}");
    assert_eq!(err.status(), 400);
    assert_eq!(m.all(), before);
    assert_eq!(m.scheduler.store().held_locks(), 0);
}

#[test]
fn test_moving_across_anchor_solves_setup() {
    let anchor = t0() + Duration::hours(4);
    let m = Marathon::with(6, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[3].anchor_time = Some(anchor);
    });
    assert_eq!(m.run(3).setup_time, 95 * MS_PER_MINUTE);

    m.scheduler
        .move_run(MoveRequest::to_order(m.id(5), 1))
        .unwrap();

    // run 3 still meets the anchored run, with less slack
    assert_eq!(m.run(5).start_time, Some(t0()));
    assert_eq!(m.run(3).order, Some(4));
    assert_eq!(m.run(3).setup_time, 45 * MS_PER_MINUTE);
    assert_eq!(m.run(4).order, Some(5));
    assert_eq!(m.run(4).start_time, Some(anchor));
    m.assert_consistent();

    let err = m
        .scheduler
        .move_run(MoveRequest::before(m.id(6), m.id(1)))
        .unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::AnchorConflict { run, anchored, .. } if run == m.id(3) && anchored == m.id(4)
    ));
    m.assert_consistent();
}

#[test]
fn test_scenario_d_self_reference_is_no_change() {
    let m = Marathon::new(3);
    let before = m.all();
    let err = m
        .scheduler
        .move_run(MoveRequest::before(m.id(1), m.id(1)))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::NoChange { field: RequestField::Before }));
    assert_eq!(m.all(), before);
}

#[test]
fn test_scenario_e_interstitial_follows_anchor() {
    let m = Marathon::new(6);
    let item = m.add_interstitial(2, 1);
    let outcome = m
        .scheduler
        .move_run(MoveRequest::to_order(m.id(2), 5))
        .unwrap();

    let stored = m.scheduler.store().interstitial(item.id).unwrap();
    assert_eq!(stored.order, Some(5));
    assert_eq!(stored.suborder, 1);
    assert_eq!(outcome.interstitials, vec![stored]);
    m.assert_consistent();
}

#[test]
fn test_shifted_runs_carry_their_interstitials() {
    let m = Marathon::new(4);
    let on_three = m.add_interstitial(3, 1);
    let on_four = m.add_interstitial(4, 1);
    m.scheduler
        .move_run(MoveRequest::before(m.id(4), m.id(1)))
        .unwrap();

    let store = m.scheduler.store();
    assert_eq!(store.interstitial(on_three.id).unwrap().order, Some(4));
    assert_eq!(store.interstitial(on_four.id).unwrap().order, Some(1));
}

#[test]
fn test_repeated_move_is_rejected() {
    let m = Marathon::new(5);
    let request = MoveRequest::after(m.id(1), m.id(4));
    m.scheduler.move_run(request).unwrap();
    let snapshot = m.all();

    let err = m.scheduler.move_run(request).unwrap_err();
    assert!(matches!(err, ScheduleError::NoChange { .. }));
    assert_eq!(m.all(), snapshot);
}

#[test]
fn test_every_directive_keeps_invariants() {
    let m = Marathon::new(8);
    let requests = [
        MoveRequest::after(m.id(1), m.id(5)),
        MoveRequest::before(m.id(8), m.id(2)),
        MoveRequest::to_order(m.id(3), 1),
        MoveRequest::to_order(m.id(6), 99),
        MoveRequest::to_last(m.id(2)),
        MoveRequest::unorder(m.id(4)),
        MoveRequest::before(m.id(4), m.id(7)),
        MoveRequest::to_last(m.id(5)),
    ];
    for request in requests {
        m.scheduler.move_run(request).unwrap();
        m.assert_consistent();
    }
    assert_eq!(m.run(6).order, Some(6));
}

#[test]
fn test_unorder_and_reinsert() {
    let m = Marathon::new(4);
    let outcome = m.scheduler.move_run(MoveRequest::unorder(m.id(2))).unwrap();
    let removed = outcome.run(m.id(2)).unwrap();
    assert_eq!(removed.order, None);
    assert_eq!(removed.anchor_time, None);
    assert_eq!(m.run(3).order, Some(2));
    assert_eq!(m.run(3).start_time, Some(t0() + Duration::minutes(50)));
    m.assert_consistent();

    let err = m.scheduler.move_run(MoveRequest::unorder(m.id(2))).unwrap_err();
    assert!(matches!(err, ScheduleError::NoChange { field: RequestField::Unorder }));

    let err = m
        .scheduler
        .move_run(MoveRequest::after(m.id(1), m.id(2)))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::UnorderedReference { .. }));

    m.scheduler.move_run(MoveRequest::to_last(m.id(2))).unwrap();
    assert_eq!(m.run(2).order, Some(4));
    m.assert_consistent();
}

#[test]
fn test_unorder_with_interstitial_is_dangling() {
    let m = Marathon::new(3);
    let item = m.add_interstitial(2, 1);
    let before = m.all();
    let err = m.scheduler.move_run(MoveRequest::unorder(m.id(2))).unwrap_err();
    match err {
        ScheduleError::DanglingInterstitial { run, interstitials } => {
            assert_eq!(run, m.id(2));
            assert_eq!(interstitials, vec![item.id]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(m.all(), before);
}

#[test]
fn test_cross_event_reference_rejected() {
    let m = Marathon::new(2);
    let other_event = Event::new("Summer Marathon", t0());
    m.scheduler.store().insert_event(other_event.clone());
    let stranger = Run::new(other_event.id, "stranger", 0, 0).with_order(1);
    m.scheduler.store().insert_run(stranger.clone()).unwrap();

    let err = m
        .scheduler
        .move_run(MoveRequest::before(m.id(1), stranger.id))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::CrossEvent { field: RequestField::Before, .. }));
    assert_eq!(err.code(), "cross_event");
}

#[test]
fn test_holes_are_closed_after_move() {
    let m = Marathon::with(5, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[2].order = Some(7);
        runs[3].order = Some(9);
        runs[4].order = Some(12);
    });
    let outcome = m
        .scheduler
        .move_run(MoveRequest::before(m.id(5), m.id(1)))
        .unwrap();
    m.assert_consistent();
    assert_eq!(m.run(5).order, Some(1));
    assert_eq!(m.run(4).order, Some(5));
    assert!(outcome.runs.iter().all(|r| r.order <= Some(5)));
}

#[test]
fn test_holes_left_when_normalization_disabled() {
    let config = SchedulerConfig {
        normalize_after_move: false,
        ..SchedulerConfig::default()
    };
    let m = Marathon::with(3, config, MemoryStoreConfig::default(), |runs| {
        runs[2].order = Some(6);
    });
    m.scheduler.move_run(MoveRequest::before(m.id(3), m.id(1))).unwrap();
    let orders: Vec<_> = m.orders().into_iter().map(|(_, o)| o).collect();
    assert_eq!(orders, vec![Some(1), Some(2), Some(3)]);

    let m = Marathon::with(3, config, MemoryStoreConfig::default(), |runs| {
        runs[2].order = Some(6);
    });
    m.scheduler.move_run(MoveRequest::before(m.id(2), m.id(1))).unwrap();
    let orders: Vec<_> = m.orders().into_iter().map(|(_, o)| o).collect();
    assert_eq!(orders, vec![Some(1), Some(2), Some(6)]);

    let repaired = m.scheduler.normalize_event(m.event.id).unwrap();
    assert_eq!(repaired.runs.len(), 1);
    m.assert_consistent();
    assert!(m.scheduler.normalize_event(m.event.id).unwrap().is_empty());
}

#[test]
fn test_retime_cascades_and_respects_anchor() {
    let m = Marathon::new(4);
    let outcome = m
        .scheduler
        .retime_run(RetimeRequest::new(m.id(2)).run_time(55 * MS_PER_MINUTE))
        .unwrap();
    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(m.run(4).start_time, Some(t0() + Duration::minutes(160)));
    m.assert_consistent();

    let anchor = t0() + Duration::minutes(200);
    m.scheduler
        .retime_run(RetimeRequest::new(m.id(4)).anchor(AnchorChange::Set(anchor)))
        .unwrap();
    assert_eq!(m.run(3).setup_time, 45 * MS_PER_MINUTE);
    m.assert_consistent();

    let err = m
        .scheduler
        .retime_run(RetimeRequest::new(m.id(3)).run_time(100 * MS_PER_MINUTE))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::AnchorConflict { .. }));

    m.scheduler
        .retime_run(RetimeRequest::new(m.id(4)).anchor(AnchorChange::Clear))
        .unwrap();
    assert_eq!(m.run(4).anchor_time, None);
    assert_eq!(m.run(4).start_time, Some(anchor));
    m.assert_consistent();
}

#[test]
fn test_wire_bodies_round_through_replies() {
    let m = Marathon::new(3);
    let body: MoveRequestBody = serde_json::from_value(serde_json::json!({
        "moving": m.id(3),
        "order": "last",
    }))
    .unwrap();
    let reply = m.scheduler.handle_move(body);
    assert_eq!(reply.status, 400);
    assert_eq!(reply.body["code"], "no_change");
    assert_eq!(reply.body["field"], "order");

    let body: MoveRequestBody = serde_json::from_value(serde_json::json!({
        "moving": m.id(3),
        "before": m.id(1),
    }))
    .unwrap();
    let reply = m.scheduler.handle_move(body);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["runs"][0]["id"], serde_json::json!(m.id(3)));
    assert_eq!(reply.body["runs"][0]["run_time"], "0:45:00");

    let reply = m.scheduler.handle_retime(RetimeRequestBody {
        run: Some(m.id(1)),
        setup_time: Some("1:00:00".into()),
        ..Default::default()
    });
    assert!(reply.is_success());
    assert_eq!(m.run(1).setup_time, 60 * MS_PER_MINUTE);
}

#[test]
fn test_schedule_view_lists_runs_with_interstitials() {
    let m = Marathon::new(3);
    m.add_interstitial(1, 2);
    m.add_interstitial(1, 1);
    let entries = m.scheduler.schedule(m.event.id).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(matches!(&entries[1], ScheduleEntry::Interstitial(i) if i.suborder == 1));
    assert!(matches!(&entries[3], ScheduleEntry::Run(r) if r.order == Some(2)));

    let err = m.scheduler.schedule(EventId::new()).unwrap_err();
    assert_eq!(err.status(), 404);
}

#[test]
fn test_overlapping_move_waits_then_times_out() {
    let m = Marathon::with(
        6,
        SchedulerConfig::default(),
        MemoryStoreConfig {
            lock_timeout: std::time::Duration::from_millis(50),
        },
        |_| {},
    );
    let store = m.scheduler.store();
    assert_eq!(store.config().lock_timeout, std::time::Duration::from_millis(50));
    let mut holder = store.begin().unwrap();
    holder.lock_range(m.event.id, OrderSpan::new(2, 3)).unwrap();

    let err = m
        .scheduler
        .move_run(MoveRequest::before(m.id(4), m.id(2)))
        .unwrap_err();
    assert!(matches!(err, ScheduleError::LockTimeout));
    assert_eq!(err.status(), 409);

    drop(holder);
    m.scheduler
        .move_run(MoveRequest::before(m.id(4), m.id(2)))
        .unwrap();
    m.assert_consistent();
}

/// Appends the unordered fourth run behind run 3 inside a transaction that
/// holds run 3, while `request` runs on another thread. The append commits
/// once the mover is waiting on run 3.
fn race_append(m: &Marathon, request: MoveRequest) -> Result<MoveOutcome, ScheduleError> {
    let store = m.scheduler.store();
    let mut appender = store.begin().unwrap();
    let tail = appender.lock_range(m.event.id, OrderSpan::new(3, 3)).unwrap();
    let mut loose = appender.lock_by_id(&[m.id(4)]).unwrap().remove(0);
    let start = tail[0].end_time.unwrap();
    loose.order = Some(4);
    loose.start_time = Some(start);
    loose.end_time = Some(start + loose.total());
    appender.save_runs(&[loose]).unwrap();

    thread::scope(|scope| {
        let mover = scope.spawn(move || m.scheduler.move_run(request));
        thread::sleep(std::time::Duration::from_millis(50));
        appender.commit().unwrap();
        mover.join().unwrap()
    })
}

#[test]
fn test_to_last_lands_behind_a_concurrent_append() {
    let m = Marathon::with(4, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[3].order = None;
    });
    race_append(&m, MoveRequest::to_last(m.id(1))).unwrap();

    assert_eq!(m.run(4).order, Some(3));
    assert_eq!(m.run(1).order, Some(4));
    assert_eq!(m.run(1).start_time, Some(t0() + Duration::minutes(150)));
    m.assert_consistent();
}

#[test]
fn test_unorder_recascades_a_concurrent_append() {
    let config = SchedulerConfig {
        normalize_after_move: false,
        ..SchedulerConfig::default()
    };
    let m = Marathon::with(4, config, MemoryStoreConfig::default(), |runs| {
        runs[3].order = None;
    });
    race_append(&m, MoveRequest::unorder(m.id(1))).unwrap();

    assert_eq!(m.run(1).order, None);
    assert_eq!(m.run(4).order, Some(3));
    assert_eq!(m.run(4).start_time, Some(t0() + Duration::minutes(100)));
    m.assert_consistent();
}

#[test]
fn test_to_order_past_a_hole_appends() {
    let m = Marathon::with(4, SchedulerConfig::default(), MemoryStoreConfig::default(), |runs| {
        runs[2].order = Some(5);
        runs[3].order = None;
    });
    m.scheduler
        .move_run(MoveRequest::to_order(m.id(4), 4))
        .unwrap();

    assert_eq!(m.run(3).order, Some(3));
    assert_eq!(m.run(4).order, Some(4));
    assert_eq!(m.run(4).start_time, Some(t0() + Duration::minutes(150)));
    m.assert_consistent();
}

#[test]
fn test_disjoint_moves_run_concurrently() {
    let m = Marathon::with(
        40,
        SchedulerConfig {
            suffix_chunk: 4,
            ..SchedulerConfig::default()
        },
        MemoryStoreConfig {
            lock_timeout: std::time::Duration::from_millis(200),
        },
        |_| {},
    );
    // the middle of the timeline stays locked the whole time
    let mut holder = m.scheduler.store().begin().unwrap();
    holder.lock_range(m.event.id, OrderSpan::new(12, 24)).unwrap();

    thread::scope(|scope| {
        for (a, b) in [(2, 3), (32, 33)] {
            let m = &m;
            scope.spawn(move || {
                for _ in 0..10 {
                    m.scheduler
                        .move_run(MoveRequest::after(m.id(a), m.id(b)))
                        .unwrap();
                    m.scheduler
                        .move_run(MoveRequest::after(m.id(b), m.id(a)))
                        .unwrap();
                }
            });
        }
    });
    drop(holder);
    m.assert_consistent();
}

#[test]
fn test_contended_moves_never_corrupt_the_timeline() {
    let m = Marathon::with(
        12,
        SchedulerConfig {
            suffix_chunk: 3,
            ..SchedulerConfig::default()
        },
        MemoryStoreConfig {
            lock_timeout: std::time::Duration::from_millis(100),
        },
        |runs| {
            for (i, run) in runs.iter_mut().enumerate() {
                run.run_time = (10 + 7 * i as i64) * MS_PER_MINUTE;
            }
        },
    );

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let m = &m;
            scope.spawn(move || {
                let mut seed = worker * 7919 + 17;
                let mut next = |bound: u64| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (seed >> 33) % bound
                };
                for _ in 0..40 {
                    let moving = m.id(next(12) as usize + 1);
                    let other = m.id(next(12) as usize + 1);
                    let request = match next(4) {
                        0 => MoveRequest::before(moving, other),
                        1 => MoveRequest::after(moving, other),
                        2 => MoveRequest::to_order(moving, next(12) as Order + 1),
                        _ => MoveRequest::to_last(moving),
                    };
                    match m.scheduler.move_run(request) {
                        Ok(_)
                        | Err(ScheduleError::NoChange { .. })
                        | Err(ScheduleError::LockTimeout)
                        | Err(ScheduleError::Constraint(_)) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            });
        }
    });
    assert_eq!(m.scheduler.store().held_locks(), 0);
    m.assert_consistent();
}
