//! End-to-end lifecycle tests: scope ownership, cancellation delivery,
//! failure propagation and result semantics, driven through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use weft::{
    await_all, run_once, sleep, value, with_context, CancelCause, CancelKind, Deferred,
    DispatcherHandle, Failure, FailurePolicy, JobHandle, JobState, PoolDispatcher, Runtime,
    SerialDispatcher, StageOut, Stages, StepInput, TaskContext, TaskError, WaitTarget,
};

fn pool(name: &str, workers: usize) -> DispatcherHandle {
    Arc::new(PoolDispatcher::new(name, workers, 4096))
}

/// Spin until `cond` holds or the deadline passes.
fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn resumed_of(input: StepInput) -> weft::continuation::Resumed {
    match input {
        StepInput::Resume(resumed) => resumed,
        _ => panic!("expected a resumed input"),
    }
}

#[test]
fn close_waits_for_every_cleanup() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("close", 4), FailurePolicy::FailFast, TaskContext::new());

    let cleaned = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..5 {
        let cleaned = cleaned.clone();
        let body = Stages::new()
            .then(move |_cx, _input| StageOut::Suspend(sleep(Duration::from_secs(30))))
            .on_cancel(move |_cx| {
                // Deliberately slow teardown; close must still wait for it.
                thread::sleep(Duration::from_millis(20));
                cleaned.fetch_add(1, Ordering::SeqCst);
            });
        handles.push(
            scope
                .launch(TaskContext::new().named(format!("sleeper-{i}")), body)
                .unwrap(),
        );
    }

    // Let them reach their suspension points.
    assert!(wait_for(
        || handles.iter().all(|h| h.state() == JobState::Active),
        Duration::from_secs(5),
    ));

    let state = scope.close().wait();
    assert_eq!(state, JobState::Cancelled);
    assert_eq!(cleaned.load(Ordering::SeqCst), 5);
    for h in &handles {
        assert_eq!(h.state(), JobState::Cancelled);
        assert!(h.join().unwrap_err().is_cancelled());
    }

    // A closed scope accepts no work: the handle comes back born cancelled.
    assert!(!scope.is_active());
    let late = scope
        .launch(TaskContext::new(), run_once(|_cx| Ok(value(()))))
        .unwrap();
    assert_eq!(late.state(), JobState::Cancelled);
}

#[test]
fn cancel_reaches_three_levels() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("tree", 4), FailurePolicy::FailFast, TaskContext::new());

    let child_slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
    let grandchild_slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));

    let cslot = child_slot.clone();
    let gslot = grandchild_slot.clone();
    let top = scope
        .launch(
            TaskContext::new().named("top"),
            Stages::new().then(move |cx, _input| {
                let gslot = gslot.clone();
                let child = cx
                    .launch(
                        TaskContext::new().named("child"),
                        Stages::new().then(move |cx, _input| {
                            let grandchild = cx
                                .launch(
                                    TaskContext::new().named("grandchild"),
                                    Stages::new().then(|_cx, _input| {
                                        StageOut::Suspend(sleep(Duration::from_secs(30)))
                                    }),
                                )
                                .unwrap();
                            *gslot.lock() = Some(grandchild);
                            StageOut::Suspend(sleep(Duration::from_secs(30)))
                        }),
                    )
                    .unwrap();
                *cslot.lock() = Some(child);
                StageOut::Suspend(sleep(Duration::from_secs(30)))
            }),
        )
        .unwrap();

    assert!(wait_for(
        || grandchild_slot.lock().is_some(),
        Duration::from_secs(5),
    ));

    top.cancel(CancelCause::new("operator abort"));

    assert!(top.join().unwrap_err().is_cancelled());
    let child = child_slot.lock().clone().unwrap();
    let grandchild = grandchild_slot.lock().clone().unwrap();
    assert!(child.join().unwrap_err().is_cancelled());
    assert!(grandchild.join().unwrap_err().is_cancelled());
    assert_eq!(top.state(), JobState::Cancelled);
    assert_eq!(child.state(), JobState::Cancelled);
    assert_eq!(grandchild.state(), JobState::Cancelled);

    scope.close().wait();
}

#[test]
fn deferred_success_is_read_once_and_failure_re_raises() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(
        pool("deferred", 2),
        FailurePolicy::FailFast,
        TaskContext::new(),
    );

    let ok: Deferred<u32> = scope
        .spawn(TaskContext::new(), run_once(|_cx| Ok(value(17_u32))))
        .unwrap();
    assert_eq!(ok.get().unwrap(), 17);
    assert!(matches!(ok.get(), Err(TaskError::ResultConsumed)));

    let bad: Deferred<u32> = scope
        .spawn(
            TaskContext::new().named("bad"),
            run_once(|_cx| Err(Failure::msg("bad input"))),
        )
        .unwrap();
    for _ in 0..2 {
        match bad.get() {
            Err(TaskError::Failed(f)) => assert_eq!(f.to_string(), "bad input"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    // A spawn failure, even an awaited one, never tears the scope down.
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn await_all_cancels_remaining_members_on_failure() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("all", 4), FailurePolicy::FailFast, TaskContext::new());

    let slot: Arc<Mutex<Vec<JobHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let slot2 = slot.clone();
    let outcome: Deferred<bool> = scope
        .spawn(
            TaskContext::new().named("awaiter"),
            Stages::new()
                .then(move |cx, _input| {
                    let napper = || {
                        Stages::new()
                            .then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_secs(30))))
                    };
                    let one: Deferred<()> =
                        cx.spawn(TaskContext::new().named("one"), napper()).unwrap();
                    let two: Deferred<()> = cx
                        .spawn(
                            TaskContext::new().named("two"),
                            run_once(|_cx| Err(Failure::msg("boom-two"))),
                        )
                        .unwrap();
                    let three: Deferred<()> = cx
                        .spawn(TaskContext::new().named("three"), napper())
                        .unwrap();
                    let members = vec![
                        one.handle().clone(),
                        two.handle().clone(),
                        three.handle().clone(),
                    ];
                    *slot2.lock() = members.clone();
                    StageOut::Suspend(await_all(members))
                })
                .then(|_cx, input| StageOut::Complete(value(resumed_of(input).is_err()))),
        )
        .unwrap();

    // The awaiter resumes with the error instead of hanging on the nappers.
    assert!(outcome.get().unwrap());
    let members = slot.lock().clone();
    assert!(wait_for(
        || {
            members[0].state() == JobState::Cancelled
                && members[2].state() == JobState::Cancelled
        },
        Duration::from_secs(5),
    ));
    assert_eq!(members[1].state(), JobState::Failed);
    // Held-for-await failures never tear the scope down.
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn await_all_collects_in_member_order() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("all2", 4), FailurePolicy::FailFast, TaskContext::new());

    let total: Deferred<u32> = scope
        .spawn(
            TaskContext::new(),
            Stages::new()
                .then(|cx, _input| {
                    let mk = |n: u32| run_once(move |_cx| Ok(value(n)));
                    let members = vec![
                        cx.launch(TaskContext::new(), mk(1)).unwrap(),
                        cx.launch(TaskContext::new(), mk(2)).unwrap(),
                        cx.launch(TaskContext::new(), mk(3)).unwrap(),
                    ];
                    StageOut::Suspend(await_all(members))
                })
                .then(|_cx, input| {
                    let values =
                        weft::continuation::downcast_all::<u32>(resumed_of(input)).unwrap();
                    assert_eq!(values, vec![1, 2, 3]);
                    StageOut::Complete(value(values.iter().sum::<u32>()))
                }),
        )
        .unwrap();

    assert_eq!(total.get().unwrap(), 6);
    scope.close().wait();
}

#[test]
fn in_task_await_resumes_with_the_child_value() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("await", 2), FailurePolicy::FailFast, TaskContext::new());

    let doubled: Deferred<u32> = scope
        .spawn(
            TaskContext::new().named("awaiter"),
            Stages::new()
                .then(|cx, _input| {
                    let d: Deferred<u32> = cx
                        .spawn(
                            TaskContext::new().named("half"),
                            run_once(|_cx| Ok(value(21_u32))),
                        )
                        .unwrap();
                    StageOut::Suspend(d.await_target())
                })
                .then(|_cx, input| {
                    let n =
                        weft::continuation::downcast_resumed::<u32>(resumed_of(input)).unwrap();
                    StageOut::Complete(value(n * 2))
                }),
        )
        .unwrap();

    assert_eq!(doubled.get().unwrap(), 42);
    scope.close().wait();
}

#[test]
fn cancelling_an_awaiter_does_not_wait_for_the_awaited_job() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(
        pool("awcancel", 2),
        FailurePolicy::FailFast,
        TaskContext::new(),
    );

    let napper_slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
    let slot2 = napper_slot.clone();
    let awaiter = scope
        .launch(
            TaskContext::new().named("awaiter"),
            Stages::new()
                .then(move |cx, _input| {
                    let d: Deferred<()> = cx
                        .spawn(
                            TaskContext::new().named("napper"),
                            Stages::new().then(|_cx, _input| {
                                StageOut::Suspend(sleep(Duration::from_secs(30)))
                            }),
                        )
                        .unwrap();
                    *slot2.lock() = Some(d.handle().clone());
                    StageOut::Suspend(d.await_target())
                })
                .then(|_cx, _input| StageOut::Complete(value(()))),
        )
        .unwrap();

    assert!(wait_for(
        || napper_slot.lock().is_some(),
        Duration::from_secs(5)
    ));
    let napper = napper_slot.lock().clone().unwrap();

    // Cancelling the awaiter wins over the pending await; neither job
    // sits out the napper's 30s sleep.
    let started = Instant::now();
    awaiter.cancel(CancelCause::new("caller gave up"));
    assert!(awaiter.join().unwrap_err().is_cancelled());
    assert!(napper.join().unwrap_err().is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(awaiter.state(), JobState::Cancelled);
    assert_eq!(napper.state(), JobState::Cancelled);
    scope.close().wait();
}

#[test]
fn thousand_tasks_on_a_small_pool() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("load", 4), FailurePolicy::FailFast, TaskContext::new());

    let done = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let done = done.clone();
        handles.push(
            scope
                .launch(
                    TaskContext::new(),
                    run_once(move |_cx| {
                        done.fetch_add(1, Ordering::Relaxed);
                        Ok(value(()))
                    }),
                )
                .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(done.load(Ordering::Relaxed), 1000);
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn launch_failure_cancels_siblings_and_hits_one_handler() {
    let runtime = Runtime::new();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen2 = seen.clone();
    let handler: weft::FailureHandler = Arc::new(move |name: &str, failure: &Failure| {
        seen2.lock().push(format!("{name}: {failure}"));
    });

    let scope = runtime.open_scope(
        pool("failfast", 4),
        FailurePolicy::FailFast,
        TaskContext::new()
            .named("app")
            .with_failure_handler(handler),
    );

    let sibling = scope
        .launch(
            TaskContext::new().named("sibling"),
            Stages::new().then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_secs(30)))),
        )
        .unwrap();
    assert!(wait_for(
        || sibling.state() == JobState::Active,
        Duration::from_secs(5),
    ));

    scope
        .launch(
            TaskContext::new().named("doomed"),
            run_once(|_cx| Err(Failure::msg("fatal"))),
        )
        .unwrap();

    // The failure brings the whole scope down on its own.
    assert!(wait_for(
        || sibling.state() == JobState::Cancelled,
        Duration::from_secs(5),
    ));
    assert!(sibling.join().unwrap_err().is_cancelled());

    let state = scope.close().wait();
    assert_eq!(state, JobState::Failed);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("doomed:"));
    assert!(seen[0].contains("fatal"));
}

#[test]
fn isolate_policy_contains_failures() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(
        pool("isolate", 2),
        FailurePolicy::Isolate,
        TaskContext::new().with_failure_handler(Arc::new(|_: &str, _: &Failure| {})),
    );

    let doomed = scope
        .launch(
            TaskContext::new().named("doomed"),
            run_once(|_cx| Err(Failure::msg("contained"))),
        )
        .unwrap();
    assert!(doomed.join().is_err());

    // Siblings keep running and the scope stays open.
    let after: Deferred<u32> = scope
        .spawn(TaskContext::new(), run_once(|_cx| Ok(value(9_u32))))
        .unwrap();
    assert_eq!(after.get().unwrap(), 9);
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn unawaited_spawn_failure_reaches_no_handler() {
    let runtime = Runtime::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let scope = runtime.open_scope(
        pool("quiet", 2),
        FailurePolicy::FailFast,
        TaskContext::new().with_failure_handler(Arc::new(move |_: &str, _: &Failure| {
            hits2.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let quiet: Deferred<u32> = scope
        .spawn(
            TaskContext::new().named("quiet"),
            run_once(|_cx| Err(Failure::msg("nobody listens"))),
        )
        .unwrap();
    assert!(wait_for(
        || quiet.state() == JobState::Failed,
        Duration::from_secs(5),
    ));

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn dispatcher_switch_runs_inner_body_elsewhere() {
    let runtime = Runtime::new();
    let outer = pool("outer", 2);
    let inner: DispatcherHandle = Arc::new(SerialDispatcher::new("inner"));
    let scope = runtime.open_scope(outer, FailurePolicy::FailFast, TaskContext::new());

    let inner2 = inner.clone();
    let names: Deferred<(String, String)> = scope
        .spawn(
            TaskContext::new().named("switcher"),
            Stages::new()
                .then(move |_cx, _input| {
                    StageOut::Suspend(with_context(
                        inner2.clone(),
                        run_once(|_cx| {
                            let name = thread::current().name().unwrap_or("").to_string();
                            Ok(value(name))
                        }),
                    ))
                })
                .then(|_cx, input| {
                    let inner_thread =
                        weft::continuation::downcast_resumed::<String>(resumed_of(input)).unwrap();
                    let outer_thread = thread::current().name().unwrap_or("").to_string();
                    StageOut::Complete(value((inner_thread, outer_thread)))
                }),
        )
        .unwrap();

    let (inner_thread, outer_thread) = names.get().unwrap();
    assert!(inner_thread.starts_with("inner-worker"));
    assert!(outer_thread.starts_with("outer-worker"));
    scope.close().wait();
}

#[test]
fn sleep_suspends_without_holding_a_thread() {
    let runtime = Runtime::new();
    // One worker: if sleep parked the thread, the two sleeps could not
    // overlap and the total would be ~2x.
    let single = pool("single", 1);
    let scope = runtime.open_scope(single, FailurePolicy::FailFast, TaskContext::new());

    let started = Instant::now();
    let mk = || {
        Stages::new()
            .then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_millis(80))))
            .then(|_cx, _input| StageOut::Complete(value(())))
    };
    let a = scope.launch(TaskContext::new(), mk()).unwrap();
    let b = scope.launch(TaskContext::new(), mk()).unwrap();
    a.join().unwrap();
    b.join().unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80));
    assert!(
        elapsed < Duration::from_millis(400),
        "sleeps did not overlap: {elapsed:?}"
    );
    scope.close().wait();
}

#[test]
fn timeout_race_cancels_the_loser() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(
        pool("deadline", 2),
        FailurePolicy::FailFast,
        TaskContext::new(),
    );

    let slow = scope
        .launch(
            TaskContext::new().named("slow"),
            Stages::new()
                .then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_secs(30))))
                .then(|_cx, _input| StageOut::Complete(value(()))),
        )
        .unwrap();

    // Deadline watchdog: sleep out the budget, then cancel the racer.
    let watched = slow.clone();
    let watchdog = scope
        .launch(
            TaskContext::new().named("watchdog"),
            Stages::new()
                .then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_millis(30))))
                .then(move |_cx, _input| {
                    watched.cancel(CancelCause::timeout());
                    StageOut::Complete(value(()))
                }),
        )
        .unwrap();

    match slow.join().unwrap_err() {
        TaskError::Cancelled(cause) => assert_eq!(cause.kind(), CancelKind::Timeout),
        other => panic!("expected a timeout cancellation, got {other:?}"),
    }
    watchdog.join().unwrap();
    // A cancellation is an expected outcome; the scope stays open.
    assert!(scope.is_active());
    scope.close().wait();
}

#[test]
fn external_source_resumes_with_its_value() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("ext", 2), FailurePolicy::FailFast, TaskContext::new());

    let answer: Deferred<u32> = scope
        .spawn(
            TaskContext::new().named("bridge"),
            Stages::new()
                .then(|_cx, _input| {
                    StageOut::Suspend(WaitTarget::External(Box::new(|source| {
                        thread::spawn(move || {
                            thread::sleep(Duration::from_millis(20));
                            source.complete(Ok(value(41_u32)));
                        });
                    })))
                })
                .then(|_cx, input| {
                    let n =
                        weft::continuation::downcast_resumed::<u32>(resumed_of(input)).unwrap();
                    StageOut::Complete(value(n + 1))
                }),
        )
        .unwrap();

    assert_eq!(answer.get().unwrap(), 42);
    scope.close().wait();
}

#[test]
fn late_external_completion_is_ignored_after_cancel() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("late", 2), FailurePolicy::FailFast, TaskContext::new());

    let source_slot: Arc<Mutex<Option<weft::SourceHandle>>> = Arc::new(Mutex::new(None));
    let slot2 = source_slot.clone();
    let job = scope
        .launch(
            TaskContext::new().named("waiting"),
            Stages::new().then(move |_cx, _input| {
                let slot = slot2.clone();
                StageOut::Suspend(WaitTarget::External(Box::new(move |source| {
                    *slot.lock() = Some(source);
                })))
            }),
        )
        .unwrap();

    assert!(wait_for(
        || source_slot.lock().is_some(),
        Duration::from_secs(5)
    ));
    job.cancel(CancelCause::new("no longer needed"));
    assert!(job.join().unwrap_err().is_cancelled());

    // The straggler fires after cancellation; the job stays cancelled.
    let source = source_slot.lock().take().unwrap();
    source.complete(Ok(value(1_u32)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(job.state(), JobState::Cancelled);
    scope.close().wait();
}

#[test]
fn panicking_body_becomes_a_failure() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(
        pool("panic", 2),
        FailurePolicy::Isolate,
        TaskContext::new().with_failure_handler(Arc::new(|_: &str, _: &Failure| {})),
    );

    let d: Deferred<u32> = scope
        .spawn(
            TaskContext::new().named("panics"),
            run_once(|_cx| -> Result<_, Failure> { panic!("oh no") }),
        )
        .unwrap();
    match d.get() {
        Err(TaskError::Failed(f)) => assert!(f.to_string().contains("oh no")),
        other => panic!("expected failure, got {other:?}"),
    }
    scope.close().wait();
}

#[test]
fn completing_parent_waits_for_children() {
    let runtime = Runtime::new();
    let scope = runtime.open_scope(pool("compl", 4), FailurePolicy::FailFast, TaskContext::new());

    let child_done = Arc::new(AtomicUsize::new(0));
    let cd = child_done.clone();
    let parent = scope
        .launch(
            TaskContext::new().named("parent"),
            run_once(move |cx| {
                let cd = cd.clone();
                cx.launch(
                    TaskContext::new().named("slow-child"),
                    Stages::new()
                        .then(|_cx, _input| StageOut::Suspend(sleep(Duration::from_millis(60))))
                        .then(move |_cx, _input| {
                            cd.fetch_add(1, Ordering::SeqCst);
                            StageOut::Complete(value(()))
                        }),
                )
                .unwrap();
                // The body returns immediately; the job must not.
                Ok(value(()))
            }),
        )
        .unwrap();

    parent.join().unwrap();
    // Join settled only after the child ran to completion.
    assert_eq!(child_done.load(Ordering::SeqCst), 1);
    assert_eq!(parent.state(), JobState::Completed);
    scope.close().wait();
}
