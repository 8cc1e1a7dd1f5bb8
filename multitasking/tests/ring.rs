// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// Each test runs its ring on a dedicated OS thread, as a started
// scheduler never hands control back. Thread bodies report to the
// test over a channel, then park the OS thread once they are done.

use multitasking::{Config, Never, Scheduler, ThreadId, ThreadState};
use std::cell::Cell;
use std::hint::black_box;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks the OS thread hosting the ring forever,
/// which stops every thread in the ring.
///
fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

/// Starts a ring on a new OS thread. `build` creates
/// the threads and returns them in ring order. The
/// first thread is started.
///
fn run_ring<F>(config: Config, build: F)
where
    F: FnOnce(&mut Scheduler) -> Vec<ThreadId> + Send + 'static,
{
    thread::spawn(move || {
        let mut scheduler = Scheduler::new(config).unwrap();
        let ring = build(&mut scheduler);
        scheduler.link_ring(&ring).unwrap();
        match scheduler.start(ring[0]) {
            Ok(never) => match never {},
            Err(err) => panic!("failed to start ring: {}", err),
        }
    });
}

/// Runs a ring of `n` threads for `dispatches` thread
/// dispatches, returning the index of the thread that
/// ran on each.
///
fn visits(n: usize, dispatches: usize) -> Vec<usize> {
    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        let budget = Rc::new(Cell::new(dispatches));
        (0..n)
            .map(|i| {
                let tx = tx.clone();
                let budget = budget.clone();
                scheduler
                    .create_thread(move |scheduler| loop {
                        if budget.get() == 0 {
                            park_forever();
                        }

                        budget.set(budget.get() - 1);
                        let _ = tx.send(i);
                        scheduler.tick();
                    })
                    .unwrap()
            })
            .collect()
    });

    (0..dispatches)
        .map(|_| rx.recv_timeout(TIMEOUT).unwrap())
        .collect()
}

#[test]
fn test_round_robin_order() {
    for (n, dispatches) in [(1, 5), (2, 6), (3, 10), (5, 17)] {
        let expected = (0..dispatches).map(|k| k % n).collect::<Vec<_>>();
        assert_eq!(visits(n, dispatches), expected, "ring of {}", n);
    }
}

#[test]
fn test_four_threads() {
    assert_eq!(visits(4, 8), [0, 1, 2, 3, 0, 1, 2, 3]);
}

#[test]
fn test_fairness() {
    let (n, dispatches) = (3, 100);
    let mut runs = vec![0; n];
    for i in visits(n, dispatches) {
        runs[i] += 1;
    }

    let min = *runs.iter().min().unwrap();
    let max = *runs.iter().max().unwrap();
    assert!(max - min <= 1, "unfair runs: {:?}", runs);
    assert_eq!(min, dispatches / n);
    assert_eq!(runs.iter().sum::<usize>(), dispatches);
}

#[test]
fn test_determinism() {
    assert_eq!(visits(5, 23), visits(5, 23));
}

#[test]
fn test_two_tagged_threads() {
    fn tagged(
        tag: u32,
        budget: Rc<Cell<usize>>,
        tx: mpsc::Sender<u32>,
    ) -> impl FnOnce(&Scheduler) -> Never {
        move |scheduler: &Scheduler| -> Never {
            let local_var = tag;
            loop {
                if budget.get() == 0 {
                    park_forever();
                }

                budget.set(budget.get() - 1);
                let _ = tx.send(local_var);
                scheduler.tick();
            }
        }
    }

    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        let budget = Rc::new(Cell::new(6));
        vec![
            scheduler
                .create_thread(tagged(0x1111, budget.clone(), tx.clone()))
                .unwrap(),
            scheduler
                .create_thread(tagged(0x2222, budget, tx))
                .unwrap(),
        ]
    });

    let printed = (0..6)
        .map(|_| format!("{:X}", rx.recv_timeout(TIMEOUT).unwrap()))
        .collect::<Vec<_>>();
    assert_eq!(printed, ["1111", "2222", "1111", "2222", "1111", "2222"]);
}

#[test]
fn test_state_isolation() {
    const THREADS: usize = 3;
    const ROUNDS: u64 = 20;

    // Each thread reports its index, how many times it
    // has run, whether its stack-allocated values have
    // survived, and a running value kept in locals.
    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        (0..THREADS)
            .map(|i| {
                let tx = tx.clone();
                scheduler
                    .create_thread(move |scheduler| {
                        let tag = 0x1111 * (i as u64 + 1);
                        let mut values = [0u64; 32];
                        for (j, value) in values.iter_mut().enumerate() {
                            *value = tag ^ j as u64;
                        }

                        let mut acc = tag;
                        for round in 0..ROUNDS {
                            let intact = black_box(&values)
                                .iter()
                                .enumerate()
                                .all(|(j, value)| *value == tag ^ j as u64);
                            acc = acc.wrapping_mul(31).wrapping_add(round);
                            let _ = tx.send((i, round, intact, black_box(acc)));
                            scheduler.tick();
                        }

                        park_forever();
                    })
                    .unwrap()
            })
            .collect()
    });

    let mut expected = (0..THREADS)
        .map(|i| 0x1111 * (i as u64 + 1))
        .collect::<Vec<_>>();
    for k in 0..(THREADS as u64 * ROUNDS) {
        let (i, round, intact, acc) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(i, (k as usize) % THREADS);
        assert_eq!(round, k / THREADS as u64);
        assert!(intact, "thread {} stack changed in round {}", i, round);
        expected[i] = expected[i].wrapping_mul(31).wrapping_add(round);
        assert_eq!(acc, expected[i]);
    }
}

#[test]
fn test_starvation() {
    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        let first = {
            let tx = tx.clone();
            scheduler
                .create_thread(move |scheduler| loop {
                    let _ = tx.send(0);
                    scheduler.tick();
                })
                .unwrap()
        };

        // The second thread never yields.
        let second = scheduler
            .create_thread(move |_| {
                let _ = tx.send(1);
                park_forever();
            })
            .unwrap();

        vec![first, second]
    });

    assert_eq!(rx.recv_timeout(TIMEOUT), Ok(0));
    assert_eq!(rx.recv_timeout(TIMEOUT), Ok(1));
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );
}

#[test]
fn test_scheduler_state() {
    const THREADS: usize = 3;
    const DISPATCHES: u64 = 9;

    // Each thread reports what the scheduler says about
    // the ring while it is running.
    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        (0..THREADS)
            .map(|i| {
                let tx = tx.clone();
                scheduler
                    .create_thread(move |scheduler| loop {
                        if scheduler.ticks() == DISPATCHES {
                            scheduler.debug();
                            park_forever();
                        }

                        let current = scheduler.current();
                        let states = scheduler
                            .threads()
                            .map(|thread| thread.thread_state())
                            .collect::<Vec<_>>();
                        let runs = scheduler.thread(current).unwrap().runs();
                        let intact = scheduler.threads().all(|thread| thread.stack_intact());
                        let in_bounds = scheduler
                            .threads()
                            .filter(|thread| thread.id() != current)
                            .all(|thread| {
                                thread
                                    .stack_usage(thread.saved_stack_pointer())
                                    .is_some_and(|usage| usage.used() < usage.total())
                            });
                        let report = (
                            i,
                            current.as_usize(),
                            states,
                            runs,
                            scheduler.ticks(),
                            intact && in_bounds,
                        );
                        let _ = tx.send(report);
                        scheduler.tick();
                    })
                    .unwrap()
            })
            .collect()
    });

    for k in 0..DISPATCHES {
        let (i, current, states, runs, ticks, intact) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(i, (k as usize) % THREADS);
        assert_eq!(current, i);
        assert_eq!(runs, k / THREADS as u64 + 1);
        assert_eq!(ticks, k);
        assert!(intact);
        for (j, state) in states.into_iter().enumerate() {
            let expected = if j == i {
                ThreadState::Running
            } else {
                ThreadState::Suspended
            };
            assert_eq!(state, expected, "thread {} in dispatch {}", j, k);
        }
    }
}

#[test]
fn test_single_page_stacks() {
    const THREADS: usize = 4;
    const DISPATCHES: usize = 1000;

    // With single-page stacks, the bodies stick to
    // atomics to stay well within their stacks.
    static SEQUENCE: AtomicUsize = AtomicUsize::new(0);
    static OUT_OF_ORDER: AtomicBool = AtomicBool::new(false);

    run_ring(Config::minimal(), |scheduler| {
        (0..THREADS)
            .map(|i| {
                scheduler
                    .create_thread(move |scheduler| loop {
                        let seq = SEQUENCE.load(Ordering::SeqCst);
                        if seq == DISPATCHES {
                            park_forever();
                        }

                        if seq % THREADS != i {
                            OUT_OF_ORDER.store(true, Ordering::SeqCst);
                        }

                        SEQUENCE.store(seq + 1, Ordering::SeqCst);
                        scheduler.tick();
                    })
                    .unwrap()
            })
            .collect()
    });

    let deadline = Instant::now() + TIMEOUT;
    while SEQUENCE.load(Ordering::SeqCst) < DISPATCHES {
        assert!(Instant::now() < deadline, "ring stalled");
        thread::sleep(Duration::from_millis(1));
    }

    assert!(!OUT_OF_ORDER.load(Ordering::SeqCst));
}

#[test]
#[cfg(debug_assertions)]
fn test_overwritten_canary() {
    // The first thread overwrites the bottom of its own
    // stack, so its next yield should be refused before
    // any switch happens.
    let (tx, rx) = mpsc::channel();
    run_ring(Config::default(), move |scheduler| {
        let first = scheduler
            .create_thread(move |scheduler| {
                let current = scheduler.current();
                let thread = scheduler.thread(current).unwrap();
                let bottom = thread.stack_bounds().unwrap().start();
                unsafe { bottom.as_mut_ptr::<u64>().write_volatile(0) };

                let intact = thread.stack_intact();
                let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.tick()));
                let _ = tx.send((intact, result.is_err(), scheduler.current(), scheduler.ticks()));
                park_forever();
            })
            .unwrap();

        let second = scheduler.create_thread(|_| park_forever()).unwrap();

        vec![first, second]
    });

    let (intact, refused, current, ticks) = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(!intact);
    assert!(refused);
    assert_eq!(current.as_usize(), 0);
    assert_eq!(ticks, 0);
}
