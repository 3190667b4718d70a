//! Scenario tests for the epoch protection manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use oxiepoch::{LightEpoch, Status};

/// Single thread walks the whole protocol.
#[test]
fn single_thread_protocol() {
    let epoch = LightEpoch::new();
    epoch.acquire().unwrap();

    assert_eq!(epoch.protect_and_drain(), 1);
    assert_eq!(epoch.bump_current_epoch(), 2);
    assert_eq!(epoch.protect_and_drain(), 2);

    epoch.release();
    assert!(!epoch.is_protected());

    // The slot is reusable after release.
    epoch.acquire().unwrap();
    assert_eq!(epoch.protect_and_drain(), 2);
    epoch.release();
}

/// A deferred action waits for the laggard thread and fires exactly once.
#[test]
fn deferred_action_fires_once_laggard_refreshes() {
    let epoch = Arc::new(LightEpoch::new());
    let fired = Arc::new(AtomicUsize::new(0));

    let (ready_tx, ready_rx) = mpsc::channel();
    let (step_tx, step_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();
    let (exit_tx, exit_rx) = mpsc::channel::<()>();

    let laggard = {
        let epoch = Arc::clone(&epoch);
        thread::spawn(move || {
            epoch.acquire().unwrap();
            assert_eq!(epoch.protect_and_drain(), 1);
            ready_tx.send(()).unwrap();

            step_rx.recv().unwrap();
            // Publishing the post-bump epoch makes the action safe; this
            // thread's drain fires it.
            assert_eq!(epoch.protect_and_drain(), 2);
            done_tx.send(()).unwrap();

            exit_rx.recv().unwrap();
            epoch.release();
        })
    };

    epoch.acquire().unwrap();
    assert_eq!(epoch.protect_and_drain(), 1);
    ready_rx.recv().unwrap();

    let fired_clone = Arc::clone(&fired);
    let new_epoch = epoch.bump_current_epoch_with_action(move || {
        fired_clone.fetch_add(1, Ordering::AcqRel);
    });
    assert_eq!(new_epoch, 2);

    // The laggard still holds epoch 1.
    assert_eq!(fired.load(Ordering::Acquire), 0);

    step_tx.send(()).unwrap();
    done_rx.recv().unwrap();
    assert_eq!(fired.load(Ordering::Acquire), 1);

    // Further activity must not re-fire it.
    epoch.protect_and_drain();
    epoch.bump_current_epoch();
    assert_eq!(fired.load(Ordering::Acquire), 1);

    exit_tx.send(()).unwrap();
    laggard.join().unwrap();
    epoch.release();
}

/// Reclamation stays gated until the last of eight threads refreshes.
#[test]
fn reclamation_gated_by_slow_threads() {
    const WORKERS: usize = 7;

    let epoch = Arc::new(LightEpoch::new());
    let fired = Arc::new(AtomicUsize::new(0));

    let mut step_txs = Vec::new();
    let mut done_rxs = Vec::new();
    let mut exit_txs = Vec::new();
    let (ready_tx, ready_rx) = mpsc::channel();
    let mut handles = Vec::new();

    for _ in 0..WORKERS {
        let (step_tx, step_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        step_txs.push(step_tx);
        done_rxs.push(done_rx);
        exit_txs.push(exit_tx);

        let epoch = Arc::clone(&epoch);
        let ready_tx = ready_tx.clone();
        handles.push(thread::spawn(move || {
            epoch.acquire().unwrap();
            assert_eq!(epoch.protect_and_drain(), 1);
            ready_tx.send(()).unwrap();

            step_rx.recv().unwrap();
            epoch.protect_and_drain();
            done_tx.send(()).unwrap();

            exit_rx.recv().unwrap();
            epoch.release();
        }));
    }
    for _ in 0..WORKERS {
        ready_rx.recv().unwrap();
    }

    epoch.acquire().unwrap();
    epoch.protect_and_drain();
    let fired_clone = Arc::clone(&fired);
    epoch.bump_current_epoch_with_action(move || {
        fired_clone.fetch_add(1, Ordering::AcqRel);
    });

    // Nobody refreshes for a while; the action must stay pending.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::Acquire), 0);

    for i in 0..WORKERS {
        step_txs[i].send(()).unwrap();
        done_rxs[i].recv().unwrap();
        let expected = if i + 1 == WORKERS { 1 } else { 0 };
        assert_eq!(fired.load(Ordering::Acquire), expected, "after worker {i}");
    }

    for exit_tx in &exit_txs {
        exit_tx.send(()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    epoch.release();
}

/// Acquire/release churn on a tiny table neither leaks slots nor loses
/// actions.
#[test]
fn slot_reuse_under_churn() {
    const ITERATIONS: usize = 10_000;

    let epoch = LightEpoch::with_table_size(2).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    for i in 0..ITERATIONS {
        epoch.acquire().unwrap_or_else(|status| {
            panic!("iteration {i}: acquire failed with {status}");
        });
        epoch.protect_and_drain();

        let fired_clone = Arc::clone(&fired);
        epoch.bump_current_epoch_with_action(move || {
            fired_clone.fetch_add(1, Ordering::AcqRel);
        });

        epoch.release();
    }

    assert_eq!(fired.load(Ordering::Acquire), ITERATIONS);
}

/// Exactly the last of three protected threads observes a completed phase.
#[test]
fn marker_rendezvous_completes_on_last_thread() {
    const THREADS: usize = 3;

    let epoch = Arc::new(LightEpoch::new());
    let mut step_txs = Vec::new();
    let mut result_rxs = Vec::new();
    let mut exit_txs = Vec::new();
    let (ready_tx, ready_rx) = mpsc::channel();
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let (step_tx, step_rx) = mpsc::channel::<()>();
        let (result_tx, result_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        step_txs.push(step_tx);
        result_rxs.push(result_rx);
        exit_txs.push(exit_tx);

        let epoch = Arc::clone(&epoch);
        let ready_tx = ready_tx.clone();
        handles.push(thread::spawn(move || {
            epoch.acquire().unwrap();
            epoch.protect_and_drain();
            ready_tx.send(()).unwrap();

            step_rx.recv().unwrap();
            let complete = epoch.mark_and_check_is_complete(0, 7);
            result_tx.send(complete).unwrap();

            exit_rx.recv().unwrap();
            epoch.release();
        }));
    }
    for _ in 0..THREADS {
        ready_rx.recv().unwrap();
    }

    // Sequence the calls strictly; only the final caller completes the
    // phase.
    for (i, step_tx) in step_txs.iter().enumerate() {
        step_tx.send(()).unwrap();
        let complete = result_rxs[i].recv().unwrap();
        assert_eq!(complete, i + 1 == THREADS, "caller {i}");
    }

    for exit_tx in &exit_txs {
        exit_tx.send(()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// A full table reports exhaustion to the next reservation.
#[test]
fn full_table_reports_exhaustion() {
    let epoch = Arc::new(LightEpoch::with_table_size(2).unwrap());

    let (ready_tx, ready_rx) = mpsc::channel();
    let mut exit_txs = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        exit_txs.push(exit_tx);
        let epoch = Arc::clone(&epoch);
        let ready_tx = ready_tx.clone();
        handles.push(thread::spawn(move || {
            epoch.acquire().unwrap();
            ready_tx.send(()).unwrap();
            exit_rx.recv().unwrap();
            epoch.release();
        }));
    }
    ready_rx.recv().unwrap();
    ready_rx.recv().unwrap();

    assert_eq!(epoch.acquire(), Err(Status::TableExhausted));

    for exit_tx in &exit_txs {
        exit_tx.send(()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// After every thread releases, fresh threads can reserve the freed slots.
#[test]
fn released_slots_are_reusable_by_new_threads() {
    let epoch = Arc::new(LightEpoch::with_table_size(2).unwrap());

    for round in 0..3 {
        let mut handles = Vec::new();
        for _ in 0..2 {
            let epoch = Arc::clone(&epoch);
            handles.push(thread::spawn(move || {
                epoch.acquire().unwrap();
                epoch.protect_and_drain();
                epoch.release();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(epoch.current_epoch() >= 1, "round {round}");
    }
}
