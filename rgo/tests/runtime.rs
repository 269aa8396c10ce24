// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios against the live runtime.
//!
//! Everything here shares one runtime instance and must therefore never
//! call `rgo::finish` (shutdown is terminal and owned by the dedicated
//! shutdown test binary). Results travel back to the test thread over
//! channels, which work off the worker pool as well.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use rgo::sync::SpinYieldLock;
use rgo::{Channel, TryRecv};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

/// Bounded receive so a broken scenario fails the test instead of hanging
/// the whole binary.
fn recv_within<T>(channel: &Channel<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match channel.try_recv() {
            TryRecv::Value(value) => return Some(value),
            TryRecv::Closed => return None,
            TryRecv::Empty => {
                assert!(Instant::now() < deadline, "timed out waiting on channel");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

#[test]
fn unbuffered_writer_reader_handshake() {
    init_tracing();

    let data = Channel::new(0);
    let results = Channel::new(0);

    let tx = data.clone();
    rgo::spawn(move || {
        for i in 1..=3u64 {
            tx.send(i);
        }
        tx.close();
    });

    let rx = data.clone();
    let out = results.clone();
    rgo::spawn(move || {
        let mut seen = Vec::new();
        while let Some(value) = rx.recv() {
            seen.push(value);
        }
        out.send(seen);
    });

    let seen = recv_within(&results, SCENARIO_TIMEOUT).unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[test]
fn buffered_writer_parks_after_filling_the_buffer() {
    init_tracing();

    let data = Channel::new(4);
    let sent = Arc::new(AtomicUsize::new(0));

    let tx = data.clone();
    let progress = Arc::clone(&sent);
    rgo::spawn(move || {
        for i in 1..=10u64 {
            tx.send(i);
            progress.fetch_add(1, Ordering::SeqCst);
        }
        tx.close();
    });

    // With no reader the writer deposits exactly the buffer's worth.
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while sent.load(Ordering::SeqCst) < 4 {
        assert!(Instant::now() < deadline, "writer never filled the buffer");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sent.load(Ordering::SeqCst), 4, "writer ran past the buffer");

    // Drain; the writer unparks and the reader observes 1..=10 in order.
    let mut seen = Vec::new();
    loop {
        match recv_within(&data, SCENARIO_TIMEOUT) {
            Some(value) => seen.push(value),
            None => break,
        }
    }
    assert_eq!(seen, (1..=10).collect::<Vec<_>>());
}

#[test]
fn close_releases_a_blocked_receiver() {
    init_tracing();

    let data = Channel::<u64>::new(0);
    let results = Channel::new(0);

    let rx = data.clone();
    let out = results.clone();
    rgo::spawn(move || {
        // Blocks until the channel produces a value or closes.
        let received = rx.recv();
        out.send(received.is_none());
    });

    // Give the reader time to actually block, then close under it.
    std::thread::sleep(Duration::from_millis(50));
    data.close();

    let saw_end = recv_within(&results, SCENARIO_TIMEOUT).unwrap();
    assert!(saw_end, "receiver saw a value on a channel nobody wrote to");
}

#[test]
fn fanout_is_stolen_across_workers_and_locked_counts_add_up() {
    init_tracing();

    const CHILDREN: usize = 1000;
    const INCREMENTS: usize = 10;

    struct Tally {
        count: usize,
        workers: HashSet<ThreadId>,
    }

    let tally = Arc::new(SpinYieldLock::new(Tally {
        count: 0,
        workers: HashSet::new(),
    }));
    let finished = Arc::new(AtomicUsize::new(0));

    let spawner_tally = Arc::clone(&tally);
    let spawner_finished = Arc::clone(&finished);
    // All children are submitted from inside a routine, so they land on one
    // worker's queue and only stealing can spread them out.
    rgo::spawn(move || {
        for _ in 0..CHILDREN {
            let tally = Arc::clone(&spawner_tally);
            let finished = Arc::clone(&spawner_finished);
            rgo::spawn(move || {
                for _ in 0..INCREMENTS {
                    let mut guard = tally.lock();
                    guard.count += 1;
                    guard.workers.insert(std::thread::current().id());
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while finished.load(Ordering::SeqCst) < CHILDREN {
        assert!(Instant::now() < deadline, "children never finished");
        std::thread::sleep(Duration::from_millis(5));
    }

    let guard = tally.lock();
    assert_eq!(guard.count, CHILDREN * INCREMENTS);
    if rgo::Config::get().max_procs > 1 {
        assert!(
            guard.workers.len() > 1,
            "all {CHILDREN} children ran on a single worker; stealing never engaged"
        );
    }
}

#[test]
fn yield_storm_does_not_starve_a_queue_mate() {
    init_tracing();

    let results = Channel::new(0);

    let out = results.clone();
    rgo::spawn(move || {
        let quiet_done = Channel::new(1);
        let loud_done = Channel::new(1);

        // Both children land on this worker's queue.
        let quiet_signal = quiet_done.clone();
        rgo::spawn(move || {
            quiet_signal.send(());
        });
        let loud_signal = loud_done.clone();
        rgo::spawn(move || {
            for _ in 0..10_000 {
                rgo::yield_now();
            }
            loud_signal.send(());
        });

        // The quiet child must complete despite its yield-happy sibling.
        quiet_done.recv();
        loud_done.recv();
        out.send(true);
    });

    assert_eq!(recv_within(&results, SCENARIO_TIMEOUT), Some(true));
}

#[test]
fn nested_spawns_run_from_worker_submissions() {
    init_tracing();

    let results = Channel::new(0);

    let out = results.clone();
    rgo::spawn(move || {
        let inner = Channel::new(0);
        let inner_out = inner.clone();
        rgo::spawn(move || {
            inner_out.send(42u64);
        });
        let value = inner.recv().unwrap();
        out.send(value);
    });

    assert_eq!(recv_within(&results, SCENARIO_TIMEOUT), Some(42));
}

#[test]
fn deferred_close_lets_readers_finish() {
    init_tracing();

    let data = Channel::new(2);
    let results = Channel::new(0);

    let tx = data.clone();
    rgo::spawn(move || {
        rgo::defer!(tx.close());
        for i in 0..5u64 {
            tx.send(i);
        }
    });

    let rx = data.clone();
    let out = results.clone();
    rgo::spawn(move || {
        let mut total = 0;
        while let Some(value) = rx.recv() {
            total += value;
        }
        out.send(total);
    });

    assert_eq!(recv_within(&results, SCENARIO_TIMEOUT), Some(10));
}
