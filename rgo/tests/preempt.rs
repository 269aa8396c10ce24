// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Preemption on a single worker.
//!
//! Own test binary: the worker count must be pinned to 1 before the runtime
//! boots, so that only the preemption timer — not an idle peer stealing the
//! queue — can get the second routine running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[test]
fn tight_compute_loop_is_preempted() {
    // Safety: nothing else is touching the environment here; in particular
    // the runtime has not booted yet, so the variable is set before it is
    // ever read.
    unsafe {
        std::env::set_var("RGO_MAX_PROCS", "1");
    }

    let release = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    // First routine: burn cycles until released, never yielding on its own.
    let spin_release = Arc::clone(&release);
    let spin_finished = Arc::clone(&finished);
    rgo::spawn(move || {
        while !spin_release.load(Ordering::Relaxed) {
            std::hint::spin_loop();
        }
        spin_finished.store(true, Ordering::SeqCst);
    });

    // Second routine: queued behind the spinner on the only worker. It can
    // only ever run if the timer kicks the spinner off the worker.
    let unlock = Arc::clone(&release);
    rgo::spawn(move || {
        unlock.store(true, Ordering::Relaxed);
    });

    // Orders of magnitude above 2x the timer period, to keep slow CI from
    // flaking; without preemption this spins forever either way.
    let deadline = Instant::now() + Duration::from_secs(20);
    while !finished.load(Ordering::SeqCst) {
        assert!(
            Instant::now() < deadline,
            "spinner still running; preemption never fired"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}
