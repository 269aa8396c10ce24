// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-of-program protocol. Own test binary: shutdown is terminal, so
//! nothing else can share this runtime instance.

use std::sync::atomic::{AtomicUsize, Ordering};

static RAN: AtomicUsize = AtomicUsize::new(0);

#[test]
fn finish_returns_after_every_routine_ran_exactly_once() {
    const DIRECT: usize = 100;

    for _ in 0..DIRECT {
        rgo::spawn(|| {
            RAN.fetch_add(1, Ordering::SeqCst);
        });
    }

    // One nested submission, exercising the worker-side spawn path.
    rgo::spawn(|| {
        rgo::spawn(|| {
            RAN.fetch_add(1, Ordering::SeqCst);
        });
        RAN.fetch_add(1, Ordering::SeqCst);
    });

    rgo::finish();

    assert_eq!(RAN.load(Ordering::SeqCst), DIRECT + 2);
}
