// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Go-style M:N concurrency for Rust: lightweight routines, typed channels,
//! and select, multiplexed over a fixed pool of worker threads.
//!
//! The runtime cooperatively schedules many routines over one worker thread
//! per hardware context, preempts long-running routines with a periodic
//! timer signal, and load-balances by work stealing. Routines communicate
//! through [`Channel`]s and compose channel operations with [`Select`];
//! [`sync::SpinYieldLock`] and [`defer!`] round out the toolkit.
//!
//! ```no_run
//! use rgo::Channel;
//!
//! let numbers = Channel::new(0);
//! let tx = numbers.clone();
//! rgo::spawn(move || {
//!     for i in 1..=3 {
//!         tx.send(i);
//!     }
//!     tx.close();
//! });
//!
//! let rx = numbers.clone();
//! rgo::spawn(move || {
//!     while let Some(n) = rx.recv() {
//!         println!("got {n}");
//!     }
//! });
//!
//! rgo::finish();
//! ```
//!
//! # Caveats
//!
//! The runtime moves suspended routines between worker threads. Thread
//! identity is therefore unstable across any suspension point: holding a
//! thread-affine guard (stdio locks, `thread_local!` borrows) across a
//! yield, channel operation, or preemption is unsupported.
//!
//! [`finish`] ends the program by watching for sustained idleness. A
//! program that leaves routines parked forever (say, reading a channel
//! nobody closes) never goes idle and never finishes; closing channels is
//! part of the protocol.

mod channel;
mod config;
mod executor;
mod machines;
mod preempt;
mod processor;
mod routine;
mod select;
pub mod sync;

pub use channel::{Channel, Sent, TryRecv};
pub use config::Config;
pub use select::Select;

use machines::Machines;

/// Queues `callable` to run as a routine, at some later time, on some
/// worker.
///
/// Called from within a routine, the child lands on the submitting worker's
/// own run queue (and from there may be stolen by idle peers); called from
/// the main thread, it goes through the global queue. The first call boots
/// the runtime.
pub fn spawn<F>(callable: F)
where
    F: FnOnce() + Send + 'static,
{
    Machines::get().spawn(Box::new(callable));
}

/// Suspends the calling routine and re-enters the scheduler; the routine
/// goes to the tail of its processor's queue and runs again after its
/// queue-mates had a turn.
///
/// On a thread the runtime does not own this degrades to
/// [`std::thread::yield_now`].
pub fn yield_now() {
    match executor::current() {
        Some(executor) if executor.has_active_routine() => executor.switch_to_scheduler(),
        _ => std::thread::yield_now(),
    }
}

/// End-of-program: blocks until every worker has been idle for a sustained
/// period (all routines finished), then stops and joins the workers and the
/// preemption timer. Terminal — the runtime cannot be restarted afterwards.
pub fn finish() {
    Machines::get().finish();
}

/// Parks hook for routines about to block their OS thread outside the
/// runtime's control: dumps the calling worker's queued routines into the
/// global queue and returns its processor to the idle pool, so no routine
/// is stranded behind the blocked thread.
///
/// # Panics
///
/// Panics when called from a thread the runtime does not own.
pub fn yield_routines_and_processor() {
    Machines::get().yield_routines_and_processor();
}
