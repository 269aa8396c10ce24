// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signal-driven preemption.
//!
//! One periodic POSIX timer fires the realtime timer signal on the
//! timekeeper thread (the thread that armed it; every runtime thread other
//! than the timekeeper keeps it blocked). The timer handler's sole job is to
//! send the yield signal to every worker. Each worker's yield handler in
//! turn performs nothing but a save-and-swap of contexts: scheduler contexts
//! keep the yield signal masked, so a worker that is already running
//! scheduler code is never re-entered.

use std::io;
use std::thread::JoinHandle;
use std::time::Duration;
use std::{mem, ptr};

use rgo_context::{YIELD_SIGNAL, timer_signal};

use crate::executor;
use crate::machines::Machines;

/// The calling thread's pthread handle, as a plain word the timer handler
/// can load atomically.
pub(crate) fn current_thread_handle() -> usize {
    #[allow(
        clippy::cast_possible_truncation,
        reason = "pthread_t is word-sized on every supported target"
    )]
    // Safety: pthread_self has no preconditions.
    let handle = unsafe { libc::pthread_self() as usize };
    handle
}

/// Blocks the timer signal on the calling thread. The coordinator calls this
/// before spawning any runtime thread, so they all inherit the blocked mask.
pub(crate) fn block_timer_signal() {
    // Safety: manipulating only the calling thread's signal mask.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, timer_signal());
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }
}

/// Installs the yield-signal handler. The disposition is process-wide;
/// every worker installs it redundantly so worker startup stays
/// self-contained.
pub(crate) fn install_yield_handler() {
    // Safety: handler is a valid extern "C" fn for the plain (non-SIGINFO)
    // convention; sigaction copies the struct.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = yield_signal_handler as extern "C" fn(libc::c_int) as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(YIELD_SIGNAL, &action, ptr::null_mut()) != 0 {
            panic!(
                "failed to install yield signal handler: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Spawns the timekeeper thread, which owns the periodic preemption timer
/// for the life of the runtime.
///
/// # Errors
///
/// Returns the OS error if the thread cannot be spawned.
pub(crate) fn spawn_timekeeper(interval: Duration) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rgo-timekeeper".into())
        .spawn(move || timekeeper_main(interval))
}

fn timekeeper_main(interval: Duration) {
    // Blocks until the coordinator finishes booting.
    let machines = Machines::get();

    install_timer_handler();
    unblock_timer_signal();

    let timer = match arm_timer(interval) {
        Ok(timer) => timer,
        Err(err) => {
            tracing::error!(?err, "failed to arm preemption timer, preemption disabled");
            return;
        }
    };
    tracing::debug!(?interval, "preemption timer armed");

    while machines.running() {
        std::thread::sleep(Duration::from_millis(100));
    }

    // Safety: `timer` was created by arm_timer and is deleted exactly once.
    unsafe {
        libc::timer_delete(timer);
    }
    tracing::debug!("preemption timer disarmed");
}

fn install_timer_handler() {
    // Safety: handler matches the SA_SIGINFO calling convention; sigaction
    // copies the struct.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = timer_signal_handler
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(timer_signal(), &action, ptr::null_mut()) != 0 {
            panic!(
                "failed to install timer signal handler: {}",
                io::Error::last_os_error()
            );
        }
    }
}

fn unblock_timer_signal() {
    // Safety: manipulating only the calling thread's signal mask.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, timer_signal());
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    }
}

fn arm_timer(interval: Duration) -> io::Result<libc::timer_t> {
    // Safety: sigevent/itimerspec are plain structs passed by pointer; the
    // timer id out-param is only read after timer_create succeeds.
    unsafe {
        let mut sev: libc::sigevent = mem::zeroed();
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = timer_signal();

        let mut timer: libc::timer_t = mem::zeroed();
        if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) != 0 {
            return Err(io::Error::last_os_error());
        }

        let period = timespec(interval);
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        if libc::timer_settime(timer, 0, &spec, ptr::null_mut()) != 0 {
            let err = io::Error::last_os_error();
            libc::timer_delete(timer);
            return Err(err);
        }

        Ok(timer)
    }
}

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(duration.subsec_nanos()),
    }
}

/// Runs on the timekeeper when the periodic timer fires. Async-signal
/// context: atomic loads and pthread_kill only.
extern "C" fn timer_signal_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let Some(machines) = Machines::try_get() else {
        return;
    };
    if !machines.running() {
        return;
    }
    for executor in machines.executors() {
        let handle = executor.thread_handle();
        if handle != 0 {
            // Safety: workers outlive the timer; finish() disarms it before
            // joining any worker thread.
            unsafe {
                libc::pthread_kill(handle as libc::pthread_t, YIELD_SIGNAL);
            }
        }
    }
}

/// Runs on a worker when it is told to yield. Async-signal context: a TLS
/// read and a save-and-swap of contexts, nothing else — in particular no
/// allocation (the worker's scheduler context already exists, so the switch
/// only re-initialises it in place).
extern "C" fn yield_signal_handler(_signal: libc::c_int) {
    if let Some(executor) = executor::current() {
        if executor.has_active_routine() {
            executor.switch_to_scheduler();
        }
    }
}

/// Holds the yield signal blocked for its lifetime, restoring the previous
/// mask on drop (nest-safe).
///
/// Runtime paths that take scheduler-shared locks from routine context hold
/// one of these: a preemption landing inside such a critical section would
/// suspend the routine with the lock still held, and the scheduler loop it
/// yields into could then block on that very lock on the same thread.
pub(crate) struct HoldYield {
    previous: libc::sigset_t,
}

impl HoldYield {
    pub fn new() -> Self {
        // Safety: manipulating only the calling thread's signal mask; the
        // previous mask is captured for the restore in drop.
        unsafe {
            let mut block: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut block);
            libc::sigaddset(&mut block, YIELD_SIGNAL);
            let mut previous: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut previous);
            Self { previous }
        }
    }
}

impl Drop for HoldYield {
    fn drop(&mut self) {
        // Safety: restores the mask captured in `new` on the same thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}
