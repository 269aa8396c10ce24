// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::{mem, ptr};

use rgo_context::{self as context, Context, ContextKind, YIELD_SIGNAL};

use crate::config::Config;
use crate::machines::Machines;
use crate::preempt;
use crate::processor::Processor;
use crate::routine::RoutineBox;

thread_local! {
    /// The executor driving this OS thread, if it is a worker. Read from the
    /// yield-signal handler, which is why this is a const-initialised `Cell`
    /// of a raw pointer: plain TLS load, no lazy init, no allocation.
    static CURRENT: Cell<*const Executor> = const { Cell::new(ptr::null()) };
}

/// Returns the executor bound to the calling thread, or `None` on the main
/// thread (and any other thread the runtime does not own).
pub(crate) fn current() -> Option<&'static Executor> {
    let executor = CURRENT.get();
    if executor.is_null() {
        None
    } else {
        // Safety: CURRENT is only ever set to an executor held alive by the
        // process-lived coordinator singleton; it is never freed.
        Some(unsafe { &*executor })
    }
}

/// State only ever touched from the executor's own OS thread (including from
/// its yield-signal handler, which runs on the same thread).
struct Core {
    /// The routine currently occupying this worker, if any.
    active: Option<RoutineBox>,
    /// The scheduler context voluntary yields (re)enter. Swapped with a
    /// finished routine's scheduler context during cleanup, see
    /// [`Executor::schedule_loop`].
    scheduler_context: Option<Box<Context>>,
    /// Save slot for the worker thread's original stack; resumed once, at
    /// shutdown, so the OS thread can exit cleanly.
    root: Option<Box<Context>>,
    /// Whether the next scheduler entry comes from a save-and-swap out of a
    /// routine (as opposed to a finished routine falling into its own
    /// scheduler context). Decides which scheduler stack we are standing on
    /// during cleanup.
    entered_via_yield: bool,
}

/// A worker: one OS thread bound to (at most) one processor at a time,
/// switching in and out of routine contexts.
pub(crate) struct Executor {
    id: usize,
    running: AtomicBool,
    /// pthread handle of the worker thread, 0 until startup has published it.
    /// The timer handler reads this to aim its yield signals.
    thread_handle: AtomicUsize,
    processor: Mutex<Option<Arc<Processor>>>,
    core: UnsafeCell<Core>,
}

// Safety: `core` is confined to the executor's own OS thread; every other
// field is individually synchronised (atomics / mutex).
unsafe impl Sync for Executor {}

impl Executor {
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            running: AtomicBool::new(true),
            thread_handle: AtomicUsize::new(0),
            processor: Mutex::new(None),
            core: UnsafeCell::new(Core {
                active: None,
                scheduler_context: None,
                root: None,
                entered_via_yield: false,
            }),
        })
    }

    /// Spawns the worker OS thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn_thread(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let executor = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("rgo-worker-{}", self.id))
            .spawn(move || executor.thread_main())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Asks the scheduler loop to wind down at its next pass.
    pub fn finalize(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn thread_handle(&self) -> usize {
        self.thread_handle.load(Ordering::Acquire)
    }

    /// The processor this worker currently holds, if any. Peeked by thieves.
    pub fn held_processor(&self) -> Option<Arc<Processor>> {
        self.processor.lock().unwrap().clone()
    }

    /// Detaches the held processor (the parking hook's first step).
    pub fn release_processor(&self) -> Option<Arc<Processor>> {
        self.processor.lock().unwrap().take()
    }

    pub fn has_active_routine(&self) -> bool {
        // Safety: called only on this executor's own thread (the yield
        // handler runs on the same thread).
        unsafe { (*self.core.get()).active.is_some() }
    }

    fn thread_main(self: Arc<Self>) {
        self.thread_handle
            .store(preempt::current_thread_handle(), Ordering::Release);
        CURRENT.set(Arc::as_ptr(&self));
        preempt::install_yield_handler();
        tracing::trace!(worker = self.id, "worker online");

        let config = Config::get();
        let core = self.core.get();
        // Safety: `core` is confined to this thread; the boxes created here
        // stay at their addresses for the life of the executor.
        unsafe {
            (*core).root = Some(Context::anchor());
            (*core).scheduler_context = Some(
                Context::new(
                    ContextKind::Scheduler,
                    config.sched_stack_size,
                    schedule_trampoline,
                    None,
                )
                .expect("failed to allocate scheduler context"),
            );
            (*core).entered_via_yield = true;

            let root: *mut Context = &mut **(*core).root.as_mut().expect("root just created");
            let scheduler: *const Context =
                &**(*core).scheduler_context.as_ref().expect("just created");
            // Safety: fresh scheduler context, unused stack; the root anchor
            // is resumed exactly once, by the loop's shutdown path.
            context::swap(&mut *root, &*scheduler).expect("failed to enter scheduler context");
        }

        // Resumed from the scheduler loop's shutdown path.
        tracing::trace!(worker = self.id, "worker offline");
    }

    /// Save-and-swap from the currently running routine into this worker's
    /// scheduler context. Called on explicit yields, on channel/lock
    /// cooperation points, and from the yield-signal handler.
    ///
    /// On a worker without an active routine (thread startup) this becomes
    /// an unconditional jump and does not return.
    pub(crate) fn switch_to_scheduler(&self) {
        let core = self.core.get();

        // Hold the yield signal while we juggle contexts: a preemption
        // landing between the re-init and the swap would re-enter this
        // function on a half-updated core. The saved routine state inherits
        // the blocked mask; it is lifted again right after resumption.
        // Safety: manipulating only this thread's signal mask.
        let mut held: libc::sigset_t = unsafe { mem::zeroed() };
        // Safety: `held` is a valid sigset for the ops below.
        unsafe {
            libc::sigemptyset(&mut held);
            libc::sigaddset(&mut held, YIELD_SIGNAL);
            libc::pthread_sigmask(libc::SIG_BLOCK, &held, ptr::null_mut());
        }

        // Safety: `core` is confined to this thread and the yield signal is
        // blocked above, so nothing can observe the intermediate states.
        unsafe {
            match (*core).scheduler_context.as_mut() {
                Some(ctx) => ctx
                    .reinit(ContextKind::Scheduler, schedule_trampoline, None)
                    .expect("failed to re-initialise scheduler context"),
                None => {
                    (*core).scheduler_context = Some(
                        Context::new(
                            ContextKind::Scheduler,
                            Config::get().sched_stack_size,
                            schedule_trampoline,
                            None,
                        )
                        .expect("failed to allocate scheduler context"),
                    );
                }
            }
            (*core).entered_via_yield = true;

            let scheduler: *const Context =
                &**(*core).scheduler_context.as_ref().expect("just initialised");
            if let Some(active) = (*core).active.as_mut() {
                let routine_ctx = active.context_ptr();
                context::swap(&mut *routine_ctx, &*scheduler)
                    .expect("failed to swap into scheduler context");
                // Resumed (possibly on a different worker): allow preemption
                // again on whichever thread carries us now.
                libc::pthread_sigmask(libc::SIG_UNBLOCK, &held, ptr::null_mut());
            } else {
                context::set(&*scheduler)
            }
        }
    }

    fn take_entered_via_yield(&self) -> bool {
        // Safety: `core` is confined to this thread.
        unsafe { mem::replace(&mut (*self.core.get()).entered_via_yield, false) }
    }

    /// Runs the active routine's callable. Unwinding must not cross the
    /// context-switch frame below us, so panics are caught here; a routine
    /// panic is fatal to the process.
    fn run_active_routine(&self) {
        let core = self.core.get();
        // Safety: `core` is confined to this thread.
        let routine = unsafe { (*core).active.as_mut() }.expect("no active routine to run");

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| routine.run())) {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            tracing::error!(worker = self.id, panic = message, "routine panicked, aborting");
            std::process::abort();
        }
    }

    /// The per-worker scheduling loop. Runs on a scheduler context, both
    /// yield signals masked; leaves only by jumping into a routine context
    /// (and being re-entered fresh on the next yield) or, at shutdown, by
    /// resuming the worker thread's root frame.
    fn schedule_loop(&self, entered_via_yield: bool) -> ! {
        let machines = Machines::get();
        let core = self.core.get();

        machines.idle_count().fetch_add(1, Ordering::SeqCst);

        // Clean up a finished routine before looking for new work.
        // Safety: `core` is confined to this thread.
        unsafe {
            if (*core).active.as_ref().is_some_and(|routine| routine.done()) {
                let mut finished = (*core).active.take().expect("checked above");
                if !entered_via_yield {
                    // The routine returned through its own scheduler context
                    // and that is the stack we are standing on right now.
                    // Adopt it, and let the routine carry the executor's
                    // idle one to its grave.
                    mem::swap(
                        (*core)
                            .scheduler_context
                            .as_mut()
                            .expect("executor scheduler context missing"),
                        finished.scheduler_context_mut(),
                    );
                }
                tracing::trace!(worker = self.id, routine = ?finished, "routine finished");
                drop(finished);
            }
        }

        while self.running.load(Ordering::Acquire) {
            let Some(processor) = self.held_processor() else {
                if let Some(processor) = machines.pull_processor() {
                    tracing::trace!(
                        worker = self.id,
                        processor = processor.id(),
                        "processor acquired"
                    );
                    *self.processor.lock().unwrap() = Some(processor);
                }
                continue;
            };

            // Safety: `core` is confined to this thread; the `set` jumps
            // never return, so no borrow survives them.
            unsafe {
                let mut active = (*core).active.take();
                if let Some(next) = processor.next(&mut active, machines) {
                    (*core).active = Some(next);
                    machines.idle_count().fetch_sub(1, Ordering::SeqCst);
                    let ctx: *const Context = (*core).active.as_ref().expect("just set").context();
                    context::set(&*ctx)
                } else if let Some(active) = active {
                    // Nothing else runnable; keep driving the routine we
                    // already have.
                    (*core).active = Some(active);
                    machines.idle_count().fetch_sub(1, Ordering::SeqCst);
                    let ctx: *const Context = (*core).active.as_ref().expect("just set").context();
                    context::set(&*ctx)
                }
            }
        }

        machines.idle_count().fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker = self.id, "stop signal received, shutting down");

        // Safety: the root anchor was saved at thread startup and its frame
        // is still alive (thread_main has not returned).
        unsafe {
            let root: *const Context = &**(*core).root.as_ref().expect("missing root context");
            context::set(&*root)
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Entry point of every routine context: runs the active routine of the
/// calling worker, then falls off into the routine's scheduler context.
pub(crate) extern "C" fn routine_trampoline() {
    let executor = current().expect("routine context entered on a non-worker thread");
    executor.run_active_routine();
}

/// Entry point of every scheduler context.
pub(crate) extern "C" fn schedule_trampoline() {
    let executor = current().expect("scheduler context entered on a non-worker thread");
    let entered_via_yield = executor.take_entered_via_yield();
    executor.schedule_loop(entered_via_yield)
}
