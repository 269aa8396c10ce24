// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::executor::{self, Executor};
use crate::preempt;
use crate::processor::{Processor, WorkSource};
use crate::routine::{Routine, RoutineBox};

/// How long a worker without a processor sleeps before re-checking the
/// stopped flag.
const PULL_PROCESSOR_TIMEOUT: Duration = Duration::from_millis(10);
/// How long an idle worker waits for new routines before retrying the steal
/// scan.
const PULL_ROUTINES_TIMEOUT: Duration = Duration::from_millis(100);
/// Idle sampling period of the termination watch.
const IDLE_SAMPLE_PERIOD: Duration = Duration::from_millis(100);
/// Consecutive fully-idle samples required before shutdown.
const IDLE_SAMPLES_TO_STOP: u32 = 20;

static MACHINES: OnceLock<Machines> = OnceLock::new();

/// The process-wide coordinator: owns the worker pool, the idle-processor
/// pool, the global routine queue, and the preemption timer's lifecycle.
pub(crate) struct Machines {
    executors: Vec<Arc<Executor>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    timekeeper: Mutex<Option<JoinHandle<()>>>,

    global: Mutex<VecDeque<RoutineBox>>,
    new_routine_cv: Condvar,

    idle_processors: Mutex<Vec<Arc<Processor>>>,
    idle_processor_cv: Condvar,

    stopped: AtomicBool,
    idle_count: AtomicUsize,
    shutdown: Once,
}

impl Machines {
    /// Returns the coordinator, booting the whole runtime on first use.
    pub fn get() -> &'static Machines {
        MACHINES.get_or_init(Machines::start)
    }

    /// Returns the coordinator only if the runtime is already up. Used by
    /// the timer signal handler, which must never trigger initialisation.
    pub fn try_get() -> Option<&'static Machines> {
        MACHINES.get()
    }

    fn start() -> Machines {
        let config = Config::get();
        tracing::debug!(
            max_procs = config.max_procs,
            timer = ?config.timer_interval,
            "starting runtime"
        );

        // Workers and the timekeeper inherit this thread's mask, so block
        // the timer signal first; the timekeeper unblocks it for itself.
        preempt::block_timer_signal();

        let idle_processors = (0..config.max_procs)
            .map(|id| Arc::new(Processor::new(id)))
            .collect();

        let mut executors = Vec::with_capacity(config.max_procs);
        let mut worker_handles = Vec::with_capacity(config.max_procs);
        for id in 0..config.max_procs {
            let executor = Executor::new(id);
            let handle = executor
                .spawn_thread()
                .expect("failed to spawn worker thread");
            executors.push(executor);
            worker_handles.push(handle);
        }

        let timekeeper =
            preempt::spawn_timekeeper(config.timer_interval).expect("failed to spawn timekeeper");

        Machines {
            executors,
            worker_handles: Mutex::new(worker_handles),
            timekeeper: Mutex::new(Some(timekeeper)),
            global: Mutex::new(VecDeque::new()),
            new_routine_cv: Condvar::new(),
            idle_processors: Mutex::new(idle_processors),
            idle_processor_cv: Condvar::new(),
            stopped: AtomicBool::new(false),
            idle_count: AtomicUsize::new(0),
            shutdown: Once::new(),
        }
    }

    pub fn running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> &AtomicUsize {
        &self.idle_count
    }

    pub fn executors(&self) -> &[Arc<Executor>] {
        &self.executors
    }

    /// Queues a routine built around `callable`.
    ///
    /// Submissions from a worker land on that worker's own processor;
    /// submissions from the main thread (or any foreign thread) go through
    /// the global queue.
    pub fn spawn(&self, callable: Box<dyn FnOnce() + Send + 'static>) {
        let routine = Routine::new(callable).expect("failed to allocate routine contexts");

        // A preemption inside the enqueue would strand a queue lock under a
        // suspended routine and deadlock the scheduler it yields into.
        let _no_preempt = preempt::HoldYield::new();

        match executor::current().and_then(Executor::held_processor) {
            Some(processor) => processor.submit(routine),
            None => self.global.lock().unwrap().push_back(routine),
        }
        self.new_routine_cv.notify_one();
    }

    /// Hands an idle processor to a worker that has none, blocking in short
    /// slices so the caller can notice shutdown.
    pub fn pull_processor(&self) -> Option<Arc<Processor>> {
        let mut idle = self.idle_processors.lock().unwrap();
        while self.running() {
            if let Some(processor) = idle.pop() {
                return Some(processor);
            }
            let (reacquired, _) = self
                .idle_processor_cv
                .wait_timeout(idle, PULL_PROCESSOR_TIMEOUT)
                .unwrap();
            idle = reacquired;
        }
        None
    }

    /// Parks hook: dumps the calling worker's processor queue into the
    /// global queue and returns the processor to the idle pool, so no
    /// routines are stranded on a queue nobody can reach.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread the runtime does not own.
    pub fn yield_routines_and_processor(&self) {
        let executor = executor::current()
            .expect("yield_routines_and_processor called off the worker pool");

        let _no_preempt = preempt::HoldYield::new();

        let Some(processor) = executor.release_processor() else {
            return;
        };

        {
            let mut global = self.global.lock().unwrap();
            let mut dumped = Vec::new();
            processor.surrender(&mut dumped, true);
            tracing::trace!(
                worker = executor.id(),
                released = dumped.len(),
                "worker released its processor"
            );
            global.extend(dumped);
        }
        self.new_routine_cv.notify_all();

        self.idle_processors.lock().unwrap().push(processor);
        self.idle_processor_cv.notify_one();
    }

    /// Blocks until every worker has been continuously idle for
    /// `IDLE_SAMPLES_TO_STOP` samples, then stops the timer, the workers,
    /// and joins them all. Terminal: the runtime does not restart.
    ///
    /// Programs that park all routines on a never-closed channel keep at
    /// least one worker busy forever and never reach this idle threshold;
    /// closing channels is the user's obligation.
    pub fn finish(&'static self) {
        self.shutdown.call_once(|| {
            tracing::debug!("waiting for sustained idleness");
            let workers = self.executors.len();
            let mut seen_idle = 0u32;
            while seen_idle < IDLE_SAMPLES_TO_STOP {
                if self.idle_count.load(Ordering::SeqCst) == workers {
                    seen_idle += 1;
                } else {
                    seen_idle = 0;
                }
                std::thread::sleep(IDLE_SAMPLE_PERIOD);
            }

            self.stopped.store(true, Ordering::Release);

            // The timekeeper notices the stopped flag and disarms the timer;
            // join it first so no yield signals target dying workers.
            if let Some(timekeeper) = self.timekeeper.lock().unwrap().take() {
                let _ = timekeeper.join();
            }

            for executor in &self.executors {
                executor.finalize();
            }
            self.new_routine_cv.notify_all();
            self.idle_processor_cv.notify_all();

            for handle in self.worker_handles.lock().unwrap().drain(..) {
                let _ = handle.join();
            }
            tracing::debug!("runtime stopped");
        });
    }
}

impl WorkSource for Machines {
    /// The pull strategy: steal a peer's back half first, then drain the
    /// global queue, and only then (idle callers only) wait for news.
    fn pull_routines(&self, into: &mut Vec<RoutineBox>, stealer: usize, core_idle: bool) {
        while self.running() {
            // Scan the other workers' processors from a random start so
            // thieves spread out instead of mobbing worker 0.
            let workers = self.executors.len();
            let start = fastrand::usize(0..workers);
            for i in 0..workers {
                let victim = &self.executors[(start + i) % workers];
                let Some(processor) = victim.held_processor() else {
                    continue;
                };
                if processor.id() == stealer {
                    continue;
                }
                processor.surrender(into, false);
                if !into.is_empty() {
                    tracing::trace!(
                        stealer,
                        victim = processor.id(),
                        stolen = into.len(),
                        "stole routines"
                    );
                    return;
                }
            }

            let mut global = self.global.lock().unwrap();
            if !global.is_empty() {
                into.extend(global.drain(..));
                return;
            }
            if !core_idle {
                // The caller has a routine to continue; no time to waste.
                return;
            }
            let _ = self
                .new_routine_cv
                .wait_timeout(global, PULL_ROUTINES_TIMEOUT)
                .unwrap();
        }
    }
}
