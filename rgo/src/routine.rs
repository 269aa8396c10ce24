// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use rgo_context::{Context, ContextKind};

use crate::config::Config;
use crate::executor;

/// A routine owned by exactly one queue or executor at a time; never cloned.
///
/// The box is load-bearing: the embedded contexts hold address-sensitive
/// saved state, so a routine stays in its allocation from creation to drop
/// and only the pointer travels between processors.
pub(crate) type RoutineBox = Box<Routine>;

/// A one-shot user task, plus the two contexts its life plays out on.
///
/// The routine context runs the callable. The scheduler context is the
/// landing pad control falls into when the callable returns: it is carried
/// *with* the routine (rather than shared with an executor) so that a
/// routine can finish on whichever worker it was stolen to, on a stack the
/// runtime owns. See the executor's cleanup step for the hand-off.
pub(crate) struct Routine {
    callable: Option<Box<dyn FnOnce() + Send + 'static>>,
    context: Box<Context>,
    scheduler_context: Box<Context>,
    done: bool,
}

impl Routine {
    /// Builds a routine around `callable`, allocating both stacks.
    ///
    /// # Errors
    ///
    /// Returns the OS error if either stack cannot be allocated.
    pub fn new(callable: Box<dyn FnOnce() + Send + 'static>) -> std::io::Result<RoutineBox> {
        let config = Config::get();

        let scheduler_context = Context::new(
            ContextKind::Scheduler,
            config.sched_stack_size,
            executor::schedule_trampoline,
            None,
        )?;
        // The routine context returns into the scheduler context when the
        // callable falls off its end.
        let context = Context::new(
            ContextKind::Routine,
            config.routine_stack_size,
            executor::routine_trampoline,
            Some(&scheduler_context),
        )?;

        Ok(Box::new(Self {
            callable: Some(callable),
            context,
            scheduler_context,
            done: false,
        }))
    }

    /// Invokes the callable and marks the routine finished.
    ///
    /// # Panics
    ///
    /// Panics if called twice; a routine is one-shot.
    pub fn run(&mut self) {
        let callable = self.callable.take().expect("routine invoked twice");
        callable();
        self.done = true;
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_ptr(&mut self) -> *mut Context {
        &mut *self.context
    }

    pub fn scheduler_context_mut(&mut self) -> &mut Box<Context> {
        &mut self.scheduler_context
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("done", &self.done)
            .field("started", &self.callable.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_invokes_the_callable_exactly_once_and_sets_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let mut routine = Routine::new(Box::new(move || {
            counted.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();

        assert!(!routine.done());
        routine.run();
        assert!(routine.done());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "routine invoked twice")]
    fn rerunning_a_finished_routine_panics() {
        let mut routine = Routine::new(Box::new(|| {})).unwrap();
        routine.run();
        routine.run();
    }
}
