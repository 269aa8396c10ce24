// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::routine::RoutineBox;

/// Where a processor turns when its own queue runs dry.
///
/// Implemented by the coordinator; kept as a seam so the processor logic can
/// be exercised against a stub.
pub(crate) trait WorkSource {
    /// Pulls routines for the processor identified by `stealer`.
    ///
    /// An idle caller (`core_idle`) may block briefly waiting for work; a
    /// caller that still has a routine to continue returns immediately if
    /// nothing is available.
    fn pull_routines(&self, into: &mut Vec<RoutineBox>, stealer: usize, core_idle: bool);
}

/// A transferable work unit: a FIFO run queue of routines, owned by one
/// executor (or the idle pool) at a time. The queue itself is mutex-guarded
/// so peers can steal from it while the owner keeps consuming.
#[derive(Debug)]
pub(crate) struct Processor {
    id: usize,
    queue: Mutex<VecDeque<RoutineBox>>,
}

impl Processor {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueues a routine at the tail.
    pub fn submit(&self, routine: RoutineBox) {
        self.queue.lock().unwrap().push_back(routine);
    }

    /// Returns true if routines are queued locally, or if some could be
    /// fetched from `source`.
    pub fn has_routines(&self, core_idle: bool, source: &impl WorkSource) -> bool {
        if !self.queue.lock().unwrap().is_empty() {
            return true;
        }
        self.pull_more(core_idle, source)
    }

    fn pull_more(&self, core_idle: bool, source: &impl WorkSource) -> bool {
        let mut more = Vec::new();
        source.pull_routines(&mut more, self.id, core_idle);

        let mut queue = self.queue.lock().unwrap();
        let added = !more.is_empty();
        for routine in more {
            queue.push_back(routine);
        }
        added
    }

    /// Pops the next routine to run, cycling a still-unfinished `current` to
    /// the tail so a burst of yields cannot starve the rest of the queue.
    ///
    /// Returns `None` when no work could be found; `current` is left in
    /// place in that case so the caller can keep running it.
    pub fn next(
        &self,
        current: &mut Option<RoutineBox>,
        source: &impl WorkSource,
    ) -> Option<RoutineBox> {
        let continuing = current.as_ref().is_some_and(|routine| !routine.done());
        if !self.has_routines(!continuing, source) {
            return None;
        }

        let mut queue = self.queue.lock().unwrap();
        let next = queue.pop_front();
        if next.is_some() && continuing {
            let requeued = current.take().expect("continuing routine disappeared");
            queue.push_back(requeued);
        }
        next
    }

    /// Gives up routines for a thief (or for parking): all of them, or the
    /// back half (⌈n/2⌉ stay behind, the rest surrender from the tail, so a
    /// thief contends with the owner's head-biased consumption as little as
    /// possible).
    ///
    /// Returns whether any routines remain locally.
    pub fn surrender(&self, into: &mut Vec<RoutineBox>, all: bool) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let keep = if all { 0 } else { queue.len().div_ceil(2) };
        while queue.len() > keep {
            let stolen = queue.pop_back().expect("queue drained early");
            into.push(stolen);
        }
        keep > 0
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
