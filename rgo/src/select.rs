// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-way choice over channel operations.
//!
//! A [`Select`] collects receive and send cases (plus at most one default)
//! and evaluates them with the channels' non-blocking operations, in
//! declared order. The first ready case runs its action and ends the
//! select; with no ready case the default runs once, or — without a default
//! — the calling routine yields and retries until some case fires.
//!
//! ```no_run
//! use rgo::{Channel, Select};
//!
//! let a = Channel::<u64>::new(1);
//! let b = Channel::<u64>::new(1);
//! Select::new()
//!     .recv(&a, |msg| println!("from a: {msg:?}"))
//!     .recv(&b, |msg| println!("from b: {msg:?}"))
//!     .default(|| println!("nothing ready"))
//!     .run();
//! ```

use crate::channel::{Channel, TryRecv};
use crate::yield_now;

/// A single prepared case: probing runs the action on success.
trait Case {
    fn probe(&mut self) -> bool;
}

struct RecvCase<'a, T, F> {
    channel: &'a Channel<T>,
    action: Option<F>,
}

impl<T, F: FnOnce(Option<T>)> Case for RecvCase<'_, T, F> {
    fn probe(&mut self) -> bool {
        let received = match self.channel.try_recv() {
            TryRecv::Value(value) => Some(value),
            // End-of-channel is a ready outcome, not a stall: the case
            // fires and observes the closure.
            TryRecv::Closed => None,
            TryRecv::Empty => return false,
        };
        let action = self.action.take().expect("select case fired twice");
        action(received);
        true
    }
}

struct SendCase<'a, T, F> {
    channel: &'a Channel<T>,
    value: Option<T>,
    action: Option<F>,
}

impl<T, F: FnOnce()> Case for SendCase<'_, T, F> {
    fn probe(&mut self) -> bool {
        let value = self.value.take().expect("select case fired twice");
        match self.channel.try_send(value) {
            Ok(_) => {
                let action = self.action.take().expect("select case fired twice");
                action();
                true
            }
            Err(returned) => {
                // Busy: keep the value for the next round.
                self.value = Some(returned);
                false
            }
        }
    }
}

/// Builder and evaluator for a multi-way channel choice.
pub struct Select<'a> {
    cases: Vec<Box<dyn Case + 'a>>,
    default_action: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default_action: None,
        }
    }

    /// Adds a receive case. The action observes `Some(value)` for a
    /// received value and `None` for end-of-channel.
    #[must_use]
    pub fn recv<T, F>(mut self, channel: &'a Channel<T>, action: F) -> Self
    where
        T: 'a,
        F: FnOnce(Option<T>) + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            channel,
            action: Some(action),
        }));
        self
    }

    /// Adds a send case. `value` is consumed when (and only when) the case
    /// fires.
    ///
    /// # Panics
    ///
    /// Evaluating a send case on a closed channel panics, exactly like the
    /// underlying send.
    #[must_use]
    pub fn send<T, F>(mut self, channel: &'a Channel<T>, value: T, action: F) -> Self
    where
        T: 'a,
        F: FnOnce() + 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel,
            value: Some(value),
            action: Some(action),
        }));
        self
    }

    /// Adds the default case, which runs once if no other case is ready.
    ///
    /// # Panics
    ///
    /// Panics if a default case was already registered.
    #[must_use]
    pub fn default<F>(mut self, action: F) -> Self
    where
        F: FnOnce() + 'a,
    {
        assert!(
            self.default_action.is_none(),
            "select already has a default case"
        );
        self.default_action = Some(Box::new(action));
        self
    }

    /// Evaluates the select: probe all cases in declared order, run the
    /// first ready one (or the default), otherwise yield and retry.
    ///
    /// # Panics
    ///
    /// Panics on a select with no cases and no default, which could never
    /// make progress.
    pub fn run(mut self) {
        assert!(
            !self.cases.is_empty() || self.default_action.is_some(),
            "select with no cases and no default would block forever"
        );

        loop {
            for case in &mut self.cases {
                if case.probe() {
                    return;
                }
            }

            match self.default_action.take() {
                Some(action) => {
                    action();
                    return;
                }
                None => yield_now(),
            }
        }
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn default_runs_once_when_nothing_is_ready() {
        let a = Channel::<u32>::new(1);
        let b = Channel::<u32>::new(1);
        let hits = Cell::new(0);
        let read = Cell::new(false);

        Select::new()
            .recv(&a, |_| read.set(true))
            .recv(&b, |_| read.set(true))
            .default(|| hits.set(hits.get() + 1))
            .run();

        assert_eq!(hits.get(), 1);
        assert!(!read.get());
    }

    #[test]
    fn first_ready_case_wins_in_declared_order() {
        let a = Channel::new(2);
        let b = Channel::new(2);
        a.try_send(7u32).unwrap();
        a.try_send(8u32).unwrap();
        b.try_send(9u32).unwrap();

        let x = Cell::new(0);
        let y = Cell::new(0);

        Select::new()
            .recv(&a, |msg| x.set(msg.unwrap()))
            .recv(&b, |msg| y.set(msg.unwrap()))
            .run();

        assert_eq!(x.get(), 7);
        assert_eq!(y.get(), 0);
    }

    #[test]
    fn send_case_fires_when_there_is_room() {
        let out = Channel::new(1);
        let sent = Cell::new(false);

        Select::new()
            .send(&out, 42u32, || sent.set(true))
            .default(|| {})
            .run();

        assert!(sent.get());
        assert_eq!(out.try_recv(), crate::TryRecv::Value(42));
    }

    #[test]
    fn busy_send_case_falls_through_to_default() {
        let out = Channel::new(1);
        out.try_send(1u32).unwrap();
        let sent = Cell::new(false);
        let defaulted = Cell::new(false);

        Select::new()
            .send(&out, 2u32, || sent.set(true))
            .default(|| defaulted.set(true))
            .run();

        assert!(!sent.get());
        assert!(defaulted.get());
        // The unfired case kept its value; the channel still holds only the
        // original element.
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn closed_channel_is_a_ready_recv_case() {
        let closed = Channel::<u32>::new(0);
        closed.close();
        let observed = Cell::new(Some(99));

        Select::new().recv(&closed, |msg| observed.set(msg)).run();

        assert_eq!(observed.get(), None);
    }

    #[test]
    #[should_panic(expected = "already has a default case")]
    fn two_default_cases_are_rejected() {
        let _ = Select::new().default(|| {}).default(|| {});
    }

    #[test]
    #[should_panic(expected = "no cases and no default")]
    fn empty_select_is_rejected() {
        Select::new().run();
    }
}
