// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed FIFO communication ports.
//!
//! A [`Channel`] is a cloneable handle to shared state: a bounded FIFO
//! buffer (capacity 0 means rendezvous), a single-cell rendezvous slot, and
//! a state bitmask, all guarded by a [`SpinYieldLock`] so contended channel
//! operations cooperate with the scheduler instead of blocking the OS
//! thread.
//!
//! Blocking operations never block the worker thread either: they loop over
//! the non-blocking path and yield to the scheduler whenever no progress is
//! possible, which is what lets thousands of routines wait on channels from
//! a handful of workers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::sync::SpinYieldLock;
use crate::yield_now;

bitflags::bitflags! {
    /// Channel state bits. CLOSED is terminal; the blocking bits are
    /// bookkeeping that blocking operations maintain around their retry
    /// loops.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct State: u8 {
        /// Some sender is currently attempting progress.
        const WRITER_BLOCKING = 1 << 0;
        /// Some receiver is currently attempting progress.
        const READER_BLOCKING = 1 << 1;
        /// The rendezvous slot holds a value awaiting consumption.
        const WRITE_COMPLETE = 1 << 2;
        /// The channel has been closed.
        const CLOSED = 1 << 3;
    }
}

/// Outcome of a successful non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// The value was appended to the buffer; the sender is free.
    Buffered,
    /// The value was deposited in the rendezvous slot; a blocking sender
    /// must now park until a receiver consumes it.
    Handoff,
}

/// Outcome of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecv<T> {
    /// A value was received.
    Value(T),
    /// No value available right now; the channel may still produce more.
    Empty,
    /// The channel is closed and drained: end-of-channel.
    Closed,
}

struct Core<T> {
    state: State,
    /// Rendezvous slot, used only by capacity-0 channels. Full exactly when
    /// WRITE_COMPLETE is set.
    slot: Option<T>,
    buffer: VecDeque<T>,
}

struct Shared<T> {
    capacity: usize,
    core: SpinYieldLock<Core<T>>,
}

/// A typed FIFO port shared between routines.
///
/// Handles are cheap to clone; the channel lives as long as its longest
/// lived holder. Capacity 0 makes the channel a rendezvous: every send pairs
/// with exactly one receive, and a blocking sender does not return until its
/// value was taken.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Channel<T> {
    /// Creates a channel. `capacity` 0 means unbuffered rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                core: SpinYieldLock::new(Core {
                    state: State::empty(),
                    slot: None,
                    buffer: VecDeque::new(),
                }),
            }),
        }
    }

    /// Attempts to send without blocking.
    ///
    /// Returns [`Sent::Buffered`] when the value went into the buffer,
    /// [`Sent::Handoff`] when it went into the rendezvous slot (a blocking
    /// sender must wait for consumption), or hands the value back in `Err`
    /// when the channel is full/busy.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed: sending on a closed channel is a
    /// programming error.
    pub fn try_send(&self, value: T) -> Result<Sent, T> {
        let mut core = self.shared.core.lock();

        assert!(
            !core.state.contains(State::CLOSED),
            "send on closed channel"
        );

        if self.shared.capacity > 0 && core.buffer.len() < self.shared.capacity {
            core.buffer.push_back(value);
            return Ok(Sent::Buffered);
        }

        if self.shared.capacity == 0 && !core.state.contains(State::WRITE_COMPLETE) {
            core.slot = Some(value);
            core.state.insert(State::WRITE_COMPLETE);
            return Ok(Sent::Handoff);
        }

        Err(value)
    }

    /// Sends, yielding to the scheduler until the value is delivered.
    ///
    /// On a rendezvous channel this returns only after a receiver has
    /// consumed the value.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed.
    pub fn send(&self, value: T) {
        self.flag(State::WRITER_BLOCKING, true);

        let mut value = Some(value);
        loop {
            match self.try_send(value.take().expect("send retried after success")) {
                Ok(Sent::Buffered) => break,
                Ok(Sent::Handoff) => {
                    // Park until the receiver takes the slot.
                    while self.state().contains(State::WRITE_COMPLETE) {
                        yield_now();
                    }
                    break;
                }
                Err(returned) => {
                    value = Some(returned);
                    yield_now();
                }
            }
        }

        self.flag(State::WRITER_BLOCKING, false);
    }

    /// Attempts to receive without blocking.
    ///
    /// Buffered values drain first, then the rendezvous slot (releasing a
    /// parked sender); a closed, drained channel reports
    /// [`TryRecv::Closed`].
    pub fn try_recv(&self) -> TryRecv<T> {
        let mut core = self.shared.core.lock();

        if let Some(value) = core.buffer.pop_front() {
            return TryRecv::Value(value);
        }

        if core.state.contains(State::WRITE_COMPLETE) {
            let value = core
                .slot
                .take()
                .expect("rendezvous slot empty despite WRITE_COMPLETE");
            core.state.remove(State::WRITE_COMPLETE);
            return TryRecv::Value(value);
        }

        if core.state.contains(State::CLOSED) {
            return TryRecv::Closed;
        }

        TryRecv::Empty
    }

    /// Receives, yielding to the scheduler until a value or end-of-channel
    /// arrives. `None` means the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.flag(State::READER_BLOCKING, true);

        let received = loop {
            match self.try_recv() {
                TryRecv::Value(value) => break Some(value),
                TryRecv::Closed => break None,
                TryRecv::Empty => yield_now(),
            }
        };

        self.flag(State::READER_BLOCKING, false);
        received
    }

    /// Closes the channel. Terminal: subsequent sends panic; receivers
    /// drain whatever is still buffered (including an unconsumed rendezvous
    /// value) and then observe end-of-channel.
    pub fn close(&self) {
        self.shared.core.lock().state.insert(State::CLOSED);
    }

    pub fn is_closed(&self) -> bool {
        self.state().contains(State::CLOSED)
    }

    /// Number of values currently queued (buffer plus rendezvous slot).
    pub fn len(&self) -> usize {
        let core = self.shared.core.lock();
        core.buffer.len() + usize::from(core.slot.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether some sender is currently inside a blocking send.
    pub fn has_blocked_sender(&self) -> bool {
        self.state().contains(State::WRITER_BLOCKING)
    }

    /// Whether some receiver is currently inside a blocking receive.
    pub fn has_blocked_receiver(&self) -> bool {
        self.state().contains(State::READER_BLOCKING)
    }

    fn state(&self) -> State {
        self.shared.core.lock().state
    }

    fn flag(&self, flag: State, set: bool) {
        let mut core = self.shared.core.lock();
        core.state.set(flag, set);
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("queued", &(core.buffer.len() + usize::from(core.slot.is_some())))
            .field("state", &core.state)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Channel<u32>: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn buffered_values_arrive_in_order() {
        let channel = Channel::new(3);
        for i in 0..3 {
            assert_eq!(channel.try_send(i), Ok(Sent::Buffered));
        }
        assert_eq!(channel.try_send(99), Err(99));

        for i in 0..3 {
            assert_eq!(channel.try_recv(), TryRecv::Value(i));
        }
        assert_eq!(channel.try_recv(), TryRecv::Empty);
    }

    #[test]
    fn rendezvous_slot_admits_one_value_at_a_time() {
        let channel = Channel::new(0);
        assert_eq!(channel.try_send(1), Ok(Sent::Handoff));
        // The slot is full; a second sender is busy.
        assert_eq!(channel.try_send(2), Err(2));

        assert_eq!(channel.try_recv(), TryRecv::Value(1));
        assert_eq!(channel.try_recv(), TryRecv::Empty);

        // Slot free again: strict one-to-one pairing.
        assert_eq!(channel.try_send(2), Ok(Sent::Handoff));
        assert_eq!(channel.try_recv(), TryRecv::Value(2));
    }

    #[test]
    fn close_drains_before_reporting_end_of_channel() {
        let channel = Channel::new(4);
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();
        channel.close();

        assert_eq!(channel.try_recv(), TryRecv::Value(1));
        assert_eq!(channel.try_recv(), TryRecv::Value(2));
        assert_eq!(channel.try_recv(), TryRecv::Closed);
        assert_eq!(channel.try_recv(), TryRecv::Closed);
    }

    #[test]
    fn close_preserves_an_unconsumed_rendezvous_value() {
        let channel = Channel::new(0);
        channel.try_send(7).unwrap();
        channel.close();

        assert_eq!(channel.try_recv(), TryRecv::Value(7));
        assert_eq!(channel.try_recv(), TryRecv::Closed);
    }

    #[test]
    #[should_panic(expected = "send on closed channel")]
    fn sending_on_a_closed_channel_panics() {
        let channel = Channel::new(1);
        channel.close();
        let _ = channel.try_send(1);
    }

    #[test]
    fn blocking_recv_returns_none_after_close() {
        let channel = Channel::<u32>::new(0);
        channel.close();
        assert_eq!(channel.recv(), None);
    }

    // Off the worker pool, blocking operations degrade to spin-with-
    // thread-yield, so plain std threads can exercise them.
    #[test]
    fn blocking_send_recv_across_threads() {
        let channel = Channel::new(0);
        let sender = channel.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                sender.send(i);
            }
            sender.close();
        });

        let mut seen = Vec::new();
        while let Some(value) = channel.recv() {
            seen.push(value);
        }
        handle.join().unwrap();

        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn rendezvous_sender_parks_until_consumed() {
        let channel = Channel::new(0);
        let sender = channel.clone();
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);

        let handle = std::thread::spawn(move || {
            sender.send(42);
            flag.store(true, Ordering::SeqCst);
        });

        // The sender can deposit, but must not return before we consume.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!delivered.load(Ordering::SeqCst));

        assert_eq!(channel.recv(), Some(42));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !delivered.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "sender never unparked");
            std::thread::yield_now();
        }
        handle.join().unwrap();
    }
}
