// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Support for suspendable OS-level execution contexts.
//!
//! This crate provides the [`Context`]: a saved register snapshot plus an
//! owned [`Stack`](stack::Stack) that a scheduler can switch into and out of.
//! It is the stackful foundation the `rgo` runtime multiplexes its routines
//! on, in the same role `fiber` plays for stackful coroutines in k23 — here
//! realised over the POSIX `ucontext` primitives because the runtime also
//! needs per-context *signal masks* (the preemption timer signal must stay
//! masked inside scheduler code, and `swapcontext` switches the mask
//! atomically with the registers).
//!
//! Two context kinds exist, mirroring the two kinds of code the runtime
//! runs:
//!
//! * [`ContextKind::Routine`]: a large stack for user code; the yield signal
//!   is deliverable so a long-running routine can be preempted.
//! * [`ContextKind::Scheduler`]: a small stack for the per-worker scheduling
//!   loop; both the timer signal and the yield signal are masked, so
//!   scheduler code is never interrupted by its own preemption machinery.
//!
//! The switch primitives are deliberately minimal: [`swap`] (save the
//! current state, resume another context) and [`set`] (resume another
//! context without saving). Everything else — run queues, preemption,
//! work stealing — lives in the runtime crate.

#[cfg(not(unix))]
compile_error!("rgo-context only supports unix targets");

pub mod stack;

use std::io::Error;
use std::{fmt, mem, ptr};

use crate::stack::Stack;

/// Entry point of a [`Context`]: a plain function the first switch into the
/// context starts executing. State is passed out of band (the runtime keys
/// off thread-local storage), because `makecontext` argument passing cannot
/// carry pointers portably.
pub type Entry = extern "C" fn();

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// The realtime signal driving the runtime's periodic preemption
        /// timer. Masked in every context; only the designated timer thread
        /// keeps it deliverable.
        pub fn timer_signal() -> libc::c_int {
            libc::SIGRTMIN()
        }
    } else {
        /// Fallback for unixes without realtime signals.
        pub fn timer_signal() -> libc::c_int {
            libc::SIGALRM
        }
    }
}

/// The signal that asks a worker thread to yield its running routine back to
/// the scheduler. Deliverable only inside [`ContextKind::Routine`] contexts.
pub const YIELD_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Distinguishes the two flavours of execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// Runs user code on a large stack; preemptable via [`YIELD_SIGNAL`].
    Routine,
    /// Runs the per-worker scheduling loop on a small stack; both signals
    /// masked.
    Scheduler,
}

/// A suspendable execution context: saved machine state plus its own stack.
///
/// A `Context` is always heap-allocated ([`Context::new`] returns a `Box`)
/// and must never be moved out of its allocation: on common targets the
/// saved `ucontext_t` contains a pointer into itself (the FPU state area),
/// so the snapshot is only valid at the address it was saved at. Passing the
/// `Box` around is fine.
pub struct Context {
    ucontext: libc::ucontext_t,
    kind: ContextKind,
    stack: Option<Stack>,
}

// Safety: a `Context` is only ever resumed by the runtime while it has
// exclusive ownership of it; the raw pointers inside `ucontext_t` refer to
// the context's own stack and FPU area, which move with the allocation's
// ownership, not with any particular thread.
unsafe impl Send for Context {}

impl Context {
    /// Creates a context of the given kind with a fresh stack of (at least)
    /// `stack_size` bytes, entering `entry` on first switch.
    ///
    /// `link` is the successor context control falls into if `entry` ever
    /// returns. A context without a successor must never return from its
    /// entry (the process would exit).
    ///
    /// The caller keeps `link` alive for as long as this context can still
    /// return into it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if stack allocation or context initialisation
    /// fails.
    pub fn new(
        kind: ContextKind,
        stack_size: usize,
        entry: Entry,
        link: Option<&Context>,
    ) -> std::io::Result<Box<Self>> {
        let stack = Stack::new(stack_size)?;
        // Safety: `ucontext_t` is a plain-old-data struct as far as zero
        // initialisation is concerned; `getcontext` in `init` fills it in.
        let ucontext = unsafe { mem::zeroed() };

        let mut ctx = Box::new(Self {
            ucontext,
            kind,
            stack: Some(stack),
        });
        ctx.init(entry, link)?;
        Ok(ctx)
    }

    /// Creates an anchor: a stackless context that serves purely as a save
    /// slot for [`swap`]. Switching into an anchor that has never been saved
    /// to is undefined; a worker thread saves into its anchor once on
    /// startup and resumes it to exit cleanly.
    pub fn anchor() -> Box<Self> {
        // Safety: as in `new`; an anchor is only ever filled by a
        // `swapcontext` save, never by `makecontext`.
        let ucontext = unsafe { mem::zeroed() };
        Box::new(Self {
            ucontext,
            kind: ContextKind::Scheduler,
            stack: None,
        })
    }

    /// Re-initialises this context in place, reusing its stack buffer.
    ///
    /// A context keeps its kind for life; re-initialising with a different
    /// kind is a programming error.
    ///
    /// # Errors
    ///
    /// Returns the OS error if context initialisation fails.
    ///
    /// # Panics
    ///
    /// Panics if `kind` differs from the kind the context was created with.
    pub fn reinit(
        &mut self,
        kind: ContextKind,
        entry: Entry,
        link: Option<&Context>,
    ) -> std::io::Result<()> {
        assert_eq!(
            kind, self.kind,
            "a context cannot change kind on re-initialisation"
        );
        self.init(entry, link)
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    fn init(&mut self, entry: Entry, link: Option<&Context>) -> std::io::Result<()> {
        let stack = self
            .stack
            .as_ref()
            .expect("anchor contexts cannot be initialised with an entry point");

        // Safety: `self.ucontext` is valid for writes; `getcontext` only
        // snapshots the calling thread's state into it.
        unsafe {
            if libc::getcontext(&mut self.ucontext) != 0 {
                return Err(Error::last_os_error());
            }
        }

        self.ucontext.uc_stack.ss_sp = stack.limit().cast();
        self.ucontext.uc_stack.ss_size = stack.size();
        self.ucontext.uc_stack.ss_flags = 0;

        // The timer signal is masked in every context; only the runtime's
        // timer thread consumes it. Scheduler contexts additionally mask the
        // yield signal: the scheduling loop must not be asked to yield.
        // Safety: `uc_sigmask` is a valid sigset for the sigset ops below.
        unsafe {
            libc::sigemptyset(&mut self.ucontext.uc_sigmask);
            libc::sigaddset(&mut self.ucontext.uc_sigmask, timer_signal());
            if self.kind == ContextKind::Scheduler {
                libc::sigaddset(&mut self.ucontext.uc_sigmask, YIELD_SIGNAL);
            }
        }

        self.ucontext.uc_link = match link {
            Some(next) => ptr::from_ref(&next.ucontext).cast_mut(),
            None => ptr::null_mut(),
        };

        // Safety: stack and successor are set up above; `entry` takes no
        // arguments so argc = 0 is correct.
        unsafe {
            libc::makecontext(&mut self.ucontext, entry, 0);
        }

        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.kind)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// Save-and-swap: snapshots the calling state into `save` and resumes
/// `resume`. Returns when something later switches back into `save`.
///
/// # Errors
///
/// Returns the OS error if the underlying `swapcontext` fails; on success
/// the call returns only once the saved context is resumed.
///
/// # Safety
///
/// `resume` must hold a valid saved or initialised state, its stack must not
/// be in use by any other thread, and both contexts must stay at their
/// current addresses until the switch completes.
pub unsafe fn swap(save: &mut Context, resume: &Context) -> std::io::Result<()> {
    // Safety: preconditions forwarded to the caller.
    let ret = unsafe { libc::swapcontext(&mut save.ucontext, &resume.ucontext) };
    if ret != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Unconditional set: resumes `resume` without saving the calling state.
/// The calling stack frame is abandoned and never returned to.
///
/// # Safety
///
/// Same requirements as [`swap`]; additionally the caller must be prepared
/// to never run again past this point.
pub unsafe fn set(resume: &Context) -> ! {
    // Safety: preconditions forwarded to the caller.
    unsafe {
        libc::setcontext(&resume.ucontext);
    }
    unreachable!("setcontext returned: {}", Error::last_os_error());
}
