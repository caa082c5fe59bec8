// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

//  Permission is hereby granted, free of charge, to any person obtaining a
//  copy of this software and associated documentation files (the "Software"),
//  to deal in the Software without restriction, including without limitation
//  the rights to use, copy, modify, merge, publish, distribute, sublicense,
//  and/or sell copies of the Software, and to permit persons to whom the
//  Software is furnished to do so, subject to the following conditions:
//
//  The above copyright notice and this permission notice shall be included in
//  all copies or substantial portions of the Software.
//
//  THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//  OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//  FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//  AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//  LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//  FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//  DEALINGS IN THE SOFTWARE.

//! The stackful coroutine runtime.
//!
//! A coroutine is an owned stack plus a saved machine context: `resume`
//! switches a thread's host stack onto the coroutine's stack, `yield_hold`/
//! `yield_ready` switch back. Context save/restore and stack allocation are
//! delegated to the `context` crate, which does the same job as a
//! `ucontext_t` + `swapcontext` pair through a stable-Rust API.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, Arc};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::{debug, error};

use crate::config;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// A coroutine's lifecycle state. `resume`, `yield_hold`, `yield_ready`,
/// and entry-closure completion are the only transitions; there is no
/// implicit preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Exec = 1,
    Hold = 2,
    Ready = 3,
    Term = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Exec,
            2 => State::Hold,
            3 => State::Ready,
            4 => State::Term,
            _ => State::Except,
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(s: State) -> Self {
        AtomicState(AtomicU8::new(s as u8))
    }
    fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }
    fn store(&self, s: State) {
        self.0.store(s as u8, Ordering::Release);
    }
}

type Entry = dyn FnOnce() + Send + 'static;

struct Inner {
    id: u64,
    name: Option<String>,
    state: AtomicState,
    is_host: bool,
    /// Continuation point to jump *into* — the coroutine's own suspended
    /// position, or a fresh trampoline entry right after `new`/`reset`.
    /// `None` while `Exec`, and always `None` for host coroutines (a host
    /// is never resumed into through a stored `Context`; it's simply
    /// wherever the native call stack happens to be).
    context: Mutex<Option<Context>>,
    /// Where to switch back to when this coroutine yields or finishes.
    /// Populated by the trampoline on entry and refreshed by every
    /// `yield_hold`/`yield_ready`. Only ever touched by the one OS thread
    /// currently running this coroutine.
    host: Mutex<Option<Context>>,
    stack: Mutex<Option<ProtectedFixedSizeStack>>,
    stack_size: u32,
    entry: Mutex<Option<Box<Entry>>>,
}

// SAFETY: `context::Context` wraps a raw stack pointer and is `!Send`/
// `!Sync` on its own, but a coroutine's stack and context are only ever
// touched by whichever single OS thread currently holds it `Exec` (a
// coroutine never migrates between workers, per the scheduler's pinning
// rule); every other field is behind a `Mutex` or is plain `Copy` data.
// Matches `examples/cheme-coroutine-rs/src/coroutine/clonable.rs`'s
// `unsafe impl Send for Coroutine {}`.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// A shared handle to a coroutine. Cloning is cheap (refcount bump); the
/// scheduler FIFO, an fd-event slot, and `Coroutine::current()` can all hold
/// a clone of the same coroutine at once.
#[derive(Clone)]
pub struct Coroutine(Arc<Inner>);

thread_local! {
    /// The coroutine presently executing on this thread, as a non-owning
    /// pointer into its `Arc` allocation. Set only for the duration of the
    /// `ctx.resume(0)` call in `switch_into`, whose own `Coroutine` clone
    /// guarantees the pointee stays alive for that whole window — so this
    /// slot never needs to hold a strong reference itself.
    static CURRENT: Cell<Option<NonNull<Inner>>> = Cell::new(None);
    /// Each thread's lazily-created host coroutine. Unlike `CURRENT` this
    /// is legitimately owning: nothing else keeps it alive, and it has no
    /// path back to whatever is `CURRENT` at a given moment, so there's no
    /// reference cycle to worry about.
    static HOST: RefCell<Option<Coroutine>> = RefCell::new(None);
}

impl Coroutine {
    /// Spawn a new coroutine in `State::Init`. `stack_size` of `0` takes
    /// the process-wide default (`fiber.stack_size`, see [`crate::config`]).
    pub fn new<F>(entry: F, stack_size: u32, name: Option<String>) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 { config::stack_size() } else { stack_size };
        let stack = ProtectedFixedSizeStack::new(size as usize)
            .expect("failed to allocate coroutine stack");
        let ctx = Context::new(&stack, trampoline);

        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        Coroutine(Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            state: AtomicState::new(State::Init),
            is_host: false,
            context: Mutex::new(Some(ctx)),
            host: Mutex::new(None),
            stack: Mutex::new(Some(stack)),
            stack_size: size,
            entry: Mutex::new(Some(Box::new(entry))),
        }))
    }

    fn new_host() -> Coroutine {
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        Coroutine(Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            state: AtomicState::new(State::Exec),
            is_host: true,
            context: Mutex::new(None),
            host: Mutex::new(None),
            stack: Mutex::new(None),
            stack_size: 0,
            entry: Mutex::new(None),
        }))
    }

    /// Rebind a finished coroutine to a new entry without reallocating its
    /// stack. Requires `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.0.state.load();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "reset: coroutine must be Init, Term or Except, was {:?}",
            state
        );
        assert!(!self.0.is_host, "reset: cannot reset a host coroutine");

        let mut stack_guard = self.0.stack.lock().unwrap();
        let stack = stack_guard.as_ref().expect("reset: coroutine has no stack");
        let ctx = Context::new(stack, trampoline);
        drop(stack_guard);

        *self.0.context.lock().unwrap() = Some(ctx);
        *self.0.entry.lock().unwrap() = Some(Box::new(entry));
        self.0.state.store(State::Init);
    }

    /// Switch the calling thread's host stack onto this coroutine's stack.
    /// Returns once the coroutine yields (`Hold`/`Ready`) or finishes
    /// (`Term`/`Except`). Precondition: `self` is not already `Exec`, and
    /// the caller is the host coroutine of the current OS thread.
    pub fn resume(&self) {
        assert_ne!(self.0.state.load(), State::Exec, "resume: coroutine is already executing");
        self.switch_into()
    }

    /// The caller-hosted scheduler's entry primitive: switches the
    /// kernel-thread stack onto the dedicated scheduler coroutine. Kept
    /// distinct from `resume` so the host/task relation in caller-hosted
    /// mode stays legible in a backtrace, even though the underlying switch
    /// mechanics are identical.
    pub fn call(&self) {
        self.resume()
    }

    fn switch_into(&self) {
        let prev_current = CURRENT.with(|c| c.replace(Some(NonNull::from(self.0.as_ref()))));
        let ctx = self
            .0
            .context
            .lock()
            .unwrap()
            .take()
            .expect("resume: coroutine has no continuation to jump into");

        self.0.state.store(State::Exec);
        let Transfer { context, .. } = ctx.resume(0);
        *self.0.context.lock().unwrap() = Some(context);

        CURRENT.with(|c| c.set(prev_current));
    }

    /// Suspend the current (task) coroutine to `State::Ready`: eligible to
    /// be re-dispatched immediately.
    pub fn yield_ready() {
        Self::yield_with(State::Ready)
    }

    /// Suspend the current (task) coroutine to `State::Hold`: waiting for
    /// an external wakeup (an I/O event firing, an explicit resubmit).
    pub fn yield_hold() {
        Self::yield_with(State::Hold)
    }

    /// The caller-hosted scheduler's exit primitive, the mirror of
    /// [`Coroutine::call`]. Switches the dedicated scheduler coroutine back
    /// onto the kernel-thread stack.
    pub fn back() {
        Self::yield_with(State::Hold)
    }

    fn yield_with(state: State) {
        let cur = Self::current();
        assert!(!cur.0.is_host, "yield: cannot yield from a host coroutine");
        cur.0.state.store(state);

        let host_ctx = cur
            .0
            .host
            .lock()
            .unwrap()
            .take()
            .expect("yield: no host context recorded for this coroutine");

        let Transfer { context, .. } = host_ctx.resume(0);
        *cur.0.host.lock().unwrap() = Some(context);
        cur.0.state.store(State::Exec);
    }

    /// The coroutine currently executing on this thread. Lazily creates
    /// this thread's host coroutine the first time it's asked for.
    pub fn current() -> Coroutine {
        if let Some(ptr) = CURRENT.with(|c| c.get()) {
            // SAFETY: `ptr` was stored by `switch_into` for the duration of
            // a live `resume()` call, and that call's own `Coroutine` clone
            // keeps the allocation alive for the whole window. Bumping the
            // strong count hands back an independent, owned clone.
            unsafe {
                Arc::increment_strong_count(ptr.as_ptr());
                return Coroutine(Arc::from_raw(ptr.as_ptr()));
            }
        }
        HOST.with(|h| {
            let mut h = h.borrow_mut();
            if h.is_none() {
                *h = Some(Coroutine::new_host());
            }
            h.clone().unwrap()
        })
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn state(&self) -> State {
        self.0.state.load()
    }

    pub fn stack_size(&self) -> u32 {
        self.0.stack_size
    }

    pub fn is_host(&self) -> bool {
        self.0.is_host
    }

    /// Number of coroutines currently alive, across all threads. A
    /// diagnostic, not part of any invariant.
    pub fn total() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    /// Identity comparison — two handles refer to the same coroutine iff
    /// they share the same backing allocation.
    pub fn same_as(&self, other: &Coroutine) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.load();
        if self.stack.lock().unwrap().is_some() {
            assert!(
                matches!(state, State::Init | State::Term | State::Except),
                "coroutine stack freed while state was {:?}",
                state
            );
        }
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.0.state.load())
            .field("host", &self.0.is_host)
            .finish()
    }
}

/// The trampoline every non-host coroutine's stack starts executing on.
///
/// It runs the entry closure, records `Term`/`Except`, and switches back to
/// the host — permanently. The load-bearing subtlety: the trampoline clones
/// a strong [`Coroutine`] handle purely so `self` stays valid while the
/// entry closure runs, and it **must drop that clone before the final
/// switch**. If it didn't, and this clone were the last surviving strong
/// reference, the final `resume` would jump away forever with a live `Arc`
/// stuck on a stack that never runs its destructors again — a leak
/// disguised as a self-owning cycle. So: drop first, then read the one
/// field we still need (`host`) through the now-raw, technically-dangling
/// pointer, and switch. This is sound only because whatever caused this
/// `resume` in the first place (a FIFO entry, an fd-event slot) holds a
/// second, independent strong reference for the full duration of the call
/// — the pointer is "dangling" in the sense that *this* clone no longer
/// owns it, not in the sense that the memory is actually gone.
extern "C" fn trampoline(t: Transfer) -> ! {
    let coro = Coroutine::current();
    *coro.0.host.lock().unwrap() = Some(t.context);

    let entry = coro
        .0
        .entry
        .lock()
        .unwrap()
        .take()
        .expect("trampoline: coroutine has no entry closure");

    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    match result {
        Ok(()) => {
            debug!("coroutine {} finished", coro.0.id);
            coro.0.state.store(State::Term);
        }
        Err(payload) => {
            let msg = crate::error::panic_message(payload);
            error!(
                "coroutine {} panicked: {}\n{}",
                coro.0.id,
                msg,
                std::backtrace::Backtrace::force_capture()
            );
            coro.0.state.store(State::Except);
        }
    }

    let raw: *const Inner = Arc::as_ptr(&coro.0);
    drop(coro);

    // SAFETY: see the doc comment above — a second strong reference is
    // guaranteed to be alive for the duration of the `resume` call that
    // brought us here, so `raw` still points at live memory for this one
    // read. Nothing touches it afterward.
    let host_ctx = unsafe {
        (*raw)
            .host
            .lock()
            .unwrap()
            .take()
            .expect("trampoline: no host context to return to")
    };

    CURRENT.with(|c| c.set(None));
    let _ = host_ctx.resume(0);
    unreachable!("a terminated coroutine's stack was resumed again");
}

/// Builder for spawning a coroutine with non-default options.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: u32,
}

impl Builder {
    pub fn new() -> Builder {
        Builder { name: None, stack_size: 0 }
    }

    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: u32) -> Builder {
        self.stack_size = size;
        self
    }

    pub fn spawn<F>(self, entry: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::new(entry, self.stack_size, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn ping_pong_three_resumes_logs_in_order() {
        let (tx, rx) = channel();
        let coro = Coroutine::new(
            move || {
                tx.send("A").unwrap();
                Coroutine::yield_hold();
                tx.send("B").unwrap();
                Coroutine::yield_hold();
                tx.send("C").unwrap();
            },
            0,
            None,
        );

        coro.resume();
        coro.resume();
        coro.resume();

        assert_eq!(rx.try_recv().unwrap(), "A");
        assert_eq!(rx.try_recv().unwrap(), "B");
        assert_eq!(rx.try_recv().unwrap(), "C");
        assert_eq!(coro.state(), State::Term);
    }

    #[test]
    fn reset_after_term_behaves_like_new() {
        let coro = Coroutine::new(|| {}, 0, None);
        coro.resume();
        assert_eq!(coro.state(), State::Term);

        let (tx, rx) = channel();
        coro.reset(move || tx.send(42).unwrap());
        assert_eq!(coro.state(), State::Init);
        coro.resume();
        assert_eq!(coro.state(), State::Term);
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn panicking_entry_transitions_to_except() {
        let coro = Coroutine::new(|| panic!("boom"), 0, None);
        coro.resume();
        assert_eq!(coro.state(), State::Except);
    }

    #[test]
    fn yield_ready_then_resume_continues_past_yield_point() {
        let (tx, rx) = channel();
        let coro = Coroutine::new(
            move || {
                tx.send(1).unwrap();
                Coroutine::yield_ready();
                tx.send(2).unwrap();
            },
            0,
            None,
        );
        coro.resume();
        assert_eq!(coro.state(), State::Ready);
        coro.resume();
        assert_eq!(coro.state(), State::Term);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn current_outside_any_coroutine_is_the_host() {
        let host = Coroutine::current();
        assert!(host.is_host());
        assert_eq!(host.state(), State::Exec);
    }
}
