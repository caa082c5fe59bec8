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

//! The M:N scheduler: a pool of worker threads draining a shared FIFO
//! of coroutines and callables.
//!
//! A worker's only job is the dispatch loop: pull one runnable task under
//! the FIFO mutex, resume it, look at where it landed, repeat. There is no
//! work-stealing and no priority — FIFO order is the whole fairness story.
//! [`Hooks`] is the seam [`crate::io_manager::IoManager`] overrides to turn
//! idle workers into epoll waiters instead of plain spinners.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::coroutine::{Coroutine, State};
use crate::task::{Task, Work};

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
    static WORKER_ID: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
}

/// The extension points a specialization of the base FIFO dispatcher can
/// override. `notify` wakes whatever an idle worker might be blocked in;
/// `is_stopped` extends the base "nothing left to do" predicate; `idle_body`
/// replaces the default busy-yield loop with something that actually waits
/// for work (a kernel readiness poll, for instance).
pub(crate) trait Hooks: Send + Sync {
    fn notify(&self, sched: &Scheduler);
    fn is_stopped(&self, sched: &Scheduler) -> bool;
    fn idle_body(&self, sched: &Scheduler);

    /// Called once at the top of each worker's dispatch loop (and once for
    /// the caller-hosted dispatch coroutine, on its first `call()`), before
    /// anything is dequeued. A specialization that keeps its own
    /// thread-local "current instance" pointer sets it here.
    fn on_worker_enter(&self, _sched: &Scheduler) {}
}

struct DefaultHooks;

impl Hooks for DefaultHooks {
    fn notify(&self, _sched: &Scheduler) {}

    fn is_stopped(&self, sched: &Scheduler) -> bool {
        sched.core_is_stopped()
    }

    fn idle_body(&self, sched: &Scheduler) {
        while !sched.is_stopped() {
            Coroutine::yield_hold();
        }
    }
}

struct Shared {
    name: String,
    fifo: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    use_caller: bool,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    running: AtomicBool,
    auto_stop: AtomicBool,
    caller_coroutine: Mutex<Option<Coroutine>>,
    hooks: Mutex<Arc<dyn Hooks>>,
}

/// A handle to a scheduler. Cloning is cheap; worker threads, the
/// caller-hosted dispatch coroutine, and `Scheduler::current()` all hold
/// independent clones of the same underlying state.
#[derive(Clone)]
pub struct Scheduler(Arc<Shared>);

impl Scheduler {
    /// `worker_count` must be at least 1. If `use_caller`, one of those
    /// slots is filled by the thread calling `new` rather than a spawned OS
    /// thread — a dedicated dispatch coroutine is created on this thread
    /// right away, to be entered later by `start`/`stop`.
    pub fn new(worker_count: usize, use_caller: bool, name: impl Into<String>) -> Scheduler {
        assert!(worker_count >= 1, "Scheduler::new: worker_count must be >= 1");
        let name = name.into();

        let sched = Scheduler(Arc::new(Shared {
            name,
            fifo: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            worker_count,
            use_caller,
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            caller_coroutine: Mutex::new(None),
            hooks: Mutex::new(Arc::new(DefaultHooks)),
        }));

        if use_caller {
            // Recruiting the calling thread as a worker requires it to
            // already have a host coroutine to switch away from.
            let _ = Coroutine::current();
            let caller = sched.clone();
            let caller_name = format!("{}-caller", sched.name());
            let coro = Coroutine::new(
                move || dispatch_loop(caller, 0),
                0,
                Some(caller_name),
            );
            *sched.0.caller_coroutine.lock().unwrap() = Some(coro);
        }

        sched
    }

    pub(crate) fn set_hooks(&self, hooks: Arc<dyn Hooks>) {
        *self.0.hooks.lock().unwrap() = hooks;
    }

    fn hooks(&self) -> Arc<dyn Hooks> {
        self.0.hooks.lock().unwrap().clone()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn worker_count(&self) -> usize {
        self.0.worker_count
    }

    pub fn active_workers(&self) -> usize {
        self.0.active_workers.load(Ordering::Acquire)
    }

    pub fn idle_workers(&self) -> usize {
        self.0.idle_workers.load(Ordering::Acquire)
    }

    /// The base "nothing left to do" predicate: `auto_stop` is set,
    /// `running` is false, the FIFO is empty, and no worker is mid-task.
    /// [`Hooks::is_stopped`] may extend this with more conditions.
    pub(crate) fn core_is_stopped(&self) -> bool {
        self.0.auto_stop.load(Ordering::Acquire)
            && !self.0.running.load(Ordering::Acquire)
            && self.0.fifo.lock().unwrap().is_empty()
            && self.active_workers() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.hooks().is_stopped(self)
    }

    pub(crate) fn notify(&self) {
        self.hooks().notify(self)
    }

    fn idle_body(&self) {
        self.hooks().idle_body(self)
    }

    /// Enqueue one unit of work, optionally pinned to a specific worker id.
    /// Wakes a worker iff the FIFO was empty before this insertion.
    pub fn submit(&self, work: Work, pinned: Option<usize>) {
        let was_empty = {
            let mut fifo = self.0.fifo.lock().unwrap();
            let was_empty = fifo.is_empty();
            fifo.push_back(Task::new(work, pinned));
            was_empty
        };
        if was_empty {
            self.notify();
        }
    }

    /// Enqueue a batch of work items as a single FIFO-lock acquisition.
    /// Wakes a worker at most once, iff the FIFO was empty beforehand.
    pub fn submit_batch<I>(&self, works: I)
    where
        I: IntoIterator<Item = (Work, Option<usize>)>,
    {
        let was_empty = {
            let mut fifo = self.0.fifo.lock().unwrap();
            let was_empty = fifo.is_empty();
            for (work, pinned) in works {
                fifo.push_back(Task::new(work, pinned));
            }
            was_empty
        };
        if was_empty {
            self.notify();
        }
    }

    /// Idempotent. Spawns the worker threads this scheduler hasn't already
    /// spawned; a caller-hosted scheduler still needs `stop()` to actually
    /// enter its dispatch coroutine.
    pub fn start(&self) {
        if self.0.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.0.auto_stop.store(false, Ordering::Release);

        let mut threads = self.0.threads.lock().unwrap();
        assert!(threads.is_empty(), "Scheduler::start: worker threads already running");

        let base_id = if self.0.use_caller { 1 } else { 0 };
        let spawn_count = self.0.worker_count - base_id;
        for offset in 0..spawn_count {
            let worker_id = base_id + offset;
            let sched = self.clone();
            let thread_name = format!("{}-{}", self.0.name, worker_id);
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || dispatch_loop(sched, worker_id))
                .expect("Scheduler::start: failed to spawn worker thread");
            threads.push(handle);
        }
        debug!("scheduler {} started with {} spawned workers", self.0.name, spawn_count);
    }

    /// Sets `auto_stop`, stops accepting new dispatch cycles, wakes every
    /// worker (plus the caller-hosted slot, if any) and joins them all.
    pub fn stop(&self) {
        self.0.auto_stop.store(true, Ordering::Release);
        self.0.running.store(false, Ordering::Release);

        let wakeups = self.0.worker_count + if self.0.use_caller { 1 } else { 0 };
        for _ in 0..wakeups {
            self.notify();
        }

        if self.0.use_caller {
            let coro = self
                .0
                .caller_coroutine
                .lock()
                .unwrap()
                .clone()
                .expect("Scheduler::stop: caller-hosted scheduler has no dispatch coroutine");
            if !matches!(coro.state(), State::Term | State::Except) {
                coro.call();
            }
        }

        let threads = {
            let mut threads = self.0.threads.lock().unwrap();
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            if let Err(e) = handle.join() {
                warn!("scheduler {} worker thread panicked: {:?}", self.0.name, e);
            }
        }
        debug!("scheduler {} stopped", self.0.name);
    }

    /// The scheduler owning the worker (or caller-hosted dispatch coroutine)
    /// currently executing on this thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The id of the worker currently executing on this thread, if this
    /// thread is running a dispatch loop.
    pub fn current_worker_id() -> Option<usize> {
        WORKER_ID.with(|w| w.get())
    }
}

fn dispatch_loop(sched: Scheduler, worker_id: usize) {
    CURRENT.with(|c| *c.borrow_mut() = Some(sched.clone()));
    WORKER_ID.with(|w| w.set(Some(worker_id)));
    sched.hooks().on_worker_enter(&sched);

    let idle_name = format!("{}-idle-{}", sched.name(), worker_id);
    let idle = {
        let sched = sched.clone();
        Coroutine::new(move || sched.idle_body(), 0, Some(idle_name))
    };
    let mut callable_slot: Option<Coroutine> = None;

    loop {
        let (task, need_notify) = {
            let mut fifo = sched.0.fifo.lock().unwrap();
            let mut picked = None;
            let mut need_notify = false;
            let mut idx = 0;
            while idx < fifo.len() {
                let pinned_elsewhere = matches!(fifo[idx].pinned, Some(p) if p != worker_id);
                if pinned_elsewhere {
                    need_notify = true;
                    idx += 1;
                    continue;
                }
                let running_elsewhere =
                    matches!(&fifo[idx].work, Work::Coroutine(c) if c.state() == State::Exec);
                if running_elsewhere {
                    idx += 1;
                    continue;
                }
                picked = fifo.remove(idx);
                break;
            }
            if picked.is_some() {
                sched.0.active_workers.fetch_add(1, Ordering::AcqRel);
            }
            (picked, need_notify)
        };

        if need_notify {
            sched.notify();
        }

        match task {
            Some(task) => {
                dispatch_task(&sched, task, &mut callable_slot);
                sched.0.active_workers.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                sched.0.idle_workers.fetch_add(1, Ordering::AcqRel);
                idle.resume();
                sched.0.idle_workers.fetch_sub(1, Ordering::AcqRel);
                if idle.state() == State::Term {
                    break;
                }
            }
        }
    }

    CURRENT.with(|c| *c.borrow_mut() = None);
    WORKER_ID.with(|w| w.set(None));
}

fn dispatch_task(sched: &Scheduler, task: Task, callable_slot: &mut Option<Coroutine>) {
    let pinned = task.pinned;
    match task.work {
        Work::Coroutine(coro) => {
            if matches!(coro.state(), State::Term | State::Except) {
                return;
            }
            coro.resume();
            if coro.state() == State::Ready {
                sched.submit(Work::Coroutine(coro), pinned);
            }
        }
        Work::Callable(f) => {
            let coro = match callable_slot.take() {
                Some(existing) => {
                    existing.reset(f);
                    existing
                }
                None => Coroutine::new(f, 0, None),
            };
            coro.resume();
            match coro.state() {
                State::Ready => {
                    sched.submit(Work::Coroutine(coro), pinned);
                }
                State::Term | State::Except => {
                    coro.reset(|| {});
                    *callable_slot = Some(coro);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    #[test]
    fn submitted_callable_runs_to_completion() {
        let sched = Scheduler::new(2, false, "test-basic");
        let (tx, rx) = std::sync::mpsc::channel();
        sched.start();
        sched.submit(
            Work::from_fn(move || {
                let _ = tx.send(());
            }),
            None,
        );
        rx.recv_timeout(Duration::from_secs(2)).expect("callable never ran");
        sched.stop();
        assert_eq!(sched.active_workers(), 0);
    }

    #[test]
    fn self_resubmitting_callable_runs_exactly_n_times() {
        let sched = Scheduler::new(3, false, "test-resubmit");
        let counter = Arc::new(AtomicI64::new(5));
        sched.start();

        fn step(sched: Scheduler, counter: Arc<AtomicI64>) {
            let remaining = counter.fetch_sub(1, Ordering::SeqCst);
            if remaining > 0 {
                let sched2 = sched.clone();
                let counter2 = counter.clone();
                sched.submit(Work::from_fn(move || step(sched2.clone(), counter2.clone())), None);
            }
        }
        step(sched.clone(), counter.clone());

        thread::sleep(Duration::from_millis(300));
        sched.stop();
        // pre-decrement values observed: 5,4,3,2,1,0 — six invocations,
        // matching spec scenario 2's "exactly 6 invocations".
        assert_eq!(counter.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn pinned_task_runs_on_its_pinned_worker() {
        let sched = Scheduler::new(2, false, "test-pin");
        sched.start();
        let (tx, rx) = std::sync::mpsc::channel();
        sched.submit(
            Work::from_fn(move || {
                let _ = tx.send(Scheduler::current_worker_id());
            }),
            Some(1),
        );
        let observed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        sched.stop();
        assert_eq!(observed, Some(1));
    }

    #[test]
    fn stop_drains_all_queued_callables() {
        let sched = Scheduler::new(4, false, "test-drain");
        let completed = Arc::new(AtomicUsize::new(0));
        sched.start();
        for _ in 0..100 {
            let completed = completed.clone();
            sched.submit(Work::from_fn(move || { completed.fetch_add(1, Ordering::SeqCst); }), None);
        }
        sched.stop();
        assert_eq!(completed.load(Ordering::SeqCst), 100);
        assert_eq!(sched.active_workers(), 0);
    }
}
