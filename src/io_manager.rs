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

//! An epoll-backed specialization of the scheduler: suspend a task
//! coroutine (or hold a callback) until a file descriptor becomes
//! readable/writable, then re-queue its continuation onto the scheduler.
//!
//! Built entirely on top of [`crate::scheduler`]'s extension hooks rather
//! than subclassing (Rust has no inheritance): an [`IoManager`] owns a
//! plain [`Scheduler`] and installs a [`Hooks`] implementation that turns
//! idle workers into `epoll_wait` callers and makes `notify()` write a byte
//! down a self-pipe instead of doing nothing.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, warn};

use crate::coroutine::{Coroutine, State};
use crate::error::{Error, Result};
use crate::scheduler::{Hooks, Scheduler};
use crate::task::Work;

const INITIAL_FD_TABLE_SIZE: usize = 32;
const EPOLL_BATCH: usize = 64;
const EPOLL_TIMEOUT_MS: i32 = 5000;
/// `epoll_event.u64` value reserved for the wakeup pipe's registration; no
/// fd-context slot ever lives at address zero, so it doubles as a sentinel.
const WAKEUP_COOKIE: u64 = 0;

/// A readiness kind a descriptor can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    fn bit(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

enum Continuation {
    Coroutine(Coroutine),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct EventSlot {
    scheduler: Scheduler,
    continuation: Continuation,
}

fn fire(slot: EventSlot) {
    let work = match slot.continuation {
        Continuation::Coroutine(c) => Work::from_coroutine(c),
        Continuation::Callback(cb) => Work::Callable(cb),
    };
    slot.scheduler.submit(work, None);
}

struct FdContext {
    fd: RawFd,
    armed: u32,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext { fd, armed: 0, read: None, write: None }
    }

    fn slot_mut(&mut self, event: Event) -> &mut Option<EventSlot> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// `size = max(current_size, fd + 1) * 3 / 2` — grows far enough to cover
/// `fd`, not the `fd * 1.5` rule that undershoots when the table starts
/// small and a large fd arrives first.
fn grown_table_size(current_size: usize, fd: usize) -> usize {
    std::cmp::max(current_size, fd + 1) * 3 / 2
}

struct Inner {
    epoll_fd: RawFd,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    fds: RwLock<Vec<Arc<Mutex<FdContext>>>>,
    pending_events: AtomicUsize,
}

impl Inner {
    fn ensure_slot(&self, fd: RawFd) -> Arc<Mutex<FdContext>> {
        let idx = fd as usize;
        {
            let table = self.fds.read().unwrap();
            if idx < table.len() {
                return table[idx].clone();
            }
        }
        let mut table = self.fds.write().unwrap();
        if idx >= table.len() {
            let target = grown_table_size(table.len(), idx);
            table.reserve(target - table.len());
            while table.len() < target {
                let next_fd = table.len() as RawFd;
                table.push(Arc::new(Mutex::new(FdContext::new(next_fd))));
            }
        }
        table[idx].clone()
    }

    fn lookup_slot(&self, fd: RawFd) -> Option<Arc<Mutex<FdContext>>> {
        let table = self.fds.read().unwrap();
        table.get(fd as usize).cloned()
    }

    fn rearm(&self, fd: RawFd, cookie: u64, mask: u32, op: libc::c_int) -> io::Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = mask | libc::EPOLLET as u32;
        ev.u64 = cookie;
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wakeup_read);
            libc::close(self.wakeup_write);
        }
    }
}

thread_local! {
    static CURRENT_INNER: RefCell<Option<Arc<Inner>>> = RefCell::new(None);
}

/// A handle to an I/O manager. Cloning is cheap, same as [`Scheduler`].
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler,
    inner: Arc<Inner>,
}

impl IoManager {
    /// Creates the epoll descriptor and self-pipe wakeup channel, allocates
    /// the initial fd table, and starts the underlying scheduler. Mirrors
    /// the order of operations of the original's `IOManager` constructor.
    pub fn new(worker_count: usize, use_caller: bool, name: impl Into<String>) -> Result<IoManager> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::Io(err));
        }
        let (wakeup_read, wakeup_write) = (pipe_fds[0], pipe_fds[1]);

        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = (libc::EPOLLIN | libc::EPOLLET) as u32;
        ev.u64 = WAKEUP_COOKIE;
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wakeup_read, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wakeup_read);
                libc::close(wakeup_write);
            }
            return Err(Error::Io(err));
        }

        let fds = (0..INITIAL_FD_TABLE_SIZE)
            .map(|fd| Arc::new(Mutex::new(FdContext::new(fd as RawFd))))
            .collect();

        let inner = Arc::new(Inner {
            epoll_fd,
            wakeup_read,
            wakeup_write,
            fds: RwLock::new(fds),
            pending_events: AtomicUsize::new(0),
        });

        let scheduler = Scheduler::new(worker_count, use_caller, name);
        scheduler.set_hooks(Arc::new(IoHooks { inner: inner.clone() }));
        let manager = IoManager { scheduler: scheduler.clone(), inner };
        scheduler.start();

        Ok(manager)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    pub fn pending_events(&self) -> usize {
        self.inner.pending_events.load(Ordering::Acquire)
    }

    /// Stops the underlying scheduler: wakes every worker (draining the
    /// epoll-waiting ones via the self-pipe), joins them all.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// The I/O manager that owns the worker currently executing on this
    /// thread, if any.
    pub fn current() -> Option<IoManager> {
        let scheduler = Scheduler::current()?;
        let inner = CURRENT_INNER.with(|c| c.borrow().clone())?;
        Some(IoManager { scheduler, inner })
    }

    /// Arms `event` on `fd`. With no `callback`, the currently running
    /// coroutine (which must be `Exec`) is captured as the continuation;
    /// otherwise `callback` runs once, posted as a plain callable.
    ///
    /// Asserts `event` is not already armed on `fd` — arming twice without
    /// an intervening `del_event`/`cancel_event`/firing is a programmer
    /// error, not a recoverable one.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        let slot = self.inner.ensure_slot(fd);
        let mut ctx = slot.lock().unwrap();

        assert!(
            ctx.armed & event.bit() == 0,
            "add_event: {:?} already armed on fd {}",
            event,
            fd
        );

        let op = if ctx.armed != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        let new_mask = ctx.armed | event.bit();
        let cookie = Arc::as_ptr(&slot) as u64;

        if let Err(err) = self.inner.rearm(fd, cookie, new_mask, op) {
            error!("epoll_ctl({}, fd={}) failed arming {:?}: {}", self.inner.epoll_fd, fd, event, err);
            return Err(Error::Io(err));
        }

        ctx.armed = new_mask;
        let continuation = match callback {
            Some(cb) => Continuation::Callback(cb),
            None => {
                let current = Coroutine::current();
                assert_eq!(
                    current.state(),
                    State::Exec,
                    "add_event: no callback given and the calling coroutine is not executing"
                );
                Continuation::Coroutine(current)
            }
        };
        *ctx.slot_mut(event) = Some(EventSlot { scheduler: self.scheduler.clone(), continuation });
        self.inner.pending_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Disarms `event` on `fd` without firing its continuation. Returns
    /// `false` if it wasn't armed (including an unregistered `fd`).
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.inner.lookup_slot(fd) {
            Some(s) => s,
            None => return false,
        };
        let mut ctx = slot.lock().unwrap();
        if ctx.armed & event.bit() == 0 {
            return false;
        }

        let new_mask = ctx.armed & !event.bit();
        let op = if new_mask != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        let cookie = Arc::as_ptr(&slot) as u64;
        if let Err(err) = self.inner.rearm(fd, cookie, new_mask, op) {
            error!("epoll_ctl({}, fd={}) failed disarming {:?}: {}", self.inner.epoll_fd, fd, event, err);
            return false;
        }

        ctx.armed = new_mask;
        *ctx.slot_mut(event) = None;
        self.inner.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarms `event` on `fd` and fires its continuation, exactly once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.inner.lookup_slot(fd) {
            Some(s) => s,
            None => return false,
        };
        let mut ctx = slot.lock().unwrap();
        if ctx.armed & event.bit() == 0 {
            return false;
        }

        let new_mask = ctx.armed & !event.bit();
        let op = if new_mask != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        let cookie = Arc::as_ptr(&slot) as u64;
        if let Err(err) = self.inner.rearm(fd, cookie, new_mask, op) {
            error!("epoll_ctl({}, fd={}) failed cancelling {:?}: {}", self.inner.epoll_fd, fd, event, err);
            return false;
        }

        ctx.armed = new_mask;
        let fired = ctx.slot_mut(event).take();
        drop(ctx);

        if let Some(slot) = fired {
            self.inner.pending_events.fetch_sub(1, Ordering::AcqRel);
            fire(slot);
        }
        true
    }

    /// Disarms every armed event on `fd` and fires both continuations that
    /// were set.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let slot = match self.inner.lookup_slot(fd) {
            Some(s) => s,
            None => return false,
        };
        let mut ctx = slot.lock().unwrap();
        if ctx.armed == 0 {
            return false;
        }

        let cookie = Arc::as_ptr(&slot) as u64;
        if let Err(err) = self.inner.rearm(fd, cookie, 0, libc::EPOLL_CTL_DEL) {
            error!("epoll_ctl({}, fd={}) failed cancel_all: {}", self.inner.epoll_fd, fd, err);
            return false;
        }

        let mut fired = Vec::with_capacity(2);
        if let Some(s) = ctx.read.take() {
            fired.push(s);
        }
        if let Some(s) = ctx.write.take() {
            fired.push(s);
        }
        ctx.armed = 0;
        drop(ctx);

        self.inner.pending_events.fetch_sub(fired.len(), Ordering::AcqRel);
        for slot in fired {
            fire(slot);
        }
        true
    }
}

struct IoHooks {
    inner: Arc<Inner>,
}

impl IoHooks {
    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(self.inner.wakeup_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn handle_fd_event(&self, ev: &libc::epoll_event) {
        // SAFETY: `ev.u64` was set to `Arc::as_ptr` of a slot held in the fd
        // table, which only ever grows — the slot is never removed from the
        // table and so stays alive for the lifetime of this IoManager.
        let ctx_ptr = ev.u64 as *const Mutex<FdContext>;
        let mut ctx = unsafe { (*ctx_ptr).lock().unwrap() };

        let mut reported = ev.events;
        if reported & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            reported |= libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;
        }

        let real_events = reported & ctx.armed;
        if real_events == 0 {
            return;
        }

        let remaining = ctx.armed & !real_events;
        let op = if remaining != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        if let Err(err) = self.inner.rearm(ctx.fd, ev.u64, remaining, op) {
            error!("epoll_ctl({}, fd={}) failed re-arming after readiness: {}", self.inner.epoll_fd, ctx.fd, err);
            return;
        }
        ctx.armed = remaining;

        let mut fired = Vec::with_capacity(2);
        if real_events & Event::Read.bit() != 0 {
            if let Some(s) = ctx.read.take() {
                fired.push(s);
            }
        }
        if real_events & Event::Write.bit() != 0 {
            if let Some(s) = ctx.write.take() {
                fired.push(s);
            }
        }
        drop(ctx);

        self.inner.pending_events.fetch_sub(fired.len(), Ordering::AcqRel);
        for slot in fired {
            fire(slot);
        }
    }
}

impl Hooks for IoHooks {
    fn notify(&self, sched: &Scheduler) {
        if sched.idle_workers() == 0 {
            return;
        }
        let byte = [1u8];
        let rc = unsafe { libc::write(self.inner.wakeup_write, byte.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("failed to write wakeup byte: {}", err);
            }
        }
    }

    fn is_stopped(&self, sched: &Scheduler) -> bool {
        sched.core_is_stopped() && self.inner.pending_events.load(Ordering::Acquire) == 0
    }

    fn on_worker_enter(&self, _sched: &Scheduler) {
        CURRENT_INNER.with(|c| *c.borrow_mut() = Some(self.inner.clone()));
    }

    fn idle_body(&self, sched: &Scheduler) {
        let mut events: Vec<libc::epoll_event> =
            (0..EPOLL_BATCH).map(|_| unsafe { std::mem::zeroed() }).collect();

        loop {
            if self.is_stopped(sched) {
                debug!("io manager {} idle loop exiting, stopped", sched.name());
                return;
            }

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.inner.epoll_fd,
                        events.as_mut_ptr(),
                        EPOLL_BATCH as libc::c_int,
                        EPOLL_TIMEOUT_MS,
                    )
                };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("epoll_wait on {} failed: {}", sched.name(), err);
                    return;
                }
                break rc as usize;
            };

            for ev in &events[..n] {
                if ev.u64 == WAKEUP_COOKIE {
                    self.drain_wakeup_pipe();
                } else {
                    self.handle_fd_event(ev);
                }
            }

            Coroutine::yield_hold();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grown_table_size_always_covers_the_requested_fd() {
        for fd in 0..300usize {
            let size = grown_table_size(32, fd);
            assert!(size > fd, "size {} does not cover fd {}", size, fd);
        }
    }

    #[test]
    fn grown_table_size_is_monotonic_in_current_size() {
        assert!(grown_table_size(64, 10) >= grown_table_size(32, 10));
    }
}
