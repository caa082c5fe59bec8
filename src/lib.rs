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

//! A stackful coroutine runtime, an M:N thread-pool scheduler built on it,
//! and an epoll-based I/O manager layered on the scheduler.
//!
//! The three pieces compose but don't require each other: spin up bare
//! [`Coroutine`]s and drive them by hand, hand work to a [`Scheduler`] and
//! let its workers dispatch it, or reach for [`IoManager`] when some of
//! that work needs to suspend on socket readiness instead of just running
//! to completion.

mod config;
mod coroutine;
mod error;
mod io_manager;
mod scheduler;
mod task;

pub use config::{set_stack_size, stack_size, DEFAULT_STACK_SIZE};
pub use coroutine::{Builder, Coroutine, State};
pub use error::{Error, Result};
pub use io_manager::{Event, IoManager};
pub use scheduler::Scheduler;
pub use task::Work;
