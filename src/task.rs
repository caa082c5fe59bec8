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

//! The FIFO's entry type.
//!
//! "Either a coroutine or a callable" is encoded as a tagged sum, not a
//! struct with two nullable fields asserted at runtime to hold exactly
//! one — the type system enforces "exactly one" for free.

use crate::coroutine::Coroutine;

/// Something the scheduler can dispatch: either a coroutine handle, or a
/// plain callable that gets lazily wrapped into one on first dispatch.
pub enum Work {
    Coroutine(Coroutine),
    Callable(Box<dyn FnOnce() + Send + 'static>),
}

impl Work {
    pub fn from_coroutine(c: Coroutine) -> Work {
        Work::Coroutine(c)
    }

    pub fn from_fn<F>(f: F) -> Work
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callable(Box::new(f))
    }
}

/// A queue entry: a unit of [`Work`] plus its pin (`None` = any worker).
pub struct Task {
    pub work: Work,
    pub pinned: Option<usize>,
}

impl Task {
    pub fn new(work: Work, pinned: Option<usize>) -> Task {
        Task { work, pinned }
    }
}
