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

//! The single configuration key this crate consumes: `fiber.stack_size`.
//!
//! No YAML, no hot-reload watcher, no dynamic key registry — just a
//! process-wide default read once at coroutine construction. A later call
//! to [`set_stack_size`] only affects coroutines created afterward;
//! existing coroutines keep the stack they were built with.

use std::sync::atomic::{AtomicU32, Ordering};

/// `fiber.stack_size`'s default: 1 MiB.
pub const DEFAULT_STACK_SIZE: u32 = 1024 * 1024;

static STACK_SIZE: AtomicU32 = AtomicU32::new(DEFAULT_STACK_SIZE);

/// Set the process-wide default coroutine stack size (the `fiber.stack_size`
/// key). Coroutines already created keep the size they were built with.
pub fn set_stack_size(bytes: u32) {
    STACK_SIZE.store(bytes, Ordering::Relaxed);
}

/// Read the current default coroutine stack size.
pub fn stack_size() -> u32 {
    STACK_SIZE.load(Ordering::Relaxed)
}
