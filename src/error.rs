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

use std::fmt;

/// Errors surfaced across the crate's public API.
///
/// Programmer errors (violated preconditions, e.g. resuming a coroutine
/// that is already executing) are not represented here: they are
/// `assert!`/`panic!`, since there is no sensible recovery from a call
/// made out of contract — only errors a well-behaved caller can hit
/// through no fault of its own go through this enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A kernel call (`epoll_ctl`, `pipe2`, a socket syscall, ...) failed.
    #[error("kernel call failed: {0}")]
    Io(#[from] std::io::Error),

    /// A coroutine's entry closure panicked; the coroutine is now in
    /// `State::Except` and will not be resumed again.
    #[error("coroutine panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a coroutine's entry closure panicked with, downcast to a
/// printable form.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

impl fmt::Display for crate::coroutine::State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            crate::coroutine::State::Init => "init",
            crate::coroutine::State::Exec => "exec",
            crate::coroutine::State::Hold => "hold",
            crate::coroutine::State::Ready => "ready",
            crate::coroutine::State::Term => "term",
            crate::coroutine::State::Except => "except",
        };
        f.write_str(s)
    }
}
