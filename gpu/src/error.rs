// gallium/gpu/src/error.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

/// Errors surfaced by the pipe layer.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PipeError {
    /// Command buffer space or the host memory budget ran out. Recoverable by flushing once.
    #[error("out of command buffer space or host memory")]
    OutOfMemory,
    /// A buffer, texture, or surface could not be created.
    #[error("allocation failed: {0}")]
    AllocationFailed(&'static str),
    /// Malformed parameters. Nothing was committed.
    #[error("bad input: {0}")]
    BadInput(String),
    /// The shader compiler rejected a shader.
    #[error("shader translation failed: {0}")]
    ShaderTranslation(String),
    /// The context cannot continue, or could not be created at all.
    #[error("fatal: {0}")]
    Fatal(&'static str),
}

impl PipeError {
    #[inline]
    pub fn bad_input<S>(message: S) -> PipeError where S: Into<String> {
        PipeError::BadInput(message.into())
    }

    /// True for the errors a flush followed by one retry may recover from.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        *self == PipeError::OutOfMemory
    }
}

pub type PipeResult<T> = Result<T, PipeError>;
