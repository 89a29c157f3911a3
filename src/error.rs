// SPDX-License-Identifier: GPL-2.0

use thiserror::Error;

/// Errors returned by the session API surface.
///
/// These map one-to-one onto the binder exception codes the transport layer
/// reports to clients; no session operation panics or aborts for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The request itself is malformed (non-positive duration, empty batch).
    /// Rejected synchronously, no state mutated.
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),
    /// The operation is not valid in the session's current state
    /// (report while paused, double close, ...). No state mutated.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

pub type SessionResult<T> = Result<T, SessionError>;
