// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stable error surface for the unwinder core.
//!
//! Every public operation returns one of these codes rather than a
//! string-carrying error: the cascade runs from signal handlers, where
//! formatting or allocating a message is not safe.

use std::fmt;

/// Outcome of a single [`crate::step::step`] call, matching the three error
/// tiers described for the cascade: clean termination, no-info/try-next, and
/// hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The cursor advanced to a new, valid frame.
    Success,
    /// End-of-stack reached cleanly. Not an error.
    NoFrame,
    /// Every enabled engine declined this frame.
    NoInfo,
}

/// Hard errors: metadata an engine has committed to interpreting turned out
/// to be malformed. These propagate out of the cascade immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnwindError {
    #[error("register id is not valid for this architecture")]
    BadRegister,
    #[error("instruction pointer is not valid")]
    InvalidIp,
    #[error("frame metadata is malformed")]
    BadFrame,
    #[error("argument to an unwinder operation was invalid")]
    InvalidArgument,
    #[error("a fixed-size internal buffer was exhausted")]
    OutOfMemory,
    #[error("unknown/unclassified failure")]
    Unknown,
}

/// The full result of a step: success/no-frame/no-info, or a hard error.
///
/// This mirrors the language-neutral `{success | no_frame | no_info | error}`
/// surface from the external interface section of the design: rather than a
/// `Result<StepOutcome, UnwindError>` with an overlapping "ok but not
/// advancing" case, [`StepResult`] keeps all four outcomes as sibling
/// variants so callers match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Success,
    NoFrame,
    NoInfo,
    Error(UnwindError),
}

impl From<UnwindError> for StepResult {
    fn from(e: UnwindError) -> Self {
        StepResult::Error(e)
    }
}

impl StepResult {
    /// An engine "declined" this frame: no info, try the next engine.
    pub fn is_no_info(&self) -> bool {
        matches!(self, StepResult::NoInfo)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success)
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Success => write!(f, "success"),
            StepResult::NoFrame => write!(f, "no_frame"),
            StepResult::NoInfo => write!(f, "no_info"),
            StepResult::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Outcome of an individual engine attempt within the cascade.
///
/// Engines never see the full [`StepResult`] surface: they either recover a
/// frame, say they have nothing to contribute (`NoInfo`), believe the stack
/// has ended (`NoFrame`), or hit malformed metadata (`Err`).
pub type EngineResult = Result<EngineOutcome, UnwindError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    Success,
    NoFrame,
    NoInfo,
}

impl From<EngineOutcome> for StepResult {
    fn from(o: EngineOutcome) -> Self {
        match o {
            EngineOutcome::Success => StepResult::Success,
            EngineOutcome::NoFrame => StepResult::NoFrame,
            EngineOutcome::NoInfo => StepResult::NoInfo,
        }
    }
}
