// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::context::UnwindContext;

/// Per-call flags to [`crate::step::step`], each disabling or enabling one
/// cascade member. All engines except the frame-pointer walker are opt-out
/// (`NO_*`); the frame-pointer walker is opt-in since stepping past an
/// already-unwound frame with bare frame pointers can silently produce a
/// plausible-looking but wrong frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepFlags(u32);

impl StepFlags {
    pub const NO_COMPACT: StepFlags = StepFlags(1 << 0);
    pub const NO_DWARF: StepFlags = StepFlags(1 << 1);
    pub const NO_STACKSCAN: StepFlags = StepFlags(1 << 2);
    pub const TRY_FRAME_POINTER: StepFlags = StepFlags(1 << 3);

    pub const fn empty() -> Self {
        StepFlags(0)
    }

    pub const fn contains(self, other: StepFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: StepFlags) -> Self {
        StepFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for StepFlags {
    type Output = StepFlags;
    fn bitor(self, rhs: StepFlags) -> StepFlags {
        self.union(rhs)
    }
}

/// Per-unwind mutable state: the current register context plus scan
/// bookkeeping. Holds no heap resources; it borrows the registry for reads
/// during each step and is discarded once stepping reaches a terminal code.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Snapshot at init; never mutated after construction.
    pub original_context: UnwindContext,
    /// Updated after each successful step.
    pub current_context: UnwindContext,
    /// Seeds stack-scan attempts; advanced by the stack-scan engine as it
    /// consumes candidate words.
    pub last_stack_pointer: u64,
    /// Latched once a step returns a clean end-of-stack; further steps on
    /// this cursor are diagnostic only (callers are expected to stop when
    /// they observe `no_frame`, but the latch guards against being asked to
    /// step twice past the end).
    pub end_of_stack: bool,
    /// The frame context at the end of the last successful step, used by
    /// engines (e.g. stack-scan) to detect a step that made no progress.
    pub last_valid_frame: Option<UnwindContext>,
}

impl Cursor {
    /// Constructs a cursor from a context snapshot. Cursor is valid until
    /// discarded; it has no `Drop` behavior, so discarding is just letting
    /// it go out of scope.
    pub fn init(context: UnwindContext) -> Self {
        Cursor {
            original_context: context,
            current_context: context,
            last_stack_pointer: context.rsp,
            end_of_stack: false,
            last_valid_frame: None,
        }
    }

    pub fn rip(&self) -> u64 {
        self.current_context.rip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_seeds_last_stack_pointer_from_rsp() {
        let mut ctx = UnwindContext::default();
        ctx.rsp = 0x7ffd_0000;
        let cursor = Cursor::init(ctx);
        assert_eq!(cursor.last_stack_pointer, 0x7ffd_0000);
        assert!(!cursor.end_of_stack);
    }

    #[test]
    fn flags_default_enables_every_engine_but_frame_pointer() {
        let flags = StepFlags::default();
        assert!(!flags.contains(StepFlags::NO_COMPACT));
        assert!(!flags.contains(StepFlags::NO_DWARF));
        assert!(!flags.contains(StepFlags::NO_STACKSCAN));
        assert!(!flags.contains(StepFlags::TRY_FRAME_POINTER));
    }
}
