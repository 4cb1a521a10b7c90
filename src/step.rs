// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The stepper cascade (component S): a single `step` operation that asks
//! the registry for the image covering the current instruction pointer,
//! then tries each enabled engine in priority order until one returns
//! something other than [`EngineOutcome::NoInfo`].
//!
//! Engine order: compact unwind, DWARF CFI, frame pointer (opt-in), stack
//! scan. An engine that returns `Success` or a hard error terminates the
//! cascade immediately; `NoInfo` means "I have nothing to say about this
//! frame", giving the next engine a chance.

use crate::cursor::{Cursor, StepFlags};
use crate::engines::{compact, dwarf, frame_pointer, stack_scan};
use crate::error::{EngineOutcome, StepResult};
use crate::image::ImageRecord;
use crate::registry::Registry;
use crate::sentinel;
use crate::trace::engine_trace;

/// Advances `cursor` by one frame, consulting `registry` for image metadata.
pub fn step(cursor: &mut Cursor, flags: StepFlags, registry: &Registry) -> StepResult {
    if cursor.end_of_stack {
        return StepResult::NoFrame;
    }

    let rip = cursor.rip();
    if rip == 0 {
        cursor.end_of_stack = true;
        return StepResult::NoFrame;
    }
    if sentinel::is_sentinel(rip) {
        engine_trace!(rip, "rip falls inside a pseudo-symbol sentinel range");
        cursor.end_of_stack = true;
        return StepResult::NoFrame;
    }

    let image = registry.image_containing_address(rip);
    let no_image = ImageRecord::default();
    let image_ref = image.as_ref().unwrap_or(&no_image);

    if !flags.contains(StepFlags::NO_COMPACT) {
        engine_trace!(rip, "trying compact unwind");
        match compact::step(cursor, image_ref) {
            Ok(EngineOutcome::NoInfo) => {}
            Ok(outcome) => return finish(cursor, outcome.into()),
            Err(e) => return StepResult::Error(e),
        }
    }

    if !flags.contains(StepFlags::NO_DWARF) {
        engine_trace!(rip, "trying DWARF CFI");
        match dwarf::step(cursor, image_ref) {
            Ok(EngineOutcome::NoInfo) => {}
            Ok(outcome) => return finish(cursor, outcome.into()),
            Err(e) => return StepResult::Error(e),
        }
    }

    if cfg!(feature = "frame_pointer_fallback") && flags.contains(StepFlags::TRY_FRAME_POINTER) {
        engine_trace!(rip, "trying frame pointer walk");
        match frame_pointer::step(cursor, image_ref) {
            Ok(EngineOutcome::NoInfo) => {}
            Ok(outcome) => return finish(cursor, outcome.into()),
            Err(e) => return StepResult::Error(e),
        }
    }

    if !flags.contains(StepFlags::NO_STACKSCAN) {
        engine_trace!(rip, "trying stack scan");
        match stack_scan::step(cursor, registry, image_ref) {
            Ok(EngineOutcome::NoInfo) => {}
            Ok(outcome) => return finish(cursor, outcome.into()),
            Err(e) => return StepResult::Error(e),
        }
    }

    StepResult::NoInfo
}

fn finish(cursor: &mut Cursor, result: StepResult) -> StepResult {
    match result {
        StepResult::Success => cursor.last_valid_frame = Some(cursor.current_context),
        StepResult::NoFrame => cursor.end_of_stack = true,
        _ => {}
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnwindContext;

    #[test]
    fn rip_zero_is_clean_end_of_stack() {
        let registry = Registry::new();
        let mut cursor = Cursor::init(UnwindContext::default());
        assert_eq!(step(&mut cursor, StepFlags::default(), &registry), StepResult::NoFrame);
        assert!(cursor.end_of_stack);
    }

    #[test]
    fn stepping_past_end_of_stack_stays_no_frame() {
        let registry = Registry::new();
        let mut cursor = Cursor::init(UnwindContext::default());
        let _ = step(&mut cursor, StepFlags::default(), &registry);
        assert_eq!(step(&mut cursor, StepFlags::default(), &registry), StepResult::NoFrame);
    }

    #[test]
    fn sentinel_range_is_clean_end_of_stack_regardless_of_flags() {
        let _lock = crate::sentinel::SENTINEL_TEST_LOCK.lock().unwrap();
        crate::sentinel::set_start_symbol(0x9000, Some(0x9040));
        let registry = Registry::new();
        let mut ctx = UnwindContext::default();
        ctx.rip = 0x9010;
        let mut cursor = Cursor::init(ctx);

        let flags = StepFlags::NO_COMPACT | StepFlags::NO_DWARF | StepFlags::NO_STACKSCAN;
        assert_eq!(step(&mut cursor, flags, &registry), StepResult::NoFrame);
    }

    #[test]
    fn falls_through_to_stack_scan_when_no_image_metadata_exists() {
        const CODE_ADDR: u64 = 0x0000_7f00_0020_0000;
        let registry = Registry::new();
        registry.append(
            crate::image::ImageRecordBuilder::new(CODE_ADDR, 0, true)
                .text_range(crate::image::Range::new(CODE_ADDR, 0x1000))
                .build(),
        );

        let stack: [u64; 2] = [CODE_ADDR + 4, 0];
        let mut ctx = UnwindContext::default();
        ctx.rip = 0x0000_7f00_0050_0000; // not covered by any registered image
        ctx.rsp = stack.as_ptr() as u64;
        let mut cursor = Cursor::init(ctx);

        let result = step(&mut cursor, StepFlags::default(), &registry);
        assert_eq!(result, StepResult::Success);
        assert_eq!(cursor.current_context.rip, CODE_ADDR + 4);
    }
}
