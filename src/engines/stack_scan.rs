// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack-scan heuristic: the last-resort engine. Scans forward from the
//! last stack pointer we made progress from, looking for a word that lands
//! inside some registered image's text range, and guesses that it's a
//! return address.
//!
//! Grounded on `tinyunw_try_step_stackscan`: no unwind metadata survives
//! this far, so correctness is "cross fingers and hope" by design — this is
//! the engine of last resort, not a correctness guarantee.

use crate::cursor::Cursor;
use crate::error::{EngineOutcome, EngineResult};
use crate::image::ImageRecord;
use crate::memory::safe_read_word;
use crate::registry::Registry;

const SEARCH_SPACE_WORDS: u64 = 50;
const WORD_SIZE: u64 = 8;

/// Entry point. `image` is unused — the scan isn't scoped to a single image,
/// it searches across every registered image — but kept for signature
/// parity with the rest of the cascade.
pub fn step(cursor: &mut Cursor, registry: &Registry, _image: &ImageRecord) -> EngineResult {
    let start = cursor.last_stack_pointer;
    let end = start + SEARCH_SPACE_WORDS * WORD_SIZE;

    let mut loc = start;
    while loc <= end {
        let Some(data) = safe_read_word(loc as usize) else {
            // Ran off the end of the stack; treat it as no more frames.
            return Ok(EngineOutcome::NoFrame);
        };

        if registry.image_containing_address(data).is_some() {
            cursor.last_stack_pointer = loc + WORD_SIZE;
            cursor.current_context.rip = data;
            if let Some(rbp) = safe_read_word((loc - WORD_SIZE) as usize) {
                cursor.current_context.rbp = rbp;
            }
            return Ok(EngineOutcome::Success);
        }

        loc += WORD_SIZE;
    }

    Ok(EngineOutcome::NoInfo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnwindContext;
    use crate::image::{ImageRecordBuilder, Range};

    #[test]
    fn finds_a_plausible_return_address_on_the_stack() {
        // High bits set so it survives the x86_64 fast-reject.
        const CODE_ADDR: u64 = 0x0000_7f00_0010_0000;
        let registry = Registry::new();
        registry.append(
            ImageRecordBuilder::new(CODE_ADDR, 0, true)
                .text_range(Range::new(CODE_ADDR, 0x1000))
                .build(),
        );

        // junk, junk, candidate return address, junk...
        let stack: [u64; 4] = [0, 0x1122_3344_5566_7788, CODE_ADDR + 0x10, 0];
        let mut ctx = UnwindContext::default();
        ctx.rsp = stack.as_ptr() as u64;
        let mut cursor = Cursor::init(ctx);

        let outcome = step(&mut cursor, &registry, &ImageRecord::default()).unwrap();
        assert_eq!(outcome, EngineOutcome::Success);
        assert_eq!(cursor.current_context.rip, CODE_ADDR + 0x10);
    }

    #[test]
    fn gives_up_after_search_space_is_exhausted() {
        let registry = Registry::new();
        let stack = [0u64; (SEARCH_SPACE_WORDS as usize) + 2];
        let mut ctx = UnwindContext::default();
        ctx.rsp = stack.as_ptr() as u64;
        let mut cursor = Cursor::init(ctx);

        let outcome = step(&mut cursor, &registry, &ImageRecord::default()).unwrap();
        assert_eq!(outcome, EngineOutcome::NoInfo);
    }
}
