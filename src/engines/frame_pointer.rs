// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame-pointer walker: the opt-in fallback engine. Follows the classic
//! x86_64 `push rbp; mov rbp, rsp` chain with no metadata at all, so it only
//! runs when a caller explicitly asks for it via
//! [`crate::cursor::StepFlags::TRY_FRAME_POINTER`] — a stripped or
//! frame-pointer-omitting binary will make this produce a plausible-looking
//! but wrong frame rather than failing closed.

use crate::cursor::Cursor;
use crate::error::{EngineOutcome, EngineResult};
use crate::image::ImageRecord;
use crate::memory::safe_read_word;

const WORD_SIZE: u64 = 8;
const MAX_FRAME_SIZE: u64 = 1024 * 1024;

#[inline]
fn is_likely_valid_address(addr: u64) -> bool {
    if addr < 4096 {
        return false;
    }
    if addr % WORD_SIZE != 0 {
        return false;
    }
    crate::image::is_plausible_code_address(addr)
}

#[inline]
fn is_valid_frame_pointer(bp: u64, sp: u64) -> bool {
    is_likely_valid_address(bp) && bp >= sp && bp.saturating_sub(sp) <= MAX_FRAME_SIZE
}

/// Entry point. `image` is unused — frame-pointer walking carries no
/// per-image metadata — but kept for signature parity with the other
/// engines, which the stepper cascade dispatches to uniformly.
pub fn step(cursor: &mut Cursor, _image: &ImageRecord) -> EngineResult {
    let bp = cursor.current_context.rbp;
    let sp = cursor.current_context.rsp;

    if !is_valid_frame_pointer(bp, sp) {
        return Ok(EngineOutcome::NoFrame);
    }

    let return_addr_ptr = bp + WORD_SIZE;
    let Some(return_addr) = safe_read_word(return_addr_ptr as usize) else {
        return Ok(EngineOutcome::NoFrame);
    };
    if return_addr == 0 || !is_likely_valid_address(return_addr) {
        return Ok(EngineOutcome::NoFrame);
    }

    let Some(saved_bp) = safe_read_word(bp as usize) else {
        return Ok(EngineOutcome::NoFrame);
    };
    if saved_bp != 0 && saved_bp <= bp {
        return Ok(EngineOutcome::NoFrame);
    }

    cursor.current_context.rip = return_addr;
    cursor.current_context.rsp = bp + 2 * WORD_SIZE;
    cursor.current_context.rbp = saved_bp;
    Ok(EngineOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnwindContext;

    #[test]
    fn rejects_frame_pointer_below_stack_pointer() {
        assert!(!is_valid_frame_pointer(0x1000, 0x2000));
    }

    #[test]
    fn rejects_frame_pointer_too_far_above_stack_pointer() {
        assert!(!is_valid_frame_pointer(0x0000_7f00_0010_0000, 0x0000_7f00_0000_0000));
    }

    #[test]
    fn walks_one_frame_of_a_synthetic_chain() {
        // frame[0] = saved rbp (0, end of chain); frame[1] = return address.
        let frame: [u64; 2] = [0, 0x0000_7f00_dead_beef];
        let bp = frame.as_ptr() as u64;
        let sp = bp; // sp == bp is a legal (just-entered-prologue) shape

        let mut ctx = UnwindContext::default();
        ctx.rbp = bp;
        ctx.rsp = sp;
        let mut cursor = Cursor::init(ctx);

        let outcome = step(&mut cursor, &ImageRecord::default()).unwrap();
        assert_eq!(outcome, EngineOutcome::Success);
        assert_eq!(cursor.current_context.rip, 0x0000_7f00_dead_beef);
        assert_eq!(cursor.current_context.rbp, 0);
        assert_eq!(cursor.current_context.rsp, bp + 16);
    }

    #[test]
    fn stops_at_null_return_address() {
        let frame: [u64; 2] = [0, 0];
        let bp = frame.as_ptr() as u64;
        let mut ctx = UnwindContext::default();
        ctx.rbp = bp;
        ctx.rsp = bp;
        let mut cursor = Cursor::init(ctx);

        let outcome = step(&mut cursor, &ImageRecord::default()).unwrap();
        assert_eq!(outcome, EngineOutcome::NoFrame);
    }
}
