// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compact-unwind engine: decodes the `__unwind_info` section's packed
//! per-function encodings for the three x86_64 modes this core recovers
//! (RBP-frame, frameless-immediate, frameless-indirect). The fourth mode,
//! DWARF-defer, is reported as [`EngineOutcome::NoInfo`] so the cascade
//! falls through to the DWARF engine.
//!
//! Binary layout and bitfield masks are the Mach-O `__unwind_info` format
//! shared by every x86_64 compact-unwind consumer (a two-level index over
//! 32-bit packed encodings); nothing here is Datadog- or tinyunwind-
//! specific, it is the on-disk format itself.

use crate::context::RegisterId;
use crate::cursor::Cursor;
use crate::error::{EngineOutcome, EngineResult, UnwindError};
use crate::image::ImageRecord;
use crate::memory::{safe_read_u32, safe_read_word};

const UNWIND_X86_64_MODE_MASK: u32 = 0x0F00_0000;
const MODE_RBP_FRAME: u32 = 0x0100_0000;
const MODE_STACK_IMMD: u32 = 0x0200_0000;
const MODE_STACK_IND: u32 = 0x0300_0000;
const MODE_DWARF: u32 = 0x0400_0000;

const RBP_FRAME_REGISTERS: u32 = 0x0000_7FFF;
const RBP_FRAME_OFFSET: u32 = 0x00FF_0000;

const FRAMELESS_STACK_SIZE: u32 = 0x00FF_0000;
const FRAMELESS_STACK_ADJUST: u32 = 0x0000_E000;
const FRAMELESS_REG_COUNT: u32 = 0x0000_1C00;
const FRAMELESS_REG_PERMUTATION: u32 = 0x0000_03FF;

/// Extracts the field selected by `mask` from `value`, right-justified.
fn extract(value: u32, mask: u32) -> u32 {
    (value & mask) >> mask.trailing_zeros()
}

/// Register-slot identifiers used by both the RBP-frame 3-bit-per-slot
/// layout and the frameless permutation decoder. Any id other than these six
/// callee-saved registers is an encoding error.
fn register_for_slot(id: u32) -> Result<Option<RegisterId>, UnwindError> {
    Ok(match id {
        0 => None,
        1 => Some(RegisterId::Rbx),
        2 => Some(RegisterId::R12),
        3 => Some(RegisterId::R13),
        4 => Some(RegisterId::R14),
        5 => Some(RegisterId::R15),
        6 => Some(RegisterId::Rbp),
        _ => return Err(UnwindError::BadFrame),
    })
}

/// Unpacks a packed permutation index into up to six positional register
/// slots, using the fixed base-arithmetic schedule keyed by register count
/// (the same divisor tables used by every compact-unwind decoder).
fn unpermute(permutation: u32, reg_count: u32) -> Result<[Option<RegisterId>; 6], UnwindError> {
    let mut permunreg = [0u32; 7];
    match reg_count {
        1 => {
            permunreg[0] = permutation;
        }
        2 => {
            permunreg[0] = permutation / 5;
            permunreg[1] = permutation % 5;
        }
        3 => {
            permunreg[0] = permutation / 20;
            permunreg[1] = (permutation % 20) / 4;
            permunreg[2] = (permutation % 20) % 4;
        }
        4 => {
            permunreg[0] = permutation / 60;
            permunreg[1] = (permutation % 60) / 12;
            permunreg[2] = (permutation % 60 % 12) / 3;
            permunreg[3] = permutation % 60 % 12 % 3;
        }
        5 => {
            permunreg[0] = permutation / 120;
            permunreg[1] = (permutation % 120) / 24;
            permunreg[2] = (permutation % 120 % 24) / 6;
            permunreg[3] = (permutation % 120 % 24 % 6) / 2;
            permunreg[4] = permutation % 120 % 24 % 6 % 2;
        }
        0 => {}
        _ => return Err(UnwindError::BadFrame),
    }

    let mut used = [false; 7]; // index 0 unused, registers numbered 1..=6
    let mut slots: [Option<RegisterId>; 6] = [None; 6];
    for i in 0..reg_count as usize {
        let mut renum = 0u32;
        for r in 1..=6u32 {
            if !used[r as usize] {
                if renum == permunreg[i] {
                    slots[i] = register_for_slot(r)?;
                    used[r as usize] = true;
                    break;
                }
                renum += 1;
            }
        }
    }
    Ok(slots)
}

struct FirstLevelEntry {
    function_offset: u32,
    second_level_page_offset: u32,
}

/// The only `__unwind_info` layout version this decoder understands. A
/// mismatch means the section is a future/incompatible revision: defer to
/// the next engine rather than let the binary search walk offsets under a
/// layout we don't know.
const UNWIND_SECTION_VERSION: u32 = 1;

struct UnwindInfoHeader {
    version: u32,
    common_encodings_array_offset: u32,
    common_encodings_array_count: u32,
    index_section_offset: u32,
    index_count: u32,
}

fn read_header(base: u64) -> Option<UnwindInfoHeader> {
    Some(UnwindInfoHeader {
        version: safe_read_u32(base as usize)?,
        common_encodings_array_offset: safe_read_u32((base + 4) as usize)?,
        common_encodings_array_count: safe_read_u32((base + 8) as usize)?,
        index_section_offset: safe_read_u32((base + 20) as usize)?,
        index_count: safe_read_u32((base + 24) as usize)?,
    })
}

fn read_first_level_entry(base: u64, index_offset: u32, i: u32) -> Option<FirstLevelEntry> {
    let entry_addr = base + index_offset as u64 + (i as u64) * 12;
    Some(FirstLevelEntry {
        function_offset: safe_read_u32(entry_addr as usize)?,
        second_level_page_offset: safe_read_u32((entry_addr + 4) as usize)?,
    })
}

/// Binary-searches the first-level index for the entry whose range contains
/// `function_offset`, then dispatches into the located second-level page
/// (regular or compressed) to resolve the final 32-bit encoding.
fn find_encoding(base: u64, header: &UnwindInfoHeader, function_offset: u32) -> Option<u32> {
    if header.index_count < 2 {
        return None;
    }

    let mut lo = 0u32;
    let mut hi = header.index_count - 2; // last entry is a sentinel (end offset only)
    let mut found: Option<u32> = None;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let entry = read_first_level_entry(base, header.index_section_offset, mid)?;
        let next = read_first_level_entry(base, header.index_section_offset, mid + 1)?;
        if function_offset < entry.function_offset {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        } else if function_offset >= next.function_offset {
            lo = mid + 1;
        } else {
            found = Some(mid);
            break;
        }
    }
    let idx = found?;
    let entry = read_first_level_entry(base, header.index_section_offset, idx)?;
    if entry.second_level_page_offset == 0 {
        return None;
    }

    let page_base = base + entry.second_level_page_offset as u64;
    let kind = safe_read_u32(page_base as usize)?;
    match kind {
        2 => find_in_regular_page(page_base, function_offset, entry.function_offset, base),
        3 => find_in_compressed_page(
            page_base,
            function_offset,
            entry.function_offset,
            base,
            header,
        ),
        _ => None,
    }
}

fn find_in_regular_page(page_base: u64, function_offset: u32, _page_start: u32, _base: u64) -> Option<u32> {
    let entry_page_offset = safe_read_u16_at(page_base + 4)? as u64;
    let entry_count = safe_read_u16_at(page_base + 6)? as u64;
    let entries_base = page_base + entry_page_offset;

    let mut best: Option<(u32, u32)> = None;
    for i in 0..entry_count {
        let addr = entries_base + i * 8;
        let offset = safe_read_u32(addr as usize)?;
        let encoding = safe_read_u32((addr + 4) as usize)?;
        if offset <= function_offset && best.map(|(o, _)| offset >= o).unwrap_or(true) {
            best = Some((offset, encoding));
        }
    }
    best.map(|(_, enc)| enc)
}

#[allow(clippy::too_many_arguments)]
fn find_in_compressed_page(
    page_base: u64,
    function_offset: u32,
    page_function_start: u32,
    base: u64,
    header: &UnwindInfoHeader,
) -> Option<u32> {
    let entry_page_offset = safe_read_u16_at(page_base + 4)? as u64;
    let entry_count = safe_read_u16_at(page_base + 6)? as u64;
    let encodings_page_offset = safe_read_u16_at(page_base + 8)? as u64;
    let encodings_count = safe_read_u16_at(page_base + 10)? as u64;
    let entries_base = page_base + entry_page_offset;

    let mut best: Option<(u32, u32)> = None; // (offset-within-page, packed)
    for i in 0..entry_count {
        let addr = entries_base + i * 4;
        let packed = safe_read_u32(addr as usize)?;
        let offset_in_page = packed & 0x00FF_FFFF;
        if offset_in_page <= function_offset.wrapping_sub(page_function_start)
            && best.map(|(o, _)| offset_in_page >= o).unwrap_or(true)
        {
            best = Some((offset_in_page, packed));
        }
    }
    let (_, packed) = best?;
    let encoding_index = (packed >> 24) & 0xFF;

    if encoding_index < header.common_encodings_array_count {
        let addr = base + header.common_encodings_array_offset as u64 + (encoding_index as u64) * 4;
        safe_read_u32(addr as usize)
    } else {
        let local_index = encoding_index - header.common_encodings_array_count;
        if local_index as u64 >= encodings_count {
            return None;
        }
        let addr = page_base + encodings_page_offset + (local_index as u64) * 4;
        safe_read_u32(addr as usize)
    }
}

fn safe_read_u16_at(addr: u64) -> Option<u16> {
    crate::memory::safe_read_u16(addr as usize)
}

/// Attempts to recover the caller's frame from an RBP-chain compact-unwind
/// encoding: up to five callee-saved registers live at `rbp - n*8`, then the
/// standard epilogue restores `rip`/`rsp`/`rbp`.
fn apply_rbp_frame(cursor: &mut Cursor, encoding: u32) -> EngineResult {
    let rbp = cursor.current_context.rbp;
    if rbp == 0 {
        return Ok(EngineOutcome::NoFrame);
    }
    let registers = extract(encoding, RBP_FRAME_REGISTERS);
    let offset = extract(encoding, RBP_FRAME_OFFSET) as u64;

    let mut next = cursor.current_context;
    for slot in 0..5u32 {
        let id = (registers >> (slot * 3)) & 0x7;
        if let Some(reg) = register_for_slot(id)? {
            let addr = rbp.wrapping_sub((offset + slot as u64) * 8);
            let value = safe_read_word(addr as usize).ok_or(UnwindError::BadFrame)?;
            next.set(reg, value);
        }
    }

    let rip = safe_read_word((rbp + 8) as usize).ok_or(UnwindError::BadFrame)?;
    let saved_rbp = safe_read_word(rbp as usize).ok_or(UnwindError::BadFrame)?;
    if rip == 0 {
        return Ok(EngineOutcome::NoFrame);
    }

    next.rip = rip;
    next.rsp = rbp + 16;
    next.rbp = saved_rbp;
    cursor.current_context = next;
    Ok(EngineOutcome::Success)
}

/// Frameless modes (stack-immediate and stack-indirect): `n` saved registers
/// live immediately below the return address slot, ordered by a packed
/// permutation index. `stack_size` is either the encoded value directly
/// (immediate) or re-read from a `subq $imm32, %rsp` instruction at the
/// function entry (indirect), then bumped by a small adjust factor.
fn apply_frameless(
    cursor: &mut Cursor,
    encoding: u32,
    function_start: u64,
    indirect: bool,
) -> EngineResult {
    let reg_count = extract(encoding, FRAMELESS_REG_COUNT);
    let permutation = extract(encoding, FRAMELESS_REG_PERMUTATION);

    let stack_size: u64 = if indirect {
        let subl_offset = extract(encoding, FRAMELESS_STACK_SIZE) as u64;
        let adjust = extract(encoding, FRAMELESS_STACK_ADJUST) as u64;
        let imm_addr = function_start + subl_offset;
        let imm = crate::memory::safe_read_i32(imm_addr as usize).ok_or(UnwindError::BadFrame)?;
        imm as u64 + adjust * 8
    } else {
        extract(encoding, FRAMELESS_STACK_SIZE) as u64 * 8
    };

    let rsp = cursor.current_context.rsp;
    if rsp == 0 || stack_size == 0 {
        return Ok(EngineOutcome::NoFrame);
    }

    let slots = unpermute(permutation, reg_count)?;
    let saved_regs_base = rsp + stack_size - 8 * (reg_count as u64 + 1);

    let mut next = cursor.current_context;
    for (i, slot) in slots.iter().enumerate().take(reg_count as usize) {
        if let Some(reg) = slot {
            let addr = saved_regs_base + (i as u64) * 8;
            let value = safe_read_word(addr as usize).ok_or(UnwindError::BadFrame)?;
            next.set(*reg, value);
        }
    }

    let rip_addr = saved_regs_base + (reg_count as u64) * 8;
    let rip = safe_read_word(rip_addr as usize).ok_or(UnwindError::BadFrame)?;
    if rip == 0 {
        return Ok(EngineOutcome::NoFrame);
    }

    next.rip = rip;
    next.rsp = rsp + stack_size;
    cursor.current_context = next;
    Ok(EngineOutcome::Success)
}

/// Entry point: looks up `rip`'s encoding in `image`'s `__unwind_info`
/// section and dispatches on its mode.
pub fn step(cursor: &mut Cursor, image: &ImageRecord) -> EngineResult {
    if image.unwind_info_range.is_empty() {
        return Ok(EngineOutcome::NoInfo);
    }

    let function_offset = (cursor.rip() - image.header_addr) as u32;
    let header = read_header(image.unwind_info_range.base).ok_or(UnwindError::BadFrame)?;
    if header.version != UNWIND_SECTION_VERSION {
        return Ok(EngineOutcome::NoInfo);
    }
    let Some(encoding) = find_encoding(image.unwind_info_range.base, &header, function_offset)
    else {
        return Ok(EngineOutcome::NoInfo);
    };

    match encoding & UNWIND_X86_64_MODE_MASK {
        MODE_RBP_FRAME => apply_rbp_frame(cursor, encoding),
        MODE_STACK_IMMD => {
            let function_start = image.header_addr + function_offset as u64;
            apply_frameless(cursor, encoding, function_start, false)
        }
        MODE_STACK_IND => {
            let function_start = image.header_addr + function_offset as u64;
            apply_frameless(cursor, encoding, function_start, true)
        }
        MODE_DWARF => Ok(EngineOutcome::NoInfo),
        _ => Err(UnwindError::BadFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnwindContext;

    #[test]
    fn extract_reads_right_justified_field() {
        assert_eq!(extract(0x0030_0000, RBP_FRAME_OFFSET), 0);
        assert_eq!(extract(MODE_RBP_FRAME, UNWIND_X86_64_MODE_MASK), 1);
        assert_eq!(extract(MODE_STACK_IND, UNWIND_X86_64_MODE_MASK), 3);
    }

    #[test]
    fn unpermute_three_registers() {
        // permutation=7, n=3: permunreg = [7/20, (7%20)/4, (7%20)%4] = [0, 1, 3].
        // Walking the unused-register list with those indices picks RBX (1st
        // unused), then R13 (2nd unused after RBX), then RBP (4th unused
        // after RBX/R13).
        let slots = unpermute(7, 3).unwrap();
        assert_eq!(
            &slots[..3],
            &[
                Some(RegisterId::Rbx),
                Some(RegisterId::R13),
                Some(RegisterId::Rbp)
            ]
        );
    }

    #[test]
    fn register_for_slot_rejects_invalid_ids() {
        assert!(register_for_slot(7).is_err());
        assert_eq!(register_for_slot(0).unwrap(), None);
        assert_eq!(register_for_slot(1).unwrap(), Some(RegisterId::Rbx));
    }

    #[test]
    fn rbp_frame_recovers_return_address_and_saved_register() {
        // Fake stack frame on our own stack: [rbp+0] = saved rbp,
        // [rbp+8] = return address.
        let mut stack = [0u64; 2];
        stack[0] = 0x7F00; // saved rbp
        stack[1] = 0x1122_3344; // return address
        let rbp = stack.as_ptr() as u64;

        let mut ctx = UnwindContext::default();
        ctx.rbp = rbp;
        let mut cursor = Cursor::init(ctx);

        // RBP-frame mode, no saved callee registers encoded.
        let encoding = MODE_RBP_FRAME;
        let outcome = apply_rbp_frame(&mut cursor, encoding).unwrap();
        assert_eq!(outcome, EngineOutcome::Success);
        assert_eq!(cursor.current_context.rip, 0x1122_3344);
        assert_eq!(cursor.current_context.rbp, 0x7F00);
        assert_eq!(cursor.current_context.rsp, rbp + 16);
    }

    #[test]
    fn frameless_immediate_restores_permuted_registers() {
        // 3 saved registers at permutation index 7 decode to {RBX, R13, RBP}
        // (see `unpermute_three_registers`), with stack size 0x28 (5 words).
        // saved_regs_base = rsp + stack_size - 8*(n+1) = rsp+0x28-0x20 = rsp+0x08,
        // so stack[1..4) hold the three saved regs and stack[4] holds rip.
        let mut stack = [0u64; 6];
        let rsp = stack.as_mut_ptr() as u64;
        stack[1] = 0x11; // rbx
        stack[2] = 0x22; // r13
        stack[3] = 0x33; // rbp
        stack[4] = 0xABCD; // return address

        let mut ctx = UnwindContext::default();
        ctx.rsp = rsp;
        let mut cursor = Cursor::init(ctx);

        let reg_count = 3u32;
        let permutation = 7u32;
        let stack_size_words = 5u32; // 0x28 bytes
        let encoding = MODE_STACK_IMMD
            | ((stack_size_words << FRAMELESS_STACK_SIZE.trailing_zeros()) & FRAMELESS_STACK_SIZE)
            | ((reg_count << FRAMELESS_REG_COUNT.trailing_zeros()) & FRAMELESS_REG_COUNT)
            | (permutation & FRAMELESS_REG_PERMUTATION);

        let outcome = apply_frameless(&mut cursor, encoding, 0x1000, false).unwrap();
        assert_eq!(outcome, EngineOutcome::Success);
        assert_eq!(cursor.current_context.rbx, 0x11);
        assert_eq!(cursor.current_context.r13, 0x22);
        assert_eq!(cursor.current_context.rbp, 0x33);
        assert_eq!(cursor.current_context.rip, 0xABCD);
        assert_eq!(cursor.current_context.rsp, rsp + 5 * 8);
    }
}
