// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The x86_64 general-register set and its textual names.

use crate::error::UnwindError;

/// A flat snapshot of the x86_64 general-purpose, instruction-pointer, and
/// stack/frame registers, plus segment/flags registers, as captured from
/// kernel thread state or updated by a stepper engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct UnwindContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

/// DWARF register-column numbers for x86_64, used both by the CFA
/// interpreter (which indexes saved-rule state by these columns) and as the
/// stable `reg_id` surface for [`UnwindContext::get`]/[`register_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RegisterId {
    Rax = 0,
    Rdx = 1,
    Rcx = 2,
    Rbx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
}

/// Number of DWARF register columns the CFA interpreter tracks. Columns
/// beyond this (e.g. return-address column aliases, vector registers) are
/// out of scope; see the module Non-goals.
pub const NUM_DWARF_COLUMNS: usize = 17;

impl RegisterId {
    /// Parses a DWARF register-column number into a [`RegisterId`].
    pub fn from_dwarf_column(column: u64) -> Option<Self> {
        Self::from_index(column as usize)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        use RegisterId::*;
        Some(match index {
            0 => Rax,
            1 => Rdx,
            2 => Rcx,
            3 => Rbx,
            4 => Rsi,
            5 => Rdi,
            6 => Rbp,
            7 => Rsp,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            15 => R15,
            16 => Rip,
            _ => return None,
        })
    }

    /// Parses a register name (as produced by [`register_name`]) back into
    /// an id. Total over the supported name set; round-trips with
    /// `register_name`.
    pub fn from_name(name: &str) -> Option<Self> {
        use RegisterId::*;
        Some(match name {
            "rax" => Rax,
            "rdx" => Rdx,
            "rcx" => Rcx,
            "rbx" => Rbx,
            "rsi" => Rsi,
            "rdi" => Rdi,
            "rbp" => Rbp,
            "rsp" => Rsp,
            "r8" => R8,
            "r9" => R9,
            "r10" => R10,
            "r11" => R11,
            "r12" => R12,
            "r13" => R13,
            "r14" => R14,
            "r15" => R15,
            "rip" => Rip,
            _ => return None,
        })
    }
}

/// Static, never-null name for any valid register id. Total over
/// [`RegisterId`]; composing with [`RegisterId::from_name`] is identity on
/// the supported name set.
pub fn register_name(reg: RegisterId) -> &'static str {
    use RegisterId::*;
    match reg {
        Rax => "rax",
        Rdx => "rdx",
        Rcx => "rcx",
        Rbx => "rbx",
        Rsi => "rsi",
        Rdi => "rdi",
        Rbp => "rbp",
        Rsp => "rsp",
        R8 => "r8",
        R9 => "r9",
        R10 => "r10",
        R11 => "r11",
        R12 => "r12",
        R13 => "r13",
        R14 => "r14",
        R15 => "r15",
        Rip => "rip",
    }
}

impl UnwindContext {
    /// Reads a register out of the cursor's current frame. Only `rip` is
    /// guaranteed meaningful beyond the first frame: the cascade does not
    /// promise to recover every callee-saved register at every depth (e.g.
    /// the stack-scan engine only ever updates `rip`/`rbp`).
    pub fn get(&self, reg: RegisterId) -> Result<u64, UnwindError> {
        use RegisterId::*;
        Ok(match reg {
            Rax => self.rax,
            Rdx => self.rdx,
            Rcx => self.rcx,
            Rbx => self.rbx,
            Rsi => self.rsi,
            Rdi => self.rdi,
            Rbp => self.rbp,
            Rsp => self.rsp,
            R8 => self.r8,
            R9 => self.r9,
            R10 => self.r10,
            R11 => self.r11,
            R12 => self.r12,
            R13 => self.r13,
            R14 => self.r14,
            R15 => self.r15,
            Rip => self.rip,
        })
    }

    pub fn set(&mut self, reg: RegisterId, value: u64) {
        use RegisterId::*;
        match reg {
            Rax => self.rax = value,
            Rdx => self.rdx = value,
            Rcx => self.rcx = value,
            Rbx => self.rbx = value,
            Rsi => self.rsi = value,
            Rdi => self.rdi = value,
            Rbp => self.rbp = value,
            Rsp => self.rsp = value,
            R8 => self.r8 = value,
            R9 => self.r9 = value,
            R10 => self.r10 = value,
            R11 => self.r11 = value,
            R12 => self.r12 = value,
            R13 => self.r13 = value,
            R14 => self.r14 = value,
            R15 => self.r15 = value,
            Rip => self.rip = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_name_is_total_and_round_trips() {
        for idx in 0..NUM_DWARF_COLUMNS {
            let reg = RegisterId::from_index(idx).expect("valid column");
            let name = register_name(reg);
            assert!(!name.is_empty());
            assert_eq!(RegisterId::from_name(name), Some(reg));
        }
    }

    #[test]
    fn get_set_round_trip() {
        let mut ctx = UnwindContext::default();
        ctx.set(RegisterId::Rbx, 0x42);
        assert_eq!(ctx.get(RegisterId::Rbx).unwrap(), 0x42);
    }
}
