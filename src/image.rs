// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-image parsed metadata (component I: Image Index).
//!
//! An [`ImageRecord`] is populated once, by the image-load callback, from
//! section ranges the binary-image-format header parser hands us — that
//! parser lives outside this crate (see the crate-level docs). Everything
//! here just stores and queries the ranges it is given.

/// A contiguous range in the target address space, plus its length for
/// convenience. Invariant: `end == base + length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub base: u64,
    pub end: u64,
    pub length: u64,
}

impl Range {
    pub const EMPTY: Range = Range {
        base: 0,
        end: 0,
        length: 0,
    };

    pub fn new(base: u64, length: u64) -> Self {
        Range {
            base,
            end: base + length,
            length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        !self.is_empty() && addr >= self.base && addr <= self.end
    }
}

/// Index/count partition of an image's symbol table between global and
/// local entries, as recorded by the dynamic-symbol-table load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolPartition {
    pub first_global_symbol: u32,
    pub num_global_symbols: u32,
    pub first_local_symbol: u32,
    pub num_local_symbols: u32,
}

/// Per-image parsed view, immutable after construction. Owned by the
/// registry; constructed only by the image-add callback, destroyed only by
/// the image-remove callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Load address of the image header in the target address space; also
    /// the key used to find this record again on image-unload.
    pub header_addr: u64,
    /// Difference between link-time and load-time base address.
    pub slide: i64,
    pub text_range: Range,
    pub eh_frame_range: Range,
    pub debug_frame_range: Range,
    pub unwind_info_range: Range,
    pub symbol_table_range: Range,
    pub string_table_range: Range,
    pub linkedit_range: Range,
    /// Discriminant selecting the 32- or 64-bit symbol-table entry layout.
    pub is_64bit: bool,
    pub symbol_info: SymbolPartition,
    pub name: Option<String>,
    pub path: Option<String>,
}

impl ImageRecord {
    /// Rebase the symbol and string table ranges, which the header parser
    /// reports as file offsets, by the linkedit segment's runtime base —
    /// mirroring the rebase the original image parser performs once all
    /// load commands have been walked.
    pub fn rebase_symbol_tables(&mut self) {
        if self.linkedit_range.base == 0 || self.symbol_table_range.base == 0 {
            return;
        }
        let base = self.linkedit_range.base;
        self.symbol_table_range.base += base;
        self.symbol_table_range.end += base;
        self.string_table_range.base += base;
        self.string_table_range.end += base;
    }
}

/// Builder mirroring the image-load callback's incremental construction: the
/// header parser reports sections one at a time as it walks load commands,
/// and only at the end do we know whether to rebase against linkedit.
#[derive(Debug, Default)]
pub struct ImageRecordBuilder {
    record: ImageRecord,
}

impl Default for ImageRecord {
    fn default() -> Self {
        ImageRecord {
            header_addr: 0,
            slide: 0,
            text_range: Range::EMPTY,
            eh_frame_range: Range::EMPTY,
            debug_frame_range: Range::EMPTY,
            unwind_info_range: Range::EMPTY,
            symbol_table_range: Range::EMPTY,
            string_table_range: Range::EMPTY,
            linkedit_range: Range::EMPTY,
            is_64bit: true,
            symbol_info: SymbolPartition::default(),
            name: None,
            path: None,
        }
    }
}

impl ImageRecordBuilder {
    pub fn new(header_addr: u64, slide: i64, is_64bit: bool) -> Self {
        ImageRecordBuilder {
            record: ImageRecord {
                header_addr,
                slide,
                is_64bit,
                ..ImageRecord::default()
            },
        }
    }

    pub fn text_range(mut self, r: Range) -> Self {
        self.record.text_range = r;
        self
    }

    pub fn eh_frame_range(mut self, r: Range) -> Self {
        self.record.eh_frame_range = r;
        self
    }

    pub fn debug_frame_range(mut self, r: Range) -> Self {
        self.record.debug_frame_range = r;
        self
    }

    pub fn unwind_info_range(mut self, r: Range) -> Self {
        self.record.unwind_info_range = r;
        self
    }

    pub fn symbol_table_range(mut self, r: Range) -> Self {
        self.record.symbol_table_range = r;
        self
    }

    pub fn string_table_range(mut self, r: Range) -> Self {
        self.record.string_table_range = r;
        self
    }

    pub fn linkedit_range(mut self, r: Range) -> Self {
        self.record.linkedit_range = r;
        self
    }

    pub fn symbol_info(mut self, p: SymbolPartition) -> Self {
        self.record.symbol_info = p;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.record.name = Some(name.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.record.path = Some(path.into());
        self
    }

    pub fn build(mut self) -> ImageRecord {
        self.record.rebase_symbol_tables();
        self.record
    }
}

/// x86_64 fast-reject: any address whose high 32 bits are all zero cannot be
/// a valid code address in a normal user-space mapping.
pub fn is_plausible_code_address(addr: u64) -> bool {
    (addr & 0xFFFF_FFFF_0000_0000) != 0
}
