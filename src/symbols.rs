// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Symbol-table queries (`lookup_symbol`, `get_symbol_info`) over an
//! image's already-rebased symbol/string table ranges.
//!
//! Entries follow Mach-O's `nlist`/`nlist_64` layout, selected per-image by
//! [`crate::image::ImageRecord::is_64bit`]. Reads go through
//! [`crate::memory::safe_read`]; a short read anywhere in a table simply
//! ends that scan rather than erroring, since we may be racing an unmapped
//! page at signal time.

use crate::image::ImageRecord;
use crate::memory::safe_read;
use crate::registry::Registry;

const N_STAB: u8 = 0xe0;
const N_TYPE: u8 = 0x0e;
const N_SECT: u8 = 0xe;

const NLIST32_SIZE: u64 = 12;
const NLIST64_SIZE: u64 = 16;

const MAX_SYMBOL_NAME_LEN: usize = 256;

struct RawSymbol {
    n_strx: u32,
    n_type: u8,
    n_value: u64,
}

fn is_section_defined_non_debug(n_type: u8) -> bool {
    (n_type & N_TYPE) == N_SECT && (n_type & N_STAB) == 0
}

fn read_symbol_at(base: u64, index: u32, is_64bit: bool) -> Option<RawSymbol> {
    if is_64bit {
        let addr = base + (index as u64) * NLIST64_SIZE;
        let n_strx = u32::from_le_bytes(safe_read::<4>(addr as usize)?);
        let n_type = safe_read::<1>((addr + 4) as usize)?[0];
        let n_value = u64::from_le_bytes(safe_read::<8>((addr + 8) as usize)?);
        Some(RawSymbol {
            n_strx,
            n_type,
            n_value,
        })
    } else {
        let addr = base + (index as u64) * NLIST32_SIZE;
        let n_strx = u32::from_le_bytes(safe_read::<4>(addr as usize)?);
        let n_type = safe_read::<1>((addr + 4) as usize)?[0];
        let n_value = u32::from_le_bytes(safe_read::<4>((addr + 8) as usize)?) as u64;
        Some(RawSymbol {
            n_strx,
            n_type,
            n_value,
        })
    }
}

/// Reads up to `MAX_SYMBOL_NAME_LEN` bytes of a NUL-terminated string table
/// entry into a fixed stack buffer and compares it against `name`.
fn string_table_entry_matches(string_table_base: u64, strx: u32, name: &str) -> bool {
    let addr = string_table_base + strx as u64;
    let want = name.as_bytes();
    if want.len() >= MAX_SYMBOL_NAME_LEN {
        return false;
    }
    let mut offset = 0usize;
    while offset < want.len() {
        let Some(byte) = safe_read::<1>(addr as usize + offset) else {
            return false;
        };
        if byte[0] != want[offset] {
            return false;
        }
        offset += 1;
    }
    // Must be exactly `want.len()` bytes followed by NUL, not a prefix.
    matches!(safe_read::<1>(addr as usize + offset), Some([0]))
}

enum SymbolRegion {
    Global,
    Local,
}

fn scan_region(
    image: &ImageRecord,
    region: SymbolRegion,
    mut visit: impl FnMut(&RawSymbol) -> bool,
) {
    let (first, count) = match region {
        SymbolRegion::Global => (
            image.symbol_info.first_global_symbol,
            image.symbol_info.num_global_symbols,
        ),
        SymbolRegion::Local => (
            image.symbol_info.first_local_symbol,
            image.symbol_info.num_local_symbols,
        ),
    };
    for i in first..first.saturating_add(count) {
        let Some(sym) = read_symbol_at(image.symbol_table_range.base, i, image.is_64bit) else {
            return;
        };
        if !is_section_defined_non_debug(sym.n_type) {
            continue;
        }
        if !visit(&sym) {
            return;
        }
    }
}

/// Name → address. Searches global symbols first, then local, across every
/// registered image's symbol table.
pub fn lookup_symbol(registry: &Registry, name: &str) -> Option<u64> {
    let guard = registry.read();
    for image in guard.iter() {
        let mut found = None;
        for region in [SymbolRegion::Global, SymbolRegion::Local] {
            scan_region(image, region, |sym| {
                if string_table_entry_matches(image.string_table_range.base, sym.n_strx, name) {
                    found = Some((sym.n_value as i64 + image.slide) as u64);
                    false
                } else {
                    true
                }
            });
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

/// Result of [`get_symbol_info`]: the nearest-preceding symbol's address and
/// (if available) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub start_address: u64,
    pub name: Option<String>,
}

/// Address → nearest-preceding symbol. Locates the image containing `ip`,
/// then finds the highest-valued symbol (global or local) whose runtime
/// value is `<= ip`.
pub fn get_symbol_info(registry: &Registry, ip: u64) -> Option<SymbolInfo> {
    let image = registry.image_containing_address(ip)?;
    let target = (ip as i64 - image.slide) as u64;

    let mut best: Option<(u64, u32)> = None; // (value, strx)
    for region in [SymbolRegion::Global, SymbolRegion::Local] {
        scan_region(&image, region, |sym| {
            if sym.n_value <= target && best.map(|(v, _)| sym.n_value > v).unwrap_or(true) {
                best = Some((sym.n_value, sym.n_strx));
            }
            true
        });
    }

    best.map(|(value, strx)| SymbolInfo {
        start_address: (value as i64 + image.slide) as u64,
        name: read_symbol_name(image.string_table_range.base, strx),
    })
}

/// Smallest symbol value strictly greater than `addr` in the image
/// containing `addr`, in runtime (slid) address space. Used to cap
/// pseudo-symbol scan ranges (see [`crate::sentinel`]) at the next symbol
/// boundary rather than always hitting the byte cap.
pub fn next_symbol_address(registry: &Registry, addr: u64) -> Option<u64> {
    let image = registry.image_containing_address(addr)?;
    let target = (addr as i64 - image.slide) as u64;

    let mut best: Option<u64> = None;
    for region in [SymbolRegion::Global, SymbolRegion::Local] {
        scan_region(&image, region, |sym| {
            if sym.n_value > target && best.map(|v| sym.n_value < v).unwrap_or(true) {
                best = Some(sym.n_value);
            }
            true
        });
    }
    best.map(|value| (value as i64 + image.slide) as u64)
}

fn read_symbol_name(string_table_base: u64, strx: u32) -> Option<String> {
    let addr = string_table_base + strx as u64;
    let mut bytes = Vec::with_capacity(32);
    for offset in 0..MAX_SYMBOL_NAME_LEN {
        let byte = safe_read::<1>(addr as usize + offset)?[0];
        if byte == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(byte);
    }
    None
}
