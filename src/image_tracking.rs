// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `set_image_tracking` and the registration seam the external
//! binary-image-format parser calls through.
//!
//! Parsing Mach-O/ELF headers into [`ImageRecord`]s is explicitly out of
//! scope for this crate (see the crate-level docs): some other collaborator
//! walks load commands and calls [`register_image`]/[`unregister_image`] as
//! images come and go. What *is* in scope is the seam itself, the idempotent
//! on/off switch, and resolving the `start`/`thread_start` pseudo-symbols
//! once tracking is turned on — both of which need nothing but the registry
//! and symbol-table queries this crate already owns.

use portable_atomic::{AtomicBool, Ordering};

use crate::image::ImageRecord;
use crate::registry::Registry;
use crate::{sentinel, symbols};

static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable/disable image-load/unload tracking. Idempotent: enabling twice in
/// a row only resolves the pseudo-symbols once. Not async-safe — it may walk
/// the registry's symbol tables, which is fine outside signal context but is
/// not something a signal handler should ever call.
pub fn set_image_tracking(on: bool, registry: &Registry) {
    let was_enabled = TRACKING_ENABLED.swap(on, Ordering::SeqCst);
    if on && !was_enabled {
        resolve_sentinels(registry);
    }
}

pub fn is_tracking_enabled() -> bool {
    TRACKING_ENABLED.load(Ordering::Acquire)
}

/// Called by the external image-load callback once it has built a record
/// from a newly mapped image's headers. A no-op while tracking is disabled.
pub fn register_image(record: ImageRecord, registry: &Registry) {
    if is_tracking_enabled() {
        registry.append(record);
    }
}

/// Called by the external image-unload callback. Returns whether a matching
/// record was found and removed. A no-op (returning `false`) while tracking
/// is disabled.
pub fn unregister_image(header_addr: u64, registry: &Registry) -> bool {
    if is_tracking_enabled() {
        registry.remove(header_addr)
    } else {
        false
    }
}

/// Resolves `start` and `thread_start` by name, then forward-scans to the
/// next symbol boundary to bound the pseudo-symbol range, per the
/// pseudo-symbol detection rule.
fn resolve_sentinels(registry: &Registry) {
    if let Some(start) = symbols::lookup_symbol(registry, "start") {
        let next = symbols::next_symbol_address(registry, start);
        sentinel::set_start_symbol(start, next);
    }
    if let Some(thread_start) = symbols::lookup_symbol(registry, "thread_start") {
        let next = symbols::next_symbol_address(registry, thread_start);
        sentinel::set_thread_start_symbol(thread_start, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageRecordBuilder, Range, SymbolPartition};

    fn build_image_with_symbols(entries: &[(&str, u64)]) -> (Vec<u8>, Vec<u8>, ImageRecord) {
        let mut strtab = vec![0u8];
        let mut symtab = Vec::new();
        for (name, value) in entries {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symtab.extend_from_slice(&strx.to_le_bytes());
            symtab.push(0xe); // N_SECT, defined non-debug
            symtab.push(0);
            symtab.extend_from_slice(&0i16.to_le_bytes());
            symtab.extend_from_slice(&value.to_le_bytes());
        }
        let symtab_addr = symtab.as_ptr() as u64;
        let strtab_addr = strtab.as_ptr() as u64;
        let record = ImageRecordBuilder::new(0x1000, 0, true)
            .text_range(Range::new(0x0000_7f00_0000_1000, 0x2000))
            .symbol_table_range(Range::new(symtab_addr, symtab.len() as u64))
            .string_table_range(Range::new(strtab_addr, strtab.len() as u64))
            .symbol_info(SymbolPartition {
                first_global_symbol: 0,
                num_global_symbols: entries.len() as u32,
                first_local_symbol: entries.len() as u32,
                num_local_symbols: 0,
            })
            .build();
        (symtab, strtab, record)
    }

    #[test]
    fn tracking_gate_blocks_registration_until_enabled() {
        let registry = Registry::new();
        let record = ImageRecordBuilder::new(0x1000, 0, true).build();

        assert!(!unregister_image(0x1000, &registry));
        register_image(record.clone(), &registry);
        assert!(registry.image_containing_address(0x5000).is_none());

        set_image_tracking(true, &registry);
        register_image(record, &registry);
        set_image_tracking(false, &registry);
    }

    #[test]
    fn enabling_tracking_resolves_start_sentinel() {
        let _lock = sentinel::SENTINEL_TEST_LOCK.lock().unwrap();
        const BASE: u64 = 0x0000_7f00_0000_1000;
        let (_sym, _str, record) =
            build_image_with_symbols(&[("start", BASE), ("main", BASE + 0x200)]);
        let registry = Registry::new();
        registry.append(record);

        set_image_tracking(true, &registry);
        assert!(sentinel::is_sentinel(BASE));
        assert!(!sentinel::is_sentinel(BASE + 0x200));
    }
}
