// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An async-signal-safe x86_64 stack unwinder for in-process crash handlers.
//!
//! Given a register snapshot — captured from the current thread inside a
//! signal handler, or read from another thread's kernel state — [`step`]
//! walks the chain of call frames one at a time, recovering at each step the
//! return address and whatever callee-saved registers the available
//! metadata lets it reconstruct. It tries, in order, a compact-unwind table
//! decoder, a DWARF Call-Frame-Information interpreter, an opt-in
//! frame-pointer walker, and a last-resort stack scan.
//!
//! # Scope
//!
//! This crate is the unwinder core only: the [`registry`] of loaded-image
//! metadata, the per-image [`image`] index, the [`step`] cascade, and the
//! four [`engines`]. Parsing Mach-O/ELF headers into [`ImageRecord`]s,
//! writing out a crash report, installing signal handlers, and symbol
//! demangling are all treated as external collaborators — see
//! [`image_tracking::register_image`] for the seam the header parser calls
//! through.
//!
//! # Safety contract
//!
//! [`step`] and everything it calls are async-signal-safe: no allocation,
//! no locks any other thread might hold, and every memory access goes
//! through [`memory::safe_read`], which fails rather than faulting the
//! caller. [`set_image_tracking`], [`register_image`], [`unregister_image`],
//! and [`get_thread_context`] are *not* async-safe and must only be called
//! outside signal context.

pub mod context;
pub mod cursor;
pub mod engines;
pub mod error;
mod image_tracking;
pub mod image;
pub mod leb128;
pub mod memory;
pub mod registry;
pub mod sentinel;
mod step;
pub mod symbols;
mod thread_context;
mod trace;

pub use context::{register_name, RegisterId, UnwindContext};
pub use cursor::{Cursor, StepFlags};
pub use error::{EngineOutcome, StepResult, UnwindError};
pub use image::{ImageRecord, ImageRecordBuilder, Range, SymbolPartition};
pub use registry::Registry;
pub use symbols::SymbolInfo;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use thread_context::{context_from_ucontext, get_thread_context};

/// Process-wide singleton registry of loaded-image records. There is exactly
/// one of these per process: the registry models real shared kernel-adjacent
/// state (the set of currently mapped images), not a value callers construct
/// per unwind.
static REGISTRY: Registry = Registry::new();

/// Returns the process-wide image registry.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Enables or disables image-load/unload tracking. Idempotent. Not
/// async-safe: resolving the `start`/`thread_start` pseudo-symbols walks
/// symbol tables, which this function only does on the off-to-on edge.
pub fn set_image_tracking(on: bool) {
    image_tracking::set_image_tracking(on, &REGISTRY);
}

/// Registers a newly loaded image. Called by the external image-load
/// callback once it has parsed the image's headers into an [`ImageRecord`].
/// A no-op while tracking is disabled. Not async-safe.
pub fn register_image(record: ImageRecord) {
    image_tracking::register_image(record, &REGISTRY);
}

/// Unregisters an image by its header address. Called by the external
/// image-unload callback. Returns whether a matching record was found. Not
/// async-safe — blocks until any in-flight signal-time reader of the
/// registry drains.
pub fn unregister_image(header_addr: u64) -> bool {
    image_tracking::unregister_image(header_addr, &REGISTRY)
}

/// Constructs a cursor from a context snapshot. The cursor is valid until
/// discarded; it holds no heap resources and borrows nothing.
pub fn init_cursor(context: UnwindContext) -> Cursor {
    Cursor::init(context)
}

/// Advances `cursor` by one frame. Async-signal-safe.
pub fn step(cursor: &mut Cursor, flags: StepFlags) -> StepResult {
    step::step(cursor, flags, &REGISTRY)
}

/// Reads a register out of the cursor's current frame. Only `rip` is
/// guaranteed meaningful beyond the first frame.
pub fn get_register(cursor: &Cursor, reg: RegisterId) -> Result<u64, UnwindError> {
    cursor.current_context.get(reg)
}

/// Name → address, searched across every registered image's symbol table.
pub fn lookup_symbol(name: &str) -> Option<u64> {
    symbols::lookup_symbol(&REGISTRY, name)
}

/// Address → nearest-preceding symbol.
pub fn get_symbol_info(ip: u64) -> Option<SymbolInfo> {
    symbols::get_symbol_info(&REGISTRY, ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_registers_an_image_and_walks_a_frame_pointer_chain() {
        set_image_tracking(true);

        let frame: [u64; 2] = [0, 0x0000_7f00_dead_beef];
        let mut ctx = UnwindContext::default();
        ctx.rbp = frame.as_ptr() as u64;
        ctx.rsp = ctx.rbp;
        let mut cursor = init_cursor(ctx);

        let result = step(&mut cursor, StepFlags::TRY_FRAME_POINTER);
        assert_eq!(result, StepResult::Success);
        assert_eq!(get_register(&cursor, RegisterId::Rip).unwrap(), 0x0000_7f00_dead_beef);

        set_image_tracking(false);
    }

    #[test]
    fn register_name_is_stable_public_surface() {
        assert_eq!(register_name(RegisterId::Rip), "rip");
    }
}
