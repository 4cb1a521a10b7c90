// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debug-only tracing around cascade engine attempts.
//!
//! Gated on the `verbose_trace` feature *and* `debug_assertions`, so a
//! release build never carries the formatting/event machinery: the cascade
//! can run from a signal handler, where `tracing`'s subscriber dispatch is
//! not something we can promise is async-safe.

#[cfg(all(feature = "verbose_trace", debug_assertions))]
macro_rules! engine_trace {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) };
}

#[cfg(not(all(feature = "verbose_trace", debug_assertions)))]
macro_rules! engine_trace {
    ($($arg:tt)*) => {{}};
}

pub(crate) use engine_trace;
