// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The four unwind engines tried in cascade order by [`crate::step::step`].

pub mod compact;
pub mod dwarf;
pub mod frame_pointer;
pub mod stack_scan;
