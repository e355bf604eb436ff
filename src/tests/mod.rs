// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Scenario tests spanning several modules.
//!
//! ## Test Organization
//!
//! - **state_machine**: one unit through every step, with scripted commands
//!   and HTTP answers and a real host process
//! - **batch**: whole catalogs, failure isolation and the persisted report
//!
//! Host processes are real children (`sleep`, `sh`), so these tests need a
//! Unix system.

pub mod common;
