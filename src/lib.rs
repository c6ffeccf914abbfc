// Copyright 2026 Timeloom Contributors
// SPDX-License-Identifier: Apache-2.0

//! Timeloom library — reconstruct browsable website snapshots from a web
//! archive's capture history.
//!
//! This library crate exposes the core modules for integration testing.

pub mod config;
pub mod dates;
pub mod error;
pub mod fetch;
pub mod index;
pub mod layout;
pub mod orchestrator;
pub mod rebuild;
