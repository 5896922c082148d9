// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Fleetmux orchestrator CLI library — argument parsing and service wiring
//! extracted from `main.rs` so both can be exercised from tests.

pub mod cli;
pub mod server;

pub use cli::{Cli, Transport};
pub use server::run;
