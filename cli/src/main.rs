// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! `orchestrator` binary entrypoint. Argument parsing and service wiring
//! live in the library crate so `server::run` can be exercised from tests.

use clap::Parser;

use fleetmux_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let code = fleetmux_cli::run(cli).await?;
    std::process::exit(code);
}
