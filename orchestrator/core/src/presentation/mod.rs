// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Presentation layer: the two upstream Tool Protocol transports (stdio,
//! WebSocket) framing a shared dispatch core, and the HTTP Control API
//! (C8) used by operators and the orchestrator's own UI.

pub mod control_api;
pub mod rpc_dispatch;
pub mod stdio;
pub mod ws;
