// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Application layer: composes the infrastructure mechanisms (C1-C5, C7)
//! into the Proxy Router (C6) — the one place that knows how a `tools/list`
//! catalog gets filtered by the active profile and how a `tools/call`
//! reaches a pooled connection, gets cached, and gets recorded.

pub mod router_service;
