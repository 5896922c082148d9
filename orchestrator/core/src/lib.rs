// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Core domain and runtime primitives for the fleetmux tool orchestrator: a
//! host process that manages a fleet of subprocess-based JSON-RPC servers
//! speaking a shared Tool Protocol, aggregates their tools behind one
//! upstream endpoint, and routes `tools/call` to the right child.
//!
//! Layout follows the bounded-context split the fleetmux workspace uses:
//! `domain` holds entities and pure state transitions, `infrastructure` holds
//! the concrete cache/pool/process/discovery/tracker/config mechanisms,
//! `application` composes them into the router and supervisory policy, and
//! `presentation` exposes the upstream JSON-RPC transports and the HTTP
//! control surface.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
