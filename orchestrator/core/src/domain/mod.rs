// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Domain layer: entities, invariants, and pure state transitions. Nothing
//! here touches disk, the network, or a subprocess — that belongs to
//! `infrastructure`.

pub mod call_record;
pub mod child;
pub mod connection;
pub mod errors;
pub mod jsonrpc;
pub mod profile;
pub mod tool;
