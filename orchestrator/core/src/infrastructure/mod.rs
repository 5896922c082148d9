// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure layer: concrete mechanisms the application layer composes
//! — TTL+LRU caches (C1), per-child connection pools and circuit breakers
//! (C2), the file-backed Config Store (C3), the Process Supervisor (C4),
//! the Discovery Engine (C5), and the Usage Tracker (C7).

pub mod cache;
pub mod child_session;
pub mod config_store;
pub mod discovery;
pub mod pool;
pub mod process_supervisor;
pub mod usage_tracker;
