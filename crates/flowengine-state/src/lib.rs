// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable storage for workflow runs: the row shapes ([`models`]), the
//! backend-agnostic [`store::StateStore`] trait, a SQLite-backed implementation
//! ([`sqlite::SqliteStateStore`]), and a [`runner::Runner`]-facing
//! [`observer::StateStoreObserver`] that persists run/step transitions as they
//! happen.

pub mod models;
pub mod observer;
pub mod sqlite;
pub mod store;

pub use models::{EventRecord, MemoryRecord, RunStatus, StepExecution, StepStatus, SuspensionRecord, WorkflowRun};
pub use observer::StateStoreObserver;
pub use sqlite::SqliteStateStore;
pub use store::{Result, StateStore, StoreError};
