// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edirelay engine entry point.
//!
//! Parses the command line, guards against concurrent and crashed runs and
//! executes the requested run commands in their fixed order.

pub mod cli;
pub mod driver;
pub mod error;
pub mod lock;

pub use cli::Cli;
pub use driver::{Driver, RunSummary, run};
pub use error::DriverError;
