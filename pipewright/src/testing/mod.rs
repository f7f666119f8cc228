//! Test helpers for pipewright users.
//!
//! - Mock agents with call counting, failures, flakiness and delays
//! - A temporary definition directory
//! - Assertions over run reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_batches, assert_run_failed, assert_run_succeeded, assert_stage_status};
pub use fixtures::DefinitionDir;
pub use mocks::{FailingAgent, FlakyAgent, MockAgent, SlowAgent};
