//! Assertions over run reports and plans.

use crate::executor::{RunReport, StageStatus};
use crate::plan::ExecutionPlan;

/// Asserts that no required stage failed.
pub fn assert_run_succeeded(report: &RunReport) {
    let failed: Vec<_> = report
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Failed)
        .map(|s| (s.stage.as_str(), s.error.as_ref().map(ToString::to_string)))
        .collect();
    assert!(report.success, "Expected run to succeed; failed stages: {failed:?}");
}

/// Asserts that the run was aborted.
pub fn assert_run_failed(report: &RunReport) {
    assert!(!report.success, "Expected run to fail, but it succeeded");
}

/// Asserts a stage's final status.
pub fn assert_stage_status(report: &RunReport, stage: &str, expected: StageStatus) {
    let actual = report.status_of(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}, got {actual:?}"
    );
}

/// Asserts the plan's batches as lists of stage IDs, ignoring grouping.
pub fn assert_batches(plan: &ExecutionPlan, expected: &[&[&str]]) {
    let actual: Vec<Vec<&str>> = plan.batches.iter().map(|b| b.stage_ids().collect()).collect();
    let expected: Vec<Vec<&str>> = expected.iter().map(|b| b.to_vec()).collect();
    assert_eq!(actual, expected, "Plan batches differ");
}
