//! Runs a single test function and reports its result.
//!
//! The teacher recovers from a panicking test via `catch_panic!`'s
//! setjmp/longjmp; this workspace's [`crate::catch_panic!`] just runs the
//! block directly, so a panicking test aborts the whole suite run instead
//! of being caught as a `Panic` result. `run_single_test` still reports
//! `TestResult::Pass`/`Fail` for tests that return normally.

use super::TestResult;

pub fn run_single_test<F: FnOnce() -> TestResult>(name: &str, test_fn: F) -> TestResult {
    let result = crate::catch_panic!({ test_fn() });
    if result.is_failure() {
        crate::klog_info!("TEST FAILED: {}", name);
    } else {
        crate::klog_debug!("TEST PASSED: {}", name);
    }
    result
}
