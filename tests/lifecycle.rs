//! Lifecycle behavior on hosts without the HSA Runtime installed.
//!
//! These tests document the failure contract: discovery fails first, the
//! lifecycle short-circuits to `Failed`, and no later phase runs. They skip
//! themselves on machines where libhsa-runtime64 is actually present (the
//! hardware paths are covered in `gpu_smoke.rs`).

use std::path::PathBuf;

use aql_dispatch::{is_hsa_available, Dispatch, DispatchError, GemmTask, LifecycleState};

#[test]
fn run_fails_in_discovery_without_a_runtime() {
    if is_hsa_available() {
        return;
    }

    let mut task = GemmTask::new(PathBuf::from("kernel.co"), "mad2d");
    let mut dispatch = Dispatch::new();
    let result = dispatch.run(&mut task);

    assert!(matches!(result, Err(DispatchError::Discovery(_))));
    assert_eq!(dispatch.state(), LifecycleState::Failed);

    // The transcript carries the failure; no packet was ever reserved or
    // published.
    assert!(dispatch.transcript().contains("Error:"));
    assert!(!dispatch.transcript().contains("Reserved packet"));
    assert!(!dispatch.transcript().contains("Published packet"));
}

#[test]
fn run_main_maps_failure_to_a_nonzero_exit_code() {
    if is_hsa_available() {
        return;
    }

    let mut task = GemmTask::new(PathBuf::from("kernel.co"), "mad2d");
    let mut dispatch = Dispatch::new();
    assert_ne!(dispatch.run_main(&mut task), 0);
}
