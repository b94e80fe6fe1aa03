//! Hardware smoke tests. These need an AMD GPU with the HSA Runtime and
//! quietly skip everywhere else.

use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use aql_dispatch::buffer::Buffer;
use aql_dispatch::signal::CompletionSignal;
use aql_dispatch::{
    agent, is_hsa_available, CodeObjectSource, Dispatch, DispatchError, DispatchTask, GemmTask,
    LifecycleState, Result,
};

/// Code object location for the end-to-end tests, taken from
/// `GEMM_CODE_OBJECT` / `GEMM_KERNEL_SYMBOL` (default `mad2d`). `None` means
/// no compiled kernel is available and the test should skip.
fn gemm_code_object() -> Option<(PathBuf, String)> {
    let path = PathBuf::from(env::var_os("GEMM_CODE_OBJECT")?);
    let symbol = env::var("GEMM_KERNEL_SYMBOL").unwrap_or_else(|_| "mad2d".to_string());
    Some((path, symbol))
}

#[test]
fn staged_round_trip_is_an_identity_without_device_mutation() {
    if !is_hsa_available() {
        return;
    }
    let device = agent::discover().expect("GPU discovery");

    let mut buf = Buffer::allocate(&device.regions, 4096).expect("allocate");
    let pattern: Vec<u32> = (0..1024u32).map(|i| i.wrapping_mul(2654435761)).collect();
    buf.as_mut_slice::<u32>().copy_from_slice(&pattern);

    buf.copy_to_device().expect("copy to device");
    // Scribble over the host side so the readback is observable.
    buf.as_mut_slice::<u32>().fill(0);
    buf.copy_from_device(device.cpu).expect("copy from device");

    if buf.is_staged() {
        assert_eq!(buf.as_slice::<u32>(), pattern.as_slice());
    } else {
        // Shared fine-grained memory: both copies were no-ops, so the
        // scribble survives.
        assert!(buf.as_slice::<u32>().iter().all(|&v| v == 0));
    }
}

#[test]
fn wait_on_a_never_signaled_completion_times_out_by_the_deadline() {
    if !is_hsa_available() {
        return;
    }
    agent::discover().expect("GPU discovery");

    let signal = CompletionSignal::create().expect("signal");
    let deadline = Duration::from_millis(200);
    let start = Instant::now();
    let result = signal.wait_until_zero(deadline);
    let waited = start.elapsed();

    assert!(matches!(result, Err(DispatchError::Timeout { .. })));
    assert!(waited >= deadline);
    // Generous epsilon: the runtime may round the timeout hint up.
    assert!(waited < deadline + Duration::from_secs(2));
}

#[test]
fn allocating_beyond_device_memory_fails_cleanly() {
    if !is_hsa_available() {
        return;
    }
    let device = agent::discover().expect("GPU discovery");

    let result = Buffer::allocate(&device.regions, 1 << 60);
    assert!(matches!(result, Err(DispatchError::Allocation(_))));
}

/// End-to-end GEMM run. Needs a compiled code object on top of the runtime,
/// so it is additionally gated through `gemm_code_object`.
#[test]
fn full_gemm_scenario_completes_and_verifies() {
    if !is_hsa_available() {
        return;
    }
    let Some((code_object, symbol)) = gemm_code_object() else {
        return;
    };

    let mut task = GemmTask::new(code_object, symbol);
    let mut dispatch = Dispatch::new();
    let result = dispatch.run(&mut task);

    assert!(result.is_ok(), "dispatch failed:\n{}", dispatch.transcript());
    assert_eq!(dispatch.state(), LifecycleState::Completed);
    assert!(dispatch.transcript().contains("All 16384 output elements match"));
}

struct OversizedAllocationTask {
    code_object: PathBuf,
    symbol: String,
}

impl DispatchTask for OversizedAllocationTask {
    fn setup_code_object(&mut self) -> Result<CodeObjectSource> {
        Ok(CodeObjectSource::File(self.code_object.clone()))
    }

    fn kernel_symbol(&self) -> &str {
        &self.symbol
    }

    fn setup(&mut self, dispatch: &mut Dispatch) -> Result<()> {
        dispatch.allocate_buffer(1 << 60)?;
        Ok(())
    }

    fn verify(&mut self, _dispatch: &mut Dispatch) -> Result<()> {
        Ok(())
    }
}

#[test]
fn oversized_allocation_fails_the_lifecycle_before_publication() {
    if !is_hsa_available() {
        return;
    }
    let Some((code_object, symbol)) = gemm_code_object() else {
        return;
    };

    let mut task = OversizedAllocationTask {
        code_object,
        symbol,
    };
    let mut dispatch = Dispatch::new();
    let result = dispatch.run(&mut task);

    assert!(matches!(result, Err(DispatchError::Allocation(_))));
    assert_eq!(dispatch.state(), LifecycleState::Failed);
    assert!(!dispatch.transcript().contains("Published packet"));
}

#[test]
fn full_run_with_an_expired_deadline_times_out() {
    if !is_hsa_available() {
        return;
    }
    let Some((code_object, symbol)) = gemm_code_object() else {
        return;
    };

    let mut task = GemmTask::new(code_object, symbol);
    let mut dispatch = Dispatch::new().with_deadline(Duration::ZERO);
    let result = dispatch.run(&mut task);

    assert!(matches!(result, Err(DispatchError::Timeout { .. })));
    assert_eq!(dispatch.state(), LifecycleState::Failed);
    assert!(!dispatch.transcript().contains("Kernel completed"));
}
