//! Completion signal and deadline-bounded waiting.
//!
//! The device decrements the completion signal when the kernel retires; the
//! host waits for it to reach zero. The wait is the only blocking operation
//! in the engine and is always bounded by an explicit deadline. A timeout
//! leaves the device's execution state unknown - the engine does not attempt
//! cancellation.

use std::ptr;
use std::time::{Duration, Instant};

use crate::error::DispatchError;
use crate::hsa::{
    self, get_hsa_lib, timestamp_frequency, HsaSignal, HSA_SIGNAL_CONDITION_EQ,
    HSA_WAIT_STATE_ACTIVE,
};

/// Fallback timestamp frequency when the runtime won't report one. ROCr
/// implementations use a 100 MHz system clock.
const DEFAULT_TIMESTAMP_HZ: u64 = 100_000_000;

pub struct CompletionSignal {
    handle: HsaSignal,
}

/// Convert a remaining wall-clock budget into a signal-wait timeout hint in
/// system timestamp ticks, saturating instead of overflowing.
pub fn wait_hint_ticks(remaining: Duration, frequency_hz: u64) -> u64 {
    let secs = remaining.as_secs_f64();
    let ticks = secs * frequency_hz as f64;
    if ticks >= u64::MAX as f64 {
        u64::MAX
    } else {
        ticks as u64
    }
}

impl CompletionSignal {
    /// Create a signal with an initial value of one; the device brings it to
    /// zero on completion.
    pub fn create() -> Result<Self, DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;
        let mut handle: HsaSignal = 0;
        let status = unsafe { (lib.hsa_signal_create)(1, 0, ptr::null(), &mut handle) };
        hsa::check(status, "hsa_signal_create").map_err(DispatchError::Discovery)?;
        Ok(Self { handle })
    }

    pub fn handle(&self) -> HsaSignal {
        self.handle
    }

    /// Block until the signal reaches zero or the deadline elapses.
    ///
    /// The underlying wait may return before the condition is met, so the
    /// call loops, re-checking the wall clock each iteration and passing the
    /// remaining budget as the runtime's timeout hint.
    pub fn wait_until_zero(&self, deadline: Duration) -> Result<(), DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;
        let frequency = timestamp_frequency().unwrap_or(DEFAULT_TIMESTAMP_HZ);
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(DispatchError::Timeout { deadline, elapsed });
            }

            let hint = wait_hint_ticks(deadline - elapsed, frequency);
            let value = unsafe {
                (lib.hsa_signal_wait_acquire)(
                    self.handle,
                    HSA_SIGNAL_CONDITION_EQ,
                    0,
                    hint,
                    HSA_WAIT_STATE_ACTIVE,
                )
            };
            if value == 0 {
                return Ok(());
            }
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Ok(lib) = get_hsa_lib() {
            if self.handle != 0 {
                unsafe {
                    let _ = (lib.hsa_signal_destroy)(self.handle);
                }
            }
        }
    }
}

unsafe impl Send for CompletionSignal {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_scales_with_the_clock() {
        assert_eq!(wait_hint_ticks(Duration::from_secs(1), 100_000_000), 100_000_000);
        assert_eq!(wait_hint_ticks(Duration::from_millis(10), 100_000_000), 1_000_000);
        assert_eq!(wait_hint_ticks(Duration::ZERO, 100_000_000), 0);
    }

    #[test]
    fn hint_saturates_instead_of_overflowing() {
        assert_eq!(
            wait_hint_ticks(Duration::from_secs(u64::MAX / 2), u64::MAX),
            u64::MAX
        );
    }
}
