//! Ring-structured command queue.
//!
//! Wraps an HSA user-mode queue: slot reservation through the shared write
//! index, slot addressing through the power-of-two size mask, and the
//! doorbell write that hands a published packet to the device.
//!
//! One submitting thread per queue. Concurrent submission against the same
//! queue requires the caller to serialize reserve/fill/publish as a unit;
//! nothing here enforces that.

use std::ptr;

use crate::agent::BoundDevice;
use crate::error::DispatchError;
use crate::hsa::{
    self, get_hsa_lib, HsaKernelDispatchPacket, HsaQueue, HSA_QUEUE_TYPE_MULTI,
};

pub struct CommandQueue {
    handle: HsaQueue,
    capacity: u32,
}

/// Ring slot for a monotonically increasing write index.
/// `capacity` must be a power of two.
pub fn ring_slot(index: u64, capacity: u32) -> usize {
    assert!(
        capacity.is_power_of_two(),
        "queue capacity must be a power of two, got {capacity}"
    );
    (index & (capacity as u64 - 1)) as usize
}

impl CommandQueue {
    /// Create a multi-producer queue sized to the agent's maximum.
    pub fn create(device: &BoundDevice) -> Result<Self, DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;

        let mut handle: HsaQueue = ptr::null_mut();
        let status = unsafe {
            (lib.hsa_queue_create)(
                device.gpu,
                device.queue_max_size,
                HSA_QUEUE_TYPE_MULTI,
                ptr::null_mut(),
                ptr::null_mut(),
                u32::MAX,
                u32::MAX,
                &mut handle,
            )
        };
        hsa::check(status, "hsa_queue_create").map_err(DispatchError::Discovery)?;

        let capacity = unsafe { (*handle).size };
        Ok(Self { handle, capacity })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Atomically claim the next write index. The returned index is this
    /// dispatch's packet index; its slot is `ring_slot(index, capacity)`.
    pub fn reserve(&self) -> Result<u64, DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;
        Ok(unsafe { (lib.hsa_queue_add_write_index_relaxed)(self.handle, 1) })
    }

    /// Address of the AQL slot for a reserved index.
    pub fn slot(&self, index: u64) -> *mut HsaKernelDispatchPacket {
        unsafe {
            let base = (*self.handle).base_address as *mut HsaKernelDispatchPacket;
            base.add(ring_slot(index, self.capacity))
        }
    }

    /// Notify the device that the packet at `index` is published. Relaxed is
    /// sufficient: the header's release store already ordered the payload.
    pub fn ring_doorbell(&self, index: u64) -> Result<(), DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;
        unsafe {
            (lib.hsa_signal_store_relaxed)((*self.handle).doorbell_signal, index as i64);
        }
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Ok(lib) = get_hsa_lib() {
            if !self.handle.is_null() {
                unsafe {
                    let _ = (lib.hsa_queue_destroy)(self.handle);
                }
            }
        }
    }
}

unsafe impl Send for CommandQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_slot_wraps_at_capacity() {
        assert_eq!(ring_slot(0, 8), 0);
        assert_eq!(ring_slot(7, 8), 7);
        assert_eq!(ring_slot(8, 8), 0);
        assert_eq!(ring_slot(13, 8), 5);
        assert_eq!(ring_slot(u64::MAX, 4096), 4095);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_capacity_is_fatal() {
        ring_slot(3, 12);
    }
}
