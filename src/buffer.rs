//! Buffers and explicit host/device staging.
//!
//! A `Buffer` is a logical memory block. On devices with a local memory tier
//! it is "staged": independent host-visible and device-local allocations of
//! equal size that stay coherent only through explicit copies. On shared-
//! memory devices the two addresses coincide and both copies are no-ops.

use std::ffi::c_void;
use std::ptr;

use bytemuck::Pod;

use crate::agent::RegionSet;
use crate::error::DispatchError;
use crate::hsa::{self, get_hsa_lib, HsaAgent, HsaRegion, HSA_ACCESS_PERMISSION_RW};

/// A logical memory block with a host-visible address and a device-visible
/// address. The two are equal iff the buffer is unstaged.
pub struct Buffer {
    size: usize,
    system_ptr: *mut c_void,
    local_ptr: *mut c_void,
    hsa_owned: bool,
}

fn allocate_region(region: HsaRegion, size: usize, what: &str) -> Result<*mut c_void, DispatchError> {
    let lib = get_hsa_lib().map_err(|e| DispatchError::Allocation(e.to_string()))?;
    let mut p: *mut c_void = ptr::null_mut();
    let status = unsafe { (lib.hsa_memory_allocate)(region, size, &mut p) };
    hsa::check(status, what).map_err(DispatchError::Allocation)?;
    Ok(p)
}

impl Buffer {
    /// Allocate a buffer of `size` bytes.
    ///
    /// With a local tier present this allocates in both system and local
    /// memory (staged); otherwise a single fine-grained allocation serves
    /// both sides (unstaged).
    pub fn allocate(regions: &RegionSet, size: usize) -> Result<Self, DispatchError> {
        let system_ptr = allocate_region(regions.system, size, "hsa_memory_allocate(system)")?;
        if !regions.has_local_tier() {
            return Ok(Self {
                size,
                system_ptr,
                local_ptr: system_ptr,
                hsa_owned: true,
            });
        }

        let local_ptr = match allocate_region(regions.local, size, "hsa_memory_allocate(local)") {
            Ok(p) => p,
            Err(e) => {
                if let Ok(lib) = get_hsa_lib() {
                    unsafe {
                        let _ = (lib.hsa_memory_free)(system_ptr);
                    }
                }
                return Err(e);
            }
        };

        Ok(Self {
            size,
            system_ptr,
            local_ptr,
            hsa_owned: true,
        })
    }

    /// Wrap existing allocations. Used by tests to build buffers over plain
    /// host memory; the HSA allocator is never invoked for these.
    #[cfg(test)]
    pub(crate) fn from_raw_parts(size: usize, system_ptr: *mut c_void, local_ptr: *mut c_void) -> Self {
        Self {
            size,
            system_ptr,
            local_ptr,
            hsa_owned: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when host and device addresses are independent allocations.
    pub fn is_staged(&self) -> bool {
        self.system_ptr != self.local_ptr
    }

    /// Address the host reads and writes.
    pub fn host_ptr(&self) -> *mut c_void {
        self.system_ptr
    }

    /// Address the device dereferences. This, and only this, is what gets
    /// packed into the kernarg region for a buffer argument.
    pub fn device_ptr(&self) -> *mut c_void {
        self.local_ptr
    }

    /// Host-side view of the buffer contents.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        let elem = std::mem::size_of::<T>();
        assert!(elem > 0 && self.size % elem == 0, "buffer size not a multiple of element size");
        unsafe { std::slice::from_raw_parts(self.system_ptr as *const T, self.size / elem) }
    }

    /// Mutable host-side view of the buffer contents.
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        let elem = std::mem::size_of::<T>();
        assert!(elem > 0 && self.size % elem == 0, "buffer size not a multiple of element size");
        unsafe { std::slice::from_raw_parts_mut(self.system_ptr as *mut T, self.size / elem) }
    }

    /// Copy host contents to the device allocation. No-op for unstaged
    /// buffers.
    pub fn copy_to_device(&self) -> Result<(), DispatchError> {
        if !self.is_staged() {
            return Ok(());
        }
        let lib = get_hsa_lib().map_err(|e| DispatchError::Staging(e.to_string()))?;
        let status =
            unsafe { (lib.hsa_memory_copy)(self.local_ptr, self.system_ptr, self.size) };
        hsa::check(status, "hsa_memory_copy(to device)").map_err(DispatchError::Staging)
    }

    /// Copy device contents back to the host allocation. No-op for unstaged
    /// buffers.
    ///
    /// The device-local source must be made CPU-readable before the copy;
    /// that permission change is a required ordering step, not an
    /// optimization, and it is not reverted afterwards.
    pub fn copy_from_device(&self, cpu_agent: HsaAgent) -> Result<(), DispatchError> {
        if !self.is_staged() {
            return Ok(());
        }
        let lib = get_hsa_lib().map_err(|e| DispatchError::Staging(e.to_string()))?;
        let status = unsafe {
            (lib.hsa_memory_assign_agent)(self.local_ptr, cpu_agent, HSA_ACCESS_PERMISSION_RW)
        };
        hsa::check(status, "hsa_memory_assign_agent").map_err(DispatchError::Staging)?;
        let status =
            unsafe { (lib.hsa_memory_copy)(self.system_ptr, self.local_ptr, self.size) };
        hsa::check(status, "hsa_memory_copy(from device)").map_err(DispatchError::Staging)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.hsa_owned {
            return;
        }
        if let Ok(lib) = get_hsa_lib() {
            unsafe {
                if self.is_staged() && !self.local_ptr.is_null() {
                    let _ = (lib.hsa_memory_free)(self.local_ptr);
                }
                if !self.system_ptr.is_null() {
                    let _ = (lib.hsa_memory_free)(self.system_ptr);
                }
            }
        }
    }
}

// Safety: the pointers refer to process-wide HSA allocations; access
// discipline (host never touches device memory mid-dispatch) is enforced by
// the lifecycle, not by the type.
unsafe impl Send for Buffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_backed(len: usize) -> (Buffer, Box<[u8]>) {
        let mut storage = vec![0u8; len].into_boxed_slice();
        let ptr = storage.as_mut_ptr() as *mut c_void;
        (Buffer::from_raw_parts(len, ptr, ptr), storage)
    }

    #[test]
    fn shared_memory_buffer_is_unstaged() {
        let (buf, _storage) = host_backed(64);
        assert!(!buf.is_staged());
        assert_eq!(buf.host_ptr(), buf.device_ptr());
    }

    #[test]
    fn unstaged_copies_are_noops() {
        let (mut buf, _storage) = host_backed(16);
        buf.as_mut_slice::<u32>().copy_from_slice(&[1, 2, 3, 4]);

        // Neither direction may touch the runtime or the contents.
        buf.copy_to_device().unwrap();
        buf.copy_from_device(0).unwrap();

        assert_eq!(buf.as_slice::<u32>(), &[1, 2, 3, 4]);
        assert_eq!(buf.host_ptr(), buf.device_ptr());
    }

    #[test]
    fn staged_buffer_reports_independent_addresses() {
        let mut host = vec![0u8; 32].into_boxed_slice();
        let mut local = vec![0u8; 32].into_boxed_slice();
        let buf = Buffer::from_raw_parts(
            32,
            host.as_mut_ptr() as *mut c_void,
            local.as_mut_ptr() as *mut c_void,
        );
        assert!(buf.is_staged());
        assert_ne!(buf.host_ptr(), buf.device_ptr());
    }

    #[test]
    fn typed_views_share_the_host_allocation() {
        let (mut buf, _storage) = host_backed(8);
        buf.as_mut_slice::<f32>()[0] = 1.5;
        buf.as_mut_slice::<f32>()[1] = -2.0;
        assert_eq!(buf.as_slice::<f32>(), &[1.5, -2.0]);
    }

    #[test]
    #[should_panic(expected = "multiple of element size")]
    fn misaligned_view_is_rejected() {
        let (buf, _storage) = host_backed(10);
        let _ = buf.as_slice::<f32>();
    }
}
