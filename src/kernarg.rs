//! Kernel-argument packing.
//!
//! A `KernargBlock` is a raw byte region in kernarg memory with a
//! monotonically increasing write cursor. Each append lands at the smallest
//! offset at or past the cursor that satisfies the value's alignment. The
//! packer knows nothing about argument types: ordering and layout are the
//! caller's contract with the kernel entry point.

use std::ffi::c_void;
use std::ptr;

use bytemuck::{bytes_of, Pod};

use crate::buffer::Buffer;
use crate::error::DispatchError;
use crate::hsa::{self, get_hsa_lib, HsaRegion};

pub struct KernargBlock {
    base: *mut u8,
    capacity: usize,
    cursor: usize,
    hsa_owned: bool,
}

impl KernargBlock {
    /// Allocate `capacity` bytes from the kernarg region. The capacity is
    /// fixed for the life of the block.
    pub fn allocate(region: HsaRegion, capacity: usize) -> Result<Self, DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Allocation(e.to_string()))?;
        let mut p: *mut c_void = ptr::null_mut();
        let status = unsafe { (lib.hsa_memory_allocate)(region, capacity, &mut p) };
        hsa::check(status, "hsa_memory_allocate(kernarg)").map_err(DispatchError::Allocation)?;
        Ok(Self {
            base: p as *mut u8,
            capacity,
            cursor: 0,
            hsa_owned: true,
        })
    }

    /// Build a block over caller-provided host memory. Test hook only; the
    /// packing rules are identical.
    #[cfg(test)]
    pub(crate) fn over_host(storage: &mut [u8]) -> Self {
        Self {
            base: storage.as_mut_ptr(),
            capacity: storage.len(),
            cursor: 0,
            hsa_owned: false,
        }
    }

    /// Append `bytes` at the next offset aligned to `align` and return that
    /// offset.
    ///
    /// Panics when `align` is not a power of two or when the aligned value
    /// would exceed the block capacity; both are contract violations, not
    /// recoverable platform failures.
    pub fn append_raw(&mut self, bytes: &[u8], align: usize) -> usize {
        assert!(
            align.is_power_of_two(),
            "kernarg alignment must be a power of two, got {align}"
        );
        let offset = (self.cursor + align - 1) & !(align - 1);
        assert!(
            offset + bytes.len() <= self.capacity,
            "kernarg region overflow: offset {offset} + {} exceeds capacity {}",
            bytes.len(),
            self.capacity
        );
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
        self.cursor = offset + bytes.len();
        offset
    }

    /// Append a plain-old-data value at its natural alignment.
    pub fn append<T: Pod>(&mut self, value: &T) -> usize {
        self.append_raw(bytes_of(value), std::mem::align_of::<T>())
    }

    /// Append a buffer argument: the device-visible address only, never the
    /// size or the host address.
    pub fn append_buffer(&mut self, buffer: &Buffer) -> usize {
        let device_ptr = buffer.device_ptr() as u64;
        self.append(&device_ptr)
    }

    /// Base address of the packed region, for the packet's kernarg field.
    pub fn base_ptr(&self) -> *mut c_void {
        self.base as *mut c_void
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, including alignment padding.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }
}

impl Drop for KernargBlock {
    fn drop(&mut self) {
        if !self.hsa_owned {
            return;
        }
        if let Ok(lib) = get_hsa_lib() {
            if !self.base.is_null() {
                unsafe {
                    let _ = (lib.hsa_memory_free)(self.base as *mut c_void);
                }
            }
        }
    }
}

unsafe impl Send for KernargBlock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_respect_alignment_and_never_go_backwards() {
        let mut storage = [0u8; 128];
        let mut block = KernargBlock::over_host(&mut storage);

        let appends: &[(usize, usize)] = &[(8, 8), (4, 4), (8, 8), (1, 1), (4, 4), (2, 2)];
        let mut prev_end = 0usize;
        for &(size, align) in appends {
            let offset = block.append_raw(&vec![0xA5u8; size], align);
            assert_eq!(offset % align, 0);
            assert!(offset >= prev_end);
            prev_end = offset + size;
        }
        assert_eq!(block.len(), prev_end);
    }

    #[test]
    fn pod_appends_use_natural_alignment() {
        let mut storage = [0u8; 64];
        let mut block = KernargBlock::over_host(&mut storage);

        assert_eq!(block.append(&1u32), 0);
        assert_eq!(block.append(&2u64), 8); // padded past offset 4
        assert_eq!(block.append(&3u32), 16);
        assert_eq!(block.len(), 20);

        assert_eq!(&storage[0..4], &1u32.to_ne_bytes());
        assert_eq!(&storage[8..16], &2u64.to_ne_bytes());
        assert_eq!(&storage[16..20], &3u32.to_ne_bytes());
    }

    #[test]
    fn buffer_argument_packs_only_the_device_address() {
        let mut payload = vec![0u8; 256].into_boxed_slice();
        let ptr = payload.as_mut_ptr() as *mut c_void;
        let buf = Buffer::from_raw_parts(256, ptr, ptr);

        let mut storage = [0u8; 16];
        let mut block = KernargBlock::over_host(&mut storage);
        let offset = block.append_buffer(&buf);

        assert_eq!(offset, 0);
        assert_eq!(block.len(), 8);
        assert_eq!(
            u64::from_ne_bytes(storage[0..8].try_into().unwrap()),
            buf.device_ptr() as u64
        );
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_alignment_is_fatal() {
        let mut storage = [0u8; 32];
        let mut block = KernargBlock::over_host(&mut storage);
        block.append_raw(&[0u8; 4], 3);
    }

    #[test]
    #[should_panic(expected = "kernarg region overflow")]
    fn exceeding_the_region_is_fatal() {
        let mut storage = [0u8; 8];
        let mut block = KernargBlock::over_host(&mut storage);
        block.append_raw(&[0u8; 8], 8);
        block.append_raw(&[0u8; 1], 1);
    }
}
