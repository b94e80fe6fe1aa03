//! AQL packet encoding and the fill-then-publish protocol.
//!
//! The device may begin reading a queue slot the instant the header's packet
//! type becomes valid, so submission is split in two: `clear_body` and the
//! field setters write everything except the first 32-bit word, and
//! `publish` stores that word (header | setup << 16) with a single release-
//! ordered atomic store. Nothing in the slot may be touched by the host
//! after `publish` returns.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::hsa::{HsaKernelDispatchPacket, HsaSignal};

// Packet header field shifts (hsa_packet_header_t)
const HEADER_TYPE: u16 = 0;
const HEADER_BARRIER: u16 = 8;
const HEADER_SCACQUIRE_FENCE_SCOPE: u16 = 9;
const HEADER_SCRELEASE_FENCE_SCOPE: u16 = 11;

// Packet setup field shifts (hsa_kernel_dispatch_packet_setup_t)
const SETUP_DIMENSIONS: u16 = 0;

pub const PACKET_TYPE_INVALID: u16 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

/// Header for a barriered kernel dispatch with system-scope acquire and
/// release fences.
pub fn dispatch_header() -> u16 {
    (PACKET_TYPE_KERNEL_DISPATCH << HEADER_TYPE)
        | (1 << HEADER_BARRIER)
        | (FENCE_SCOPE_SYSTEM << HEADER_SCACQUIRE_FENCE_SCOPE)
        | (FENCE_SCOPE_SYSTEM << HEADER_SCRELEASE_FENCE_SCOPE)
}

/// Setup word: number of significant grid dimensions.
pub fn dispatch_setup(grid: [u32; 3]) -> u16 {
    let dims: u16 = if grid[2] > 1 {
        3
    } else if grid[1] > 1 {
        2
    } else {
        1
    };
    dims << SETUP_DIMENSIONS
}

/// Extract the packet type from a header word, as a concurrent observer (the
/// device) would.
pub fn header_type(header: u16) -> u16 {
    (header >> HEADER_TYPE) & 0xff
}

/// Zero every packet field except the first 32-bit word (header + setup),
/// then apply the defaults every dispatch starts from: unit workgroup and
/// grid, no segment space.
///
/// # Safety
/// `slot` must point to a writable 64-byte AQL slot that the device is not
/// currently reading (i.e. its header is invalid or already consumed).
pub unsafe fn clear_body(slot: *mut HsaKernelDispatchPacket) {
    ptr::write_bytes(
        (slot as *mut u8).add(4),
        0,
        std::mem::size_of::<HsaKernelDispatchPacket>() - 4,
    );
    set_workgroup(slot, [1, 1, 1]);
    set_grid(slot, [1, 1, 1]);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_workgroup(slot: *mut HsaKernelDispatchPacket, size: [u16; 3]) {
    ptr::addr_of_mut!((*slot).workgroup_size_x).write(size[0]);
    ptr::addr_of_mut!((*slot).workgroup_size_y).write(size[1]);
    ptr::addr_of_mut!((*slot).workgroup_size_z).write(size[2]);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_grid(slot: *mut HsaKernelDispatchPacket, size: [u32; 3]) {
    ptr::addr_of_mut!((*slot).grid_size_x).write(size[0]);
    ptr::addr_of_mut!((*slot).grid_size_y).write(size[1]);
    ptr::addr_of_mut!((*slot).grid_size_z).write(size[2]);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_completion_signal(slot: *mut HsaKernelDispatchPacket, signal: HsaSignal) {
    ptr::addr_of_mut!((*slot).completion_signal).write(signal);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_kernel_object(slot: *mut HsaKernelDispatchPacket, handle: u64) {
    ptr::addr_of_mut!((*slot).kernel_object).write(handle);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_kernarg_address(slot: *mut HsaKernelDispatchPacket, kernarg: *mut c_void) {
    ptr::addr_of_mut!((*slot).kernarg_address).write(kernarg);
}

/// # Safety
/// `slot` must satisfy the `clear_body` conditions.
pub unsafe fn set_segment_sizes(slot: *mut HsaKernelDispatchPacket, group: u32, private: u32) {
    ptr::addr_of_mut!((*slot).group_segment_size).write(group);
    ptr::addr_of_mut!((*slot).private_segment_size).write(private);
}

/// Current grid extents of the slot, for deriving the setup word.
///
/// # Safety
/// `slot` must be a valid, host-owned AQL slot.
pub unsafe fn grid_of(slot: *const HsaKernelDispatchPacket) -> [u32; 3] {
    [
        ptr::addr_of!((*slot).grid_size_x).read(),
        ptr::addr_of!((*slot).grid_size_y).read(),
        ptr::addr_of!((*slot).grid_size_z).read(),
    ]
}

/// Publish the packet: a single release-ordered store of the combined
/// header/setup word. After this the slot belongs to the device.
///
/// # Safety
/// Every other field of `slot` must already be written, and the caller must
/// not touch the slot again.
pub unsafe fn publish(slot: *mut HsaKernelDispatchPacket, header: u16, setup: u16) {
    let word = (header as u32) | ((setup as u32) << 16);
    (*(slot as *const AtomicU32)).store(word, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn blank_slot() -> Box<HsaKernelDispatchPacket> {
        Box::new(HsaKernelDispatchPacket {
            header: PACKET_TYPE_INVALID,
            setup: 0,
            workgroup_size_x: 0,
            workgroup_size_y: 0,
            workgroup_size_z: 0,
            reserved0: 0,
            grid_size_x: 0,
            grid_size_y: 0,
            grid_size_z: 0,
            private_segment_size: 0,
            group_segment_size: 0,
            kernel_object: 0,
            kernarg_address: ptr::null_mut(),
            reserved2: 0,
            completion_signal: 0,
        })
    }

    #[test]
    fn header_encodes_type_barrier_and_fences() {
        let header = dispatch_header();
        assert_eq!(header_type(header), PACKET_TYPE_KERNEL_DISPATCH);
        assert_eq!(header & (1 << 8), 1 << 8);
        assert_eq!((header >> 9) & 0b11, FENCE_SCOPE_SYSTEM);
        assert_eq!((header >> 11) & 0b11, FENCE_SCOPE_SYSTEM);
    }

    #[test]
    fn setup_counts_significant_dimensions() {
        assert_eq!(dispatch_setup([128, 1, 1]), 1);
        assert_eq!(dispatch_setup([16, 16, 1]), 2);
        assert_eq!(dispatch_setup([4, 4, 4]), 3);
        // A degenerate 1x1x1 grid is still one-dimensional.
        assert_eq!(dispatch_setup([1, 1, 1]), 1);
    }

    #[test]
    fn clear_body_leaves_the_header_word_alone() {
        let mut slot = blank_slot();
        slot.kernel_object = 0xdead_beef;
        slot.grid_size_x = 77;
        let p: *mut HsaKernelDispatchPacket = &mut *slot;

        unsafe { clear_body(p) };

        assert_eq!(slot.header, PACKET_TYPE_INVALID);
        assert_eq!(slot.kernel_object, 0);
        assert_eq!(slot.workgroup_size_x, 1);
        assert_eq!(slot.grid_size_x, 1);
        assert_eq!(slot.completion_signal, 0);
    }

    #[test]
    fn observer_never_sees_a_valid_header_with_an_empty_packet() {
        let mut slot = blank_slot();
        let addr = (&mut *slot as *mut HsaKernelDispatchPacket) as usize;

        std::thread::scope(|scope| {
            let observer = scope.spawn(move || {
                let word = addr as *const AtomicU32;
                loop {
                    let header = unsafe { (*word).load(Ordering::Acquire) } as u16;
                    if header_type(header) == PACKET_TYPE_KERNEL_DISPATCH {
                        // Release ordering on publish guarantees every
                        // dependent field is visible by now.
                        let p = addr as *const HsaKernelDispatchPacket;
                        unsafe {
                            assert!(!ptr::addr_of!((*p).kernarg_address).read().is_null());
                            assert_ne!(ptr::addr_of!((*p).kernel_object).read(), 0);
                            assert_ne!(ptr::addr_of!((*p).completion_signal).read(), 0);
                        }
                        return;
                    }
                    std::hint::spin_loop();
                }
            });

            let kernarg = [0u8; 64];
            let p = addr as *mut HsaKernelDispatchPacket;
            unsafe {
                clear_body(p);
                set_workgroup(p, [16, 16, 1]);
                set_grid(p, [16, 16, 1]);
                set_kernel_object(p, 0x1000);
                set_kernarg_address(p, kernarg.as_ptr() as *mut c_void);
                set_completion_signal(p, 0x2000);
                publish(p, dispatch_header(), dispatch_setup([16, 16, 1]));
            }

            observer.join().unwrap();
        });
    }
}
