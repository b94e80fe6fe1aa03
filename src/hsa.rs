//! HSA Runtime (ROCr) dynamic loading.
//!
//! This module loads the HSA Runtime library (libhsa-runtime64.so) at runtime.
//! HSA Runtime is the low-level driver API for AMD GPUs - it only requires the
//! AMD GPU driver to be installed, NOT the full ROCm development toolkit.
//!
//! Everything here is a thin, typed view of the C API: opaque handles, the
//! `#[repr(C)]` queue and AQL packet layouts, and a function table resolved
//! once through `OnceLock`. Policy (staging, packing, lifecycle) lives in the
//! higher-level modules.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use libloading::Library;

// HSA type definitions
pub type HsaStatus = c_int;
pub type HsaAgent = u64;
pub type HsaSignal = u64; // hsa_signal_t is a struct with a single handle
pub type HsaSignalValue = i64;
pub type HsaRegion = u64;
pub type HsaExecutable = u64;
pub type HsaExecutableSymbol = u64;
pub type HsaCodeObjectReader = u64;

// HSA status codes
pub const HSA_STATUS_SUCCESS: HsaStatus = 0;

// HSA device types
pub const HSA_DEVICE_TYPE_CPU: u32 = 0;
pub const HSA_DEVICE_TYPE_GPU: u32 = 1;

// HSA agent info attributes
pub const HSA_AGENT_INFO_NAME: u32 = 0;
pub const HSA_AGENT_INFO_QUEUE_MAX_SIZE: u32 = 16;
pub const HSA_AGENT_INFO_DEVICE: u32 = 19;

// HSA system info attributes
pub const HSA_SYSTEM_INFO_TIMESTAMP_FREQUENCY: u32 = 3;

// HSA region info
pub const HSA_REGION_INFO_SEGMENT: u32 = 0;
pub const HSA_REGION_INFO_GLOBAL_FLAGS: u32 = 1;
pub const HSA_REGION_INFO_RUNTIME_ALLOC_ALLOWED: u32 = 5;

// HSA segment types and global region flags
pub const HSA_REGION_SEGMENT_GLOBAL: u32 = 0;
pub const HSA_REGION_GLOBAL_FLAG_KERNARG: u32 = 1;
pub const HSA_REGION_GLOBAL_FLAG_FINE_GRAINED: u32 = 2;
pub const HSA_REGION_GLOBAL_FLAG_COARSE_GRAINED: u32 = 4;

// HSA queue types
pub const HSA_QUEUE_TYPE_MULTI: u32 = 0;

// HSA signal wait conditions and wait states
pub const HSA_SIGNAL_CONDITION_EQ: u32 = 0;
pub const HSA_WAIT_STATE_BLOCKED: u32 = 0;
pub const HSA_WAIT_STATE_ACTIVE: u32 = 1;

// HSA memory access permissions
pub const HSA_ACCESS_PERMISSION_RW: u32 = 3;

// HSA executable creation
pub const HSA_PROFILE_FULL: u32 = 1;
pub const HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT: u32 = 0;

// HSA executable symbol info
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT: u32 = 22;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE: u32 = 23;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE: u32 = 25;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE: u32 = 26;

/// `hsa_queue_t` as laid out by the runtime. The host owns none of it except
/// the write index and the packet slots it has reserved.
#[repr(C)]
pub struct HsaQueueHeader {
    pub queue_type: u32,
    pub features: u32,
    pub base_address: *mut c_void,
    pub doorbell_signal: HsaSignal,
    pub size: u32,
    pub reserved1: u32,
    pub id: u64,
}

pub type HsaQueue = *mut HsaQueueHeader;

/// `hsa_kernel_dispatch_packet_t`: one 64-byte AQL slot in the queue ring.
///
/// The device may start reading the slot the instant the header's packet type
/// becomes valid, so every other field must be written first and the header
/// word published with a release store (see `packet::publish`).
#[repr(C)]
pub struct HsaKernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: *mut c_void,
    pub reserved2: u64,
    pub completion_signal: HsaSignal,
}

// Callback types
pub type HsaIterateAgentsCallback = unsafe extern "C" fn(HsaAgent, *mut c_void) -> HsaStatus;
pub type HsaIterateRegionsCallback = unsafe extern "C" fn(HsaRegion, *mut c_void) -> HsaStatus;

// Function pointer types
type HsaInitFn = unsafe extern "C" fn() -> HsaStatus;
type HsaShutDownFn = unsafe extern "C" fn() -> HsaStatus;
type HsaSystemGetInfoFn = unsafe extern "C" fn(u32, *mut c_void) -> HsaStatus;
type HsaIterateAgentsFn =
    unsafe extern "C" fn(HsaIterateAgentsCallback, *mut c_void) -> HsaStatus;
type HsaAgentGetInfoFn = unsafe extern "C" fn(HsaAgent, u32, *mut c_void) -> HsaStatus;
type HsaAgentIterateRegionsFn =
    unsafe extern "C" fn(HsaAgent, HsaIterateRegionsCallback, *mut c_void) -> HsaStatus;
type HsaRegionGetInfoFn = unsafe extern "C" fn(HsaRegion, u32, *mut c_void) -> HsaStatus;

type HsaQueueCreateFn = unsafe extern "C" fn(
    HsaAgent,
    u32,         // size
    u32,         // type
    *mut c_void, // callback
    *mut c_void, // data
    u32,         // private_segment_size
    u32,         // group_segment_size
    *mut HsaQueue,
) -> HsaStatus;
type HsaQueueDestroyFn = unsafe extern "C" fn(HsaQueue) -> HsaStatus;
type HsaQueueAddWriteIndexRelaxedFn = unsafe extern "C" fn(HsaQueue, u64) -> u64;

type HsaSignalCreateFn =
    unsafe extern "C" fn(HsaSignalValue, u32, *const HsaAgent, *mut HsaSignal) -> HsaStatus;
type HsaSignalDestroyFn = unsafe extern "C" fn(HsaSignal) -> HsaStatus;
type HsaSignalStoreRelaxedFn = unsafe extern "C" fn(HsaSignal, HsaSignalValue);
type HsaSignalWaitAcquireFn =
    unsafe extern "C" fn(HsaSignal, u32, HsaSignalValue, u64, u32) -> HsaSignalValue;

type HsaMemoryAllocateFn =
    unsafe extern "C" fn(HsaRegion, usize, *mut *mut c_void) -> HsaStatus;
type HsaMemoryFreeFn = unsafe extern "C" fn(*mut c_void) -> HsaStatus;
type HsaMemoryCopyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> HsaStatus;
type HsaMemoryAssignAgentFn =
    unsafe extern "C" fn(*mut c_void, HsaAgent, u32) -> HsaStatus;

type HsaCodeObjectReaderCreateFromMemoryFn =
    unsafe extern "C" fn(*const c_void, usize, *mut HsaCodeObjectReader) -> HsaStatus;
type HsaCodeObjectReaderDestroyFn = unsafe extern "C" fn(HsaCodeObjectReader) -> HsaStatus;

type HsaExecutableCreateAltFn = unsafe extern "C" fn(
    u32,           // profile
    u32,           // default_float_rounding_mode
    *const c_char, // options
    *mut HsaExecutable,
) -> HsaStatus;
type HsaExecutableDestroyFn = unsafe extern "C" fn(HsaExecutable) -> HsaStatus;
type HsaExecutableLoadAgentCodeObjectFn = unsafe extern "C" fn(
    HsaExecutable,
    HsaAgent,
    HsaCodeObjectReader,
    *const c_char,
    *mut u64,
) -> HsaStatus;
type HsaExecutableFreezeFn = unsafe extern "C" fn(HsaExecutable, *const c_char) -> HsaStatus;
type HsaExecutableGetSymbolByNameFn = unsafe extern "C" fn(
    HsaExecutable,
    *const c_char,
    *const HsaAgent,
    *mut HsaExecutableSymbol,
) -> HsaStatus;
type HsaExecutableSymbolGetInfoFn =
    unsafe extern "C" fn(HsaExecutableSymbol, u32, *mut c_void) -> HsaStatus;

type HsaStatusStringFn = unsafe extern "C" fn(HsaStatus, *mut *const c_char) -> HsaStatus;

/// HSA Runtime library function table.
pub struct HsaLib {
    #[allow(dead_code)]
    lib: Library,

    // Initialization
    pub hsa_init: HsaInitFn,
    pub hsa_shut_down: HsaShutDownFn,
    pub hsa_system_get_info: HsaSystemGetInfoFn,

    // Agent and region enumeration
    pub hsa_iterate_agents: HsaIterateAgentsFn,
    pub hsa_agent_get_info: HsaAgentGetInfoFn,
    pub hsa_agent_iterate_regions: HsaAgentIterateRegionsFn,
    pub hsa_region_get_info: HsaRegionGetInfoFn,

    // Queue management
    pub hsa_queue_create: HsaQueueCreateFn,
    pub hsa_queue_destroy: HsaQueueDestroyFn,
    pub hsa_queue_add_write_index_relaxed: HsaQueueAddWriteIndexRelaxedFn,

    // Signal management
    pub hsa_signal_create: HsaSignalCreateFn,
    pub hsa_signal_destroy: HsaSignalDestroyFn,
    pub hsa_signal_store_relaxed: HsaSignalStoreRelaxedFn,
    pub hsa_signal_wait_acquire: HsaSignalWaitAcquireFn,

    // Memory management
    pub hsa_memory_allocate: HsaMemoryAllocateFn,
    pub hsa_memory_free: HsaMemoryFreeFn,
    pub hsa_memory_copy: HsaMemoryCopyFn,
    pub hsa_memory_assign_agent: HsaMemoryAssignAgentFn,

    // Code object loading
    pub hsa_code_object_reader_create_from_memory: HsaCodeObjectReaderCreateFromMemoryFn,
    pub hsa_code_object_reader_destroy: HsaCodeObjectReaderDestroyFn,

    // Executable management
    pub hsa_executable_create_alt: HsaExecutableCreateAltFn,
    pub hsa_executable_destroy: HsaExecutableDestroyFn,
    pub hsa_executable_load_agent_code_object: HsaExecutableLoadAgentCodeObjectFn,
    pub hsa_executable_freeze: HsaExecutableFreezeFn,
    pub hsa_executable_get_symbol_by_name: HsaExecutableGetSymbolByNameFn,
    pub hsa_executable_symbol_get_info: HsaExecutableSymbolGetInfoFn,

    // Error handling
    pub hsa_status_string: HsaStatusStringFn,
}

// Safety: HsaLib contains function pointers from a loaded library.
// The library is loaded once and lives for the entire program lifetime.
// Function pointers are immutable after initialization.
unsafe impl Send for HsaLib {}
unsafe impl Sync for HsaLib {}

macro_rules! resolve {
    ($lib:expr, $ty:ty, $name:literal) => {
        unsafe {
            *$lib
                .get::<$ty>(concat!($name, "\0").as_bytes())
                .map_err(|e| format!(concat!($name, ": {}"), e))?
        }
    };
}

impl HsaLib {
    /// Try to load the HSA Runtime library and resolve every entry point.
    fn load() -> Result<Self, String> {
        // HSA Runtime ships with the AMD GPU driver, not the ROCm toolkit
        let lib_names = [
            "libhsa-runtime64.so",
            "libhsa-runtime64.so.1",
            "/opt/rocm/lib/libhsa-runtime64.so",
            "/opt/rocm/lib64/libhsa-runtime64.so",
            "/usr/lib/x86_64-linux-gnu/libhsa-runtime64.so",
            "/usr/lib64/libhsa-runtime64.so",
        ];

        let lib = lib_names
            .iter()
            .find_map(|name| unsafe { Library::new(name).ok() })
            .ok_or_else(|| {
                "Failed to load HSA Runtime library (libhsa-runtime64.so). \
                 This library is part of the AMD GPU driver."
                    .to_string()
            })?;

        let hsa_init = resolve!(lib, HsaInitFn, "hsa_init");
        let hsa_shut_down = resolve!(lib, HsaShutDownFn, "hsa_shut_down");
        let hsa_system_get_info = resolve!(lib, HsaSystemGetInfoFn, "hsa_system_get_info");
        let hsa_iterate_agents = resolve!(lib, HsaIterateAgentsFn, "hsa_iterate_agents");
        let hsa_agent_get_info = resolve!(lib, HsaAgentGetInfoFn, "hsa_agent_get_info");
        let hsa_agent_iterate_regions =
            resolve!(lib, HsaAgentIterateRegionsFn, "hsa_agent_iterate_regions");
        let hsa_region_get_info = resolve!(lib, HsaRegionGetInfoFn, "hsa_region_get_info");
        let hsa_queue_create = resolve!(lib, HsaQueueCreateFn, "hsa_queue_create");
        let hsa_queue_destroy = resolve!(lib, HsaQueueDestroyFn, "hsa_queue_destroy");
        let hsa_queue_add_write_index_relaxed = resolve!(
            lib,
            HsaQueueAddWriteIndexRelaxedFn,
            "hsa_queue_add_write_index_relaxed"
        );
        let hsa_signal_create = resolve!(lib, HsaSignalCreateFn, "hsa_signal_create");
        let hsa_signal_destroy = resolve!(lib, HsaSignalDestroyFn, "hsa_signal_destroy");
        let hsa_signal_store_relaxed =
            resolve!(lib, HsaSignalStoreRelaxedFn, "hsa_signal_store_relaxed");
        let hsa_signal_wait_acquire =
            resolve!(lib, HsaSignalWaitAcquireFn, "hsa_signal_wait_acquire");
        let hsa_memory_allocate = resolve!(lib, HsaMemoryAllocateFn, "hsa_memory_allocate");
        let hsa_memory_free = resolve!(lib, HsaMemoryFreeFn, "hsa_memory_free");
        let hsa_memory_copy = resolve!(lib, HsaMemoryCopyFn, "hsa_memory_copy");
        let hsa_memory_assign_agent =
            resolve!(lib, HsaMemoryAssignAgentFn, "hsa_memory_assign_agent");
        let hsa_code_object_reader_create_from_memory = resolve!(
            lib,
            HsaCodeObjectReaderCreateFromMemoryFn,
            "hsa_code_object_reader_create_from_memory"
        );
        let hsa_code_object_reader_destroy = resolve!(
            lib,
            HsaCodeObjectReaderDestroyFn,
            "hsa_code_object_reader_destroy"
        );
        let hsa_executable_create_alt =
            resolve!(lib, HsaExecutableCreateAltFn, "hsa_executable_create_alt");
        let hsa_executable_destroy =
            resolve!(lib, HsaExecutableDestroyFn, "hsa_executable_destroy");
        let hsa_executable_load_agent_code_object = resolve!(
            lib,
            HsaExecutableLoadAgentCodeObjectFn,
            "hsa_executable_load_agent_code_object"
        );
        let hsa_executable_freeze =
            resolve!(lib, HsaExecutableFreezeFn, "hsa_executable_freeze");
        let hsa_executable_get_symbol_by_name = resolve!(
            lib,
            HsaExecutableGetSymbolByNameFn,
            "hsa_executable_get_symbol_by_name"
        );
        let hsa_executable_symbol_get_info = resolve!(
            lib,
            HsaExecutableSymbolGetInfoFn,
            "hsa_executable_symbol_get_info"
        );
        let hsa_status_string = resolve!(lib, HsaStatusStringFn, "hsa_status_string");

        Ok(Self {
            lib,
            hsa_init,
            hsa_shut_down,
            hsa_system_get_info,
            hsa_iterate_agents,
            hsa_agent_get_info,
            hsa_agent_iterate_regions,
            hsa_region_get_info,
            hsa_queue_create,
            hsa_queue_destroy,
            hsa_queue_add_write_index_relaxed,
            hsa_signal_create,
            hsa_signal_destroy,
            hsa_signal_store_relaxed,
            hsa_signal_wait_acquire,
            hsa_memory_allocate,
            hsa_memory_free,
            hsa_memory_copy,
            hsa_memory_assign_agent,
            hsa_code_object_reader_create_from_memory,
            hsa_code_object_reader_destroy,
            hsa_executable_create_alt,
            hsa_executable_destroy,
            hsa_executable_load_agent_code_object,
            hsa_executable_freeze,
            hsa_executable_get_symbol_by_name,
            hsa_executable_symbol_get_info,
            hsa_status_string,
        })
    }
}

/// Global HSA library instance.
static HSA_LIB: OnceLock<Result<HsaLib, String>> = OnceLock::new();

/// HSA Runtime initialization state.
static HSA_INITIALIZED: OnceLock<Result<(), String>> = OnceLock::new();

/// Get the global HSA library instance.
pub fn get_hsa_lib() -> Result<&'static HsaLib, &'static str> {
    HSA_LIB
        .get_or_init(HsaLib::load)
        .as_ref()
        .map_err(|e| e.as_str())
}

/// Initialize HSA Runtime (idempotent).
pub fn hsa_init() -> Result<(), &'static str> {
    HSA_INITIALIZED
        .get_or_init(|| {
            let lib = get_hsa_lib().map_err(|e| e.to_string())?;
            let status = unsafe { (lib.hsa_init)() };
            if status == HSA_STATUS_SUCCESS {
                Ok(())
            } else {
                Err(format!("hsa_init failed with status {}", status))
            }
        })
        .as_ref()
        .map(|_| ())
        .map_err(|e| e.as_str())
}

/// Check if the HSA Runtime is available on this system.
pub fn is_hsa_available() -> bool {
    get_hsa_lib().is_ok()
}

/// Get a human-readable string for an HSA status code.
pub fn status_string(status: HsaStatus) -> String {
    if let Ok(lib) = get_hsa_lib() {
        unsafe {
            let mut msg: *const c_char = ptr::null();
            if (lib.hsa_status_string)(status, &mut msg) == HSA_STATUS_SUCCESS && !msg.is_null() {
                return CStr::from_ptr(msg).to_string_lossy().into_owned();
            }
        }
    }
    format!("HSA error code: {status}")
}

/// Render a failed HSA call as `"context: reason"`.
///
/// Success maps to `Ok(())`; callers wrap the message into the appropriate
/// error variant for the phase they are in.
pub fn check(status: HsaStatus, context: &str) -> Result<(), String> {
    if status == HSA_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(format!("{}: {}", context, status_string(status)))
    }
}

/// System timestamp frequency in Hz, used to convert wall-clock deadlines
/// into signal-wait timeout hints.
pub fn timestamp_frequency() -> Option<u64> {
    let lib = get_hsa_lib().ok()?;
    let mut frequency: u64 = 0;
    let status = unsafe {
        (lib.hsa_system_get_info)(
            HSA_SYSTEM_INFO_TIMESTAMP_FREQUENCY,
            &mut frequency as *mut _ as *mut c_void,
        )
    };
    (status == HSA_STATUS_SUCCESS && frequency != 0).then_some(frequency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn dispatch_packet_is_one_aql_slot() {
        assert_eq!(mem::size_of::<HsaKernelDispatchPacket>(), 64);
    }

    #[test]
    fn queue_header_field_offsets_match_the_abi() {
        assert_eq!(mem::offset_of!(HsaQueueHeader, base_address), 8);
        assert_eq!(mem::offset_of!(HsaQueueHeader, doorbell_signal), 16);
        assert_eq!(mem::offset_of!(HsaQueueHeader, size), 24);
    }

    #[test]
    fn status_string_degrades_without_the_runtime() {
        // Works whether or not libhsa-runtime64 is installed.
        let msg = status_string(4096);
        assert!(!msg.is_empty());
    }
}
