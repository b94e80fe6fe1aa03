//! Agent and memory-region discovery.
//!
//! The dispatch core consumes the result of discovery as opaque handles: one
//! GPU agent, one CPU agent (for cross-agent coherence on readback), and up
//! to three classified global memory regions.

use std::ffi::{c_void, CStr};

use crate::error::DispatchError;
use crate::hsa::{
    self, get_hsa_lib, HsaAgent, HsaRegion, HsaStatus, HSA_AGENT_INFO_DEVICE,
    HSA_AGENT_INFO_NAME, HSA_AGENT_INFO_QUEUE_MAX_SIZE, HSA_DEVICE_TYPE_CPU,
    HSA_DEVICE_TYPE_GPU, HSA_REGION_GLOBAL_FLAG_COARSE_GRAINED,
    HSA_REGION_GLOBAL_FLAG_FINE_GRAINED, HSA_REGION_GLOBAL_FLAG_KERNARG,
    HSA_REGION_INFO_GLOBAL_FLAGS, HSA_REGION_INFO_RUNTIME_ALLOC_ALLOWED,
    HSA_REGION_INFO_SEGMENT, HSA_REGION_SEGMENT_GLOBAL, HSA_STATUS_SUCCESS,
};

/// Global memory pools of the bound agent, classified by tier.
///
/// A zero handle means the tier does not exist on this device. `local == 0`
/// means host and device share fine-grained memory and buffers need no
/// staging.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionSet {
    /// Host-visible fine-grained memory.
    pub system: HsaRegion,
    /// Device-local coarse-grained memory.
    pub local: HsaRegion,
    /// Kernel-argument memory.
    pub kernarg: HsaRegion,
}

/// The accelerator this process dispatches to, plus the CPU agent used for
/// readback coherence.
#[derive(Debug, Clone)]
pub struct BoundDevice {
    pub gpu: HsaAgent,
    pub cpu: HsaAgent,
    pub name: String,
    pub queue_max_size: u32,
    pub regions: RegionSet,
}

#[derive(Default)]
struct AgentScan {
    gpu: HsaAgent,
    cpu: HsaAgent,
}

unsafe extern "C" fn agent_callback(agent: HsaAgent, data: *mut c_void) -> HsaStatus {
    let scan = &mut *(data as *mut AgentScan);
    let lib = match get_hsa_lib() {
        Ok(lib) => lib,
        Err(_) => return HSA_STATUS_SUCCESS,
    };

    let mut device_type: u32 = u32::MAX;
    let status = (lib.hsa_agent_get_info)(
        agent,
        HSA_AGENT_INFO_DEVICE,
        &mut device_type as *mut _ as *mut c_void,
    );
    if status != HSA_STATUS_SUCCESS {
        return status;
    }

    // Keep the first agent of each kind.
    if device_type == HSA_DEVICE_TYPE_GPU && scan.gpu == 0 {
        scan.gpu = agent;
    }
    if device_type == HSA_DEVICE_TYPE_CPU && scan.cpu == 0 {
        scan.cpu = agent;
    }

    HSA_STATUS_SUCCESS
}

unsafe extern "C" fn region_callback(region: HsaRegion, data: *mut c_void) -> HsaStatus {
    let regions = &mut *(data as *mut RegionSet);
    let lib = match get_hsa_lib() {
        Ok(lib) => lib,
        Err(_) => return HSA_STATUS_SUCCESS,
    };

    let mut segment: u32 = u32::MAX;
    (lib.hsa_region_get_info)(
        region,
        HSA_REGION_INFO_SEGMENT,
        &mut segment as *mut _ as *mut c_void,
    );
    if segment != HSA_REGION_SEGMENT_GLOBAL {
        return HSA_STATUS_SUCCESS;
    }

    let mut runtime_alloc: u32 = 0;
    (lib.hsa_region_get_info)(
        region,
        HSA_REGION_INFO_RUNTIME_ALLOC_ALLOWED,
        &mut runtime_alloc as *mut _ as *mut c_void,
    );
    if runtime_alloc == 0 {
        return HSA_STATUS_SUCCESS;
    }

    let mut flags: u32 = 0;
    (lib.hsa_region_get_info)(
        region,
        HSA_REGION_INFO_GLOBAL_FLAGS,
        &mut flags as *mut _ as *mut c_void,
    );

    if flags & HSA_REGION_GLOBAL_FLAG_FINE_GRAINED != 0 {
        regions.system = region;
    }
    if flags & HSA_REGION_GLOBAL_FLAG_COARSE_GRAINED != 0 {
        regions.local = region;
    }
    if flags & HSA_REGION_GLOBAL_FLAG_KERNARG != 0 {
        regions.kernarg = region;
    }

    HSA_STATUS_SUCCESS
}

/// Initialize the runtime, pick the first GPU and CPU agents, and classify
/// the GPU's global memory regions.
pub fn discover() -> Result<BoundDevice, DispatchError> {
    hsa::hsa_init().map_err(|e| DispatchError::Discovery(e.to_string()))?;
    let lib = get_hsa_lib().map_err(|e| DispatchError::Discovery(e.to_string()))?;

    let mut scan = AgentScan::default();
    let status =
        unsafe { (lib.hsa_iterate_agents)(agent_callback, &mut scan as *mut _ as *mut c_void) };
    hsa::check(status, "hsa_iterate_agents").map_err(DispatchError::Discovery)?;

    if scan.gpu == 0 {
        return Err(DispatchError::Discovery("no GPU agent found".into()));
    }

    let mut name_buf = [0u8; 64];
    let status = unsafe {
        (lib.hsa_agent_get_info)(
            scan.gpu,
            HSA_AGENT_INFO_NAME,
            name_buf.as_mut_ptr() as *mut c_void,
        )
    };
    hsa::check(status, "hsa_agent_get_info(NAME)").map_err(DispatchError::Discovery)?;
    let name = CStr::from_bytes_until_nul(&name_buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut queue_max_size: u32 = 0;
    let status = unsafe {
        (lib.hsa_agent_get_info)(
            scan.gpu,
            HSA_AGENT_INFO_QUEUE_MAX_SIZE,
            &mut queue_max_size as *mut _ as *mut c_void,
        )
    };
    hsa::check(status, "hsa_agent_get_info(QUEUE_MAX_SIZE)").map_err(DispatchError::Discovery)?;

    let mut regions = RegionSet::default();
    let status = unsafe {
        (lib.hsa_agent_iterate_regions)(
            scan.gpu,
            region_callback,
            &mut regions as *mut _ as *mut c_void,
        )
    };
    hsa::check(status, "hsa_agent_iterate_regions").map_err(DispatchError::Discovery)?;

    if regions.kernarg == 0 {
        return Err(DispatchError::Discovery(
            "no kernarg memory region found".into(),
        ));
    }
    if regions.system == 0 {
        return Err(DispatchError::Discovery(
            "no fine-grained system memory region found".into(),
        ));
    }

    Ok(BoundDevice {
        gpu: scan.gpu,
        cpu: scan.cpu,
        name,
        queue_max_size,
        regions,
    })
}

impl RegionSet {
    /// True when the device has a separate device-local memory tier, i.e.
    /// buffers must be staged.
    pub fn has_local_tier(&self) -> bool {
        self.local != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region_set_has_no_local_tier() {
        assert!(!RegionSet::default().has_local_tier());
    }

    #[test]
    fn local_handle_enables_staging() {
        let regions = RegionSet {
            system: 1,
            local: 2,
            kernarg: 3,
        };
        assert!(regions.has_local_tier());
    }
}
