//! Code object loading and executable creation.
//!
//! Takes a compiled device binary (an HSACO / code object image), turns it
//! into a frozen executable on the bound agent, and resolves the kernel
//! entry point to the handle and segment sizes the dispatch packet needs.
//! The image bytes stay owned here: the code object reader references them
//! for the life of the executable.

use std::ffi::{c_void, CString};
use std::path::Path;
use std::ptr;

use crate::error::DispatchError;
use crate::hsa::{
    self, get_hsa_lib, HsaAgent, HsaCodeObjectReader, HsaExecutable, HsaExecutableSymbol,
    HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT, HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE,
    HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
    HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT,
    HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE, HSA_PROFILE_FULL,
};

pub struct KernelExecutable {
    executable: HsaExecutable,
    reader: HsaCodeObjectReader,
    #[allow(dead_code)]
    image: Vec<u8>,
    kernel_object: u64,
    kernarg_segment_size: u32,
    group_segment_size: u32,
    private_segment_size: u32,
}

impl KernelExecutable {
    /// Read a code object image from disk and load it.
    pub fn load_from_file(
        agent: HsaAgent,
        path: &Path,
        symbol: &str,
    ) -> Result<Self, DispatchError> {
        let image = std::fs::read(path)
            .map_err(|e| DispatchError::Load(format!("{}: {}", path.display(), e)))?;
        Self::load(agent, image, symbol)
    }

    /// Create, load, and freeze an executable from an in-memory image, then
    /// resolve `symbol` as the kernel entry point.
    pub fn load(agent: HsaAgent, image: Vec<u8>, symbol: &str) -> Result<Self, DispatchError> {
        let lib = get_hsa_lib().map_err(|e| DispatchError::Load(e.to_string()))?;

        let mut reader: HsaCodeObjectReader = 0;
        let status = unsafe {
            (lib.hsa_code_object_reader_create_from_memory)(
                image.as_ptr() as *const c_void,
                image.len(),
                &mut reader,
            )
        };
        hsa::check(status, "hsa_code_object_reader_create_from_memory")
            .map_err(DispatchError::Load)?;

        let destroy_reader = |reader: HsaCodeObjectReader| unsafe {
            let _ = (lib.hsa_code_object_reader_destroy)(reader);
        };

        let mut executable: HsaExecutable = 0;
        let status = unsafe {
            (lib.hsa_executable_create_alt)(
                HSA_PROFILE_FULL,
                HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT,
                ptr::null(),
                &mut executable,
            )
        };
        if let Err(e) = hsa::check(status, "hsa_executable_create_alt") {
            destroy_reader(reader);
            return Err(DispatchError::Load(e));
        }

        let mut this = Self {
            executable,
            reader,
            image,
            kernel_object: 0,
            kernarg_segment_size: 0,
            group_segment_size: 0,
            private_segment_size: 0,
        };

        // From here Drop cleans up on error.
        let status = unsafe {
            (lib.hsa_executable_load_agent_code_object)(
                this.executable,
                agent,
                this.reader,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        hsa::check(status, "hsa_executable_load_agent_code_object").map_err(DispatchError::Load)?;

        let status = unsafe { (lib.hsa_executable_freeze)(this.executable, ptr::null()) };
        hsa::check(status, "hsa_executable_freeze").map_err(DispatchError::Load)?;

        let symbol_c = CString::new(symbol)
            .map_err(|_| DispatchError::Load(format!("invalid kernel symbol name {symbol:?}")))?;
        let mut kernel_symbol: HsaExecutableSymbol = 0;
        let status = unsafe {
            (lib.hsa_executable_get_symbol_by_name)(
                this.executable,
                symbol_c.as_ptr(),
                &agent,
                &mut kernel_symbol,
            )
        };
        hsa::check(status, "hsa_executable_get_symbol_by_name").map_err(DispatchError::Load)?;
        if kernel_symbol == 0 {
            return Err(DispatchError::Load(format!(
                "kernel entry point {symbol:?} not found in code object"
            )));
        }

        let read_info = |attr: u32, out: *mut c_void, what: &str| -> Result<(), DispatchError> {
            let status = unsafe { (lib.hsa_executable_symbol_get_info)(kernel_symbol, attr, out) };
            hsa::check(status, what).map_err(DispatchError::Load)
        };

        read_info(
            HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT,
            &mut this.kernel_object as *mut _ as *mut c_void,
            "symbol_get_info(KERNEL_OBJECT)",
        )?;
        read_info(
            HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
            &mut this.kernarg_segment_size as *mut _ as *mut c_void,
            "symbol_get_info(KERNARG_SEGMENT_SIZE)",
        )?;
        read_info(
            HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE,
            &mut this.group_segment_size as *mut _ as *mut c_void,
            "symbol_get_info(GROUP_SEGMENT_SIZE)",
        )?;
        read_info(
            HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE,
            &mut this.private_segment_size as *mut _ as *mut c_void,
            "symbol_get_info(PRIVATE_SEGMENT_SIZE)",
        )?;

        Ok(this)
    }

    /// Device entry-point handle for the packet's kernel_object field.
    pub fn kernel_object(&self) -> u64 {
        self.kernel_object
    }

    /// Kernarg bytes the entry point expects, as reported by the loader.
    pub fn kernarg_segment_size(&self) -> u32 {
        self.kernarg_segment_size
    }

    pub fn group_segment_size(&self) -> u32 {
        self.group_segment_size
    }

    pub fn private_segment_size(&self) -> u32 {
        self.private_segment_size
    }
}

impl Drop for KernelExecutable {
    fn drop(&mut self) {
        if let Ok(lib) = get_hsa_lib() {
            unsafe {
                if self.executable != 0 {
                    let _ = (lib.hsa_executable_destroy)(self.executable);
                }
                if self.reader != 0 {
                    let _ = (lib.hsa_code_object_reader_destroy)(self.reader);
                }
            }
        }
    }
}

unsafe impl Send for KernelExecutable {}
