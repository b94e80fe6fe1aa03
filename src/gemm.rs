//! Single-precision GEMM dispatch task.
//!
//! The canonical workload for the engine: `c = alpha*a*b + beta*c` over
//! M=N=K=128 with a 16x16 workgroup covering an 8x8 microtile per work-item.
//! Operands are filled with `a[i] = b[i] = c[i] = i`, which gives the kernel
//! a closed-form expected output that `verify` checks element by element.

use std::path::PathBuf;

use crate::dispatch::{BufferId, CodeObjectSource, Dispatch, DispatchTask};
use crate::error::{DispatchError, Result};

const WORKGROUP: [u16; 2] = [16, 16];
const MICROTILE: [u32; 2] = [8, 8];

/// Kernarg footprint: three buffer addresses plus eleven 4-byte scalars.
pub const GEMM_KERNARG_BYTES: usize = 3 * 8 + 11 * 4;

pub struct GemmTask {
    code_object: PathBuf,
    symbol: String,

    m: u32,
    n: u32,
    k: u32,
    alpha: f32,
    beta: f32,
    // Initial element scale for each operand: x[i] = v * i.
    va: f32,
    vb: f32,
    vc: f32,

    c: Option<BufferId>,
    a: Option<BufferId>,
    b: Option<BufferId>,
}

impl GemmTask {
    pub fn new(code_object: PathBuf, symbol: impl Into<String>) -> Self {
        Self {
            code_object,
            symbol: symbol.into(),
            m: 128,
            n: 128,
            k: 128,
            alpha: 1.0,
            beta: 1.0,
            va: 1.0,
            vb: 1.0,
            vc: 1.0,
            c: None,
            a: None,
            b: None,
        }
    }

    fn elements_c(&self) -> usize {
        (self.m * self.n) as usize
    }

    /// Expected output element given the `x[i] = v*i` operand fill.
    pub fn expected(&self, index: usize) -> f32 {
        let i = index as f32;
        self.alpha * (self.va * i) * (self.vb * i) + self.beta * (self.vc * i)
    }

    fn fill(&self, dispatch: &mut Dispatch, id: BufferId, scale: f32) {
        for (i, slot) in dispatch.buffer_mut(id).as_mut_slice::<f32>().iter_mut().enumerate() {
            *slot = scale * i as f32;
        }
    }
}

impl DispatchTask for GemmTask {
    fn setup_code_object(&mut self) -> Result<CodeObjectSource> {
        Ok(CodeObjectSource::File(self.code_object.clone()))
    }

    fn kernel_symbol(&self) -> &str {
        &self.symbol
    }

    fn setup(&mut self, dispatch: &mut Dispatch) -> Result<()> {
        dispatch.allocate_kernarg(GEMM_KERNARG_BYTES)?;

        let bytes = |elems: u32| elems as usize * std::mem::size_of::<f32>();
        let c = dispatch.allocate_buffer(bytes(self.m * self.n))?;
        let a = dispatch.allocate_buffer(bytes(self.m * self.k))?;
        let b = dispatch.allocate_buffer(bytes(self.n * self.k))?;

        self.fill(dispatch, c, self.vc);
        self.fill(dispatch, a, self.va);
        self.fill(dispatch, b, self.vb);

        dispatch.copy_to_device(c)?;
        dispatch.copy_to_device(a)?;
        dispatch.copy_to_device(b)?;

        // Argument order is the entry point's signature: buffers, scalars,
        // offsets, strides, sizes.
        dispatch.pack_buffer_arg(c);
        dispatch.pack_buffer_arg(a);
        dispatch.pack_buffer_arg(b);
        dispatch.pack_arg(&self.alpha);
        dispatch.pack_arg(&self.beta);
        dispatch.pack_arg(&0u32); // offset C
        dispatch.pack_arg(&0u32); // offset A
        dispatch.pack_arg(&0u32); // offset B
        dispatch.pack_arg(&self.n); // stride C
        dispatch.pack_arg(&self.k); // stride A
        dispatch.pack_arg(&self.k); // stride B
        dispatch.pack_arg(&self.m);
        dispatch.pack_arg(&self.n);
        dispatch.pack_arg(&self.k);

        dispatch.set_grid(self.m / MICROTILE[0], self.n / MICROTILE[1], 1);
        dispatch.set_workgroup(WORKGROUP[0], WORKGROUP[1], 1);

        self.c = Some(c);
        self.a = Some(a);
        self.b = Some(b);
        Ok(())
    }

    fn verify(&mut self, dispatch: &mut Dispatch) -> Result<()> {
        let c = self
            .c
            .ok_or_else(|| DispatchError::Verification("setup did not run".into()))?;
        dispatch.copy_from_device(c)?;

        let total = self.elements_c();
        let mut mismatches = Vec::new();
        {
            let out = dispatch.buffer(c).as_slice::<f32>();
            for index in 0..total {
                let want = self.expected(index);
                if out[index] != want {
                    mismatches.push((index, out[index], want));
                }
            }
        }

        for &(index, got, want) in mismatches.iter().take(8) {
            dispatch.note(format!("c[{index}] = {got} != {want}"));
        }

        if mismatches.is_empty() {
            dispatch.note(format!("All {total} output elements match"));
            Ok(())
        } else {
            Err(DispatchError::Verification(format!(
                "{} of {total} output elements differ",
                mismatches.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernarg::KernargBlock;

    #[test]
    fn kernarg_footprint_matches_the_fourteen_argument_layout() {
        // 3 pointers at 8-byte alignment, then 11 scalars at 4 bytes each,
        // with no padding anywhere.
        let mut storage = [0u8; 128];
        let mut block = KernargBlock::over_host(&mut storage);

        for _ in 0..3 {
            assert_eq!(block.append(&0u64) % 8, 0);
        }
        block.append(&1.0f32);
        block.append(&1.0f32);
        for _ in 0..3 {
            block.append(&0u32);
        }
        for stride in [128u32, 128, 128] {
            block.append(&stride);
        }
        for size in [128u32, 128, 128] {
            block.append(&size);
        }

        assert_eq!(block.len(), GEMM_KERNARG_BYTES);
    }

    #[test]
    fn expected_output_follows_the_closed_form() {
        let task = GemmTask::new(PathBuf::from("kernel.co"), "mad2d");
        assert_eq!(task.expected(0), 0.0);
        // alpha*(i)*(i) + beta*i with alpha = beta = 1
        assert_eq!(task.expected(3), 12.0);
        assert_eq!(task.expected(10), 110.0);
    }

    #[test]
    fn grid_covers_one_microtile_per_work_item() {
        let task = GemmTask::new(PathBuf::from("kernel.co"), "mad2d");
        assert_eq!(task.m / MICROTILE[0], 16);
        assert_eq!(task.n / MICROTILE[1], 16);
        assert_eq!(WORKGROUP, [16, 16]);
    }
}
