//! aql-dispatch: single-kernel AQL dispatch over the HSA Runtime.
//!
//! This crate launches one compute kernel on an AMD GPU and retrieves its
//! results. It owns the three parts of a launch that are easy to get subtly
//! wrong when written inline:
//!
//! - **Packet publishing**: slot reservation in the shared ring queue and the
//!   fill-then-release-store protocol that keeps the device from ever seeing
//!   a half-written packet.
//! - **Two-tier memory**: host-visible vs. device-local buffers with explicit
//!   staging copies and the cross-agent coherence step on readback.
//! - **Kernarg packing**: heterogeneous argument values laid out in one raw
//!   region under hardware alignment rules.
//!
//! The HSA Runtime is loaded dynamically (libhsa-runtime64.so ships with the
//! AMD GPU driver), so the crate builds and its host-side logic runs on
//! machines without a GPU.
//!
//! # Quick start
//!
//! ```ignore
//! use aql_dispatch::{Dispatch, GemmTask};
//!
//! let mut task = GemmTask::new("kernel.co".into(), "mad2d");
//! std::process::exit(Dispatch::new().run_main(&mut task));
//! ```

pub mod agent;
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod executable;
pub mod gemm;
pub mod hsa;
pub mod kernarg;
pub mod packet;
pub mod queue;
pub mod signal;

pub use agent::{BoundDevice, RegionSet};
pub use buffer::Buffer;
pub use dispatch::{
    BufferId, CodeObjectSource, Dispatch, DispatchTask, LifecycleState, DEFAULT_DEADLINE,
};
pub use error::{DispatchError, Result};
pub use executable::KernelExecutable;
pub use gemm::GemmTask;
pub use hsa::is_hsa_available;
pub use kernarg::KernargBlock;
pub use queue::CommandQueue;
pub use signal::CompletionSignal;
