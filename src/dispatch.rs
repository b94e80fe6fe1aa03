//! The dispatch lifecycle: a fixed seven-phase state machine that binds a
//! device, prepares and publishes exactly one AQL packet, waits for
//! completion, and hands the result to caller-supplied verification.
//!
//! One `Dispatch` instance executes one kernel launch over its lifetime.
//! All phases run sequentially on the creating thread; the only concurrency
//! is the device executing the kernel between `publish` and signal
//! completion. Each phase appends to a diagnostics transcript instead of
//! printing; the driver flushes it once at the end of the run.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{self, BoundDevice};
use crate::buffer::Buffer;
use crate::error::{DispatchError, Result};
use crate::executable::KernelExecutable;
use crate::hsa::HsaKernelDispatchPacket;
use crate::kernarg::KernargBlock;
use crate::packet;
use crate::queue::CommandQueue;
use crate::signal::CompletionSignal;

/// Default completion deadline, matching typical debug-kernel runtimes with
/// a wide margin.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// Strictly sequential lifecycle states. There is no cyclic or re-entrant
/// transition; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    DeviceBound,
    DispatchPrepared,
    ExecutableBound,
    ArgumentsPacked,
    Submitted,
    Completed,
    Failed,
}

/// Borrowed handle to a lifecycle-owned buffer, valid for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

/// Where the device program comes from.
pub enum CodeObjectSource {
    /// Load the image from a file on disk.
    File(PathBuf),
    /// Use an in-memory image.
    Memory(Vec<u8>),
}

/// The three caller customization points of a dispatch.
///
/// `setup` runs after the executable is bound: allocate buffers, stage
/// inputs, pack kernargs, set extents. `verify` runs after completion:
/// stage outputs back and check them; its result is the lifecycle's overall
/// result.
pub trait DispatchTask {
    /// Supply the device program image.
    fn setup_code_object(&mut self) -> Result<CodeObjectSource>;

    /// Name of the kernel entry point inside the code object.
    fn kernel_symbol(&self) -> &str;

    fn setup(&mut self, dispatch: &mut Dispatch) -> Result<()>;

    fn verify(&mut self, dispatch: &mut Dispatch) -> Result<()>;
}

pub struct Dispatch {
    state: LifecycleState,
    transcript: String,
    deadline: Duration,

    device: Option<BoundDevice>,
    queue: Option<CommandQueue>,
    signal: Option<CompletionSignal>,
    executable: Option<KernelExecutable>,
    kernarg: Option<KernargBlock>,
    buffers: Vec<Buffer>,

    packet_index: u64,
    slot: *mut HsaKernelDispatchPacket,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            transcript: String::new(),
            deadline: DEFAULT_DEADLINE,
            device: None,
            queue: None,
            signal: None,
            executable: None,
            kernarg: None,
            buffers: Vec::new(),
            packet_index: 0,
            slot: std::ptr::null_mut(),
        }
    }

    /// Override the completion deadline before running.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The accumulated human-readable diagnostics for this run.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Append a line to the diagnostics transcript.
    pub fn note(&mut self, line: impl AsRef<str>) {
        log::debug!("{}", line.as_ref());
        let _ = writeln!(self.transcript, "{}", line.as_ref());
    }

    // ------------------------------------------------------------------
    // Task-facing surface, used from `setup` and `verify`
    // ------------------------------------------------------------------

    /// Allocate the kernarg region and attach it to the reserved packet.
    pub fn allocate_kernarg(&mut self, size: usize) -> Result<()> {
        let device = self.device_ref()?;
        let block = KernargBlock::allocate(device.regions.kernarg, size)?;
        unsafe { packet::set_kernarg_address(self.reserved_slot(), block.base_ptr()) };
        if let Some(exe) = &self.executable {
            let expected = exe.kernarg_segment_size();
            if expected != 0 && expected as usize != size {
                log::warn!(
                    "kernarg block is {size} bytes but the entry point expects {expected}"
                );
            }
        }
        self.kernarg = Some(block);
        Ok(())
    }

    /// Allocate a buffer owned by this lifecycle; the handle stays valid
    /// until the dispatch is dropped.
    pub fn allocate_buffer(&mut self, size: usize) -> Result<BufferId> {
        let device = self.device_ref()?;
        let buffer = Buffer::allocate(&device.regions, size)?;
        self.buffers.push(buffer);
        Ok(BufferId(self.buffers.len() - 1))
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0]
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0]
    }

    /// Stage a buffer's host contents to the device tier.
    pub fn copy_to_device(&self, id: BufferId) -> Result<()> {
        self.buffers[id.0].copy_to_device()
    }

    /// Stage a buffer's device contents back to the host tier.
    pub fn copy_from_device(&self, id: BufferId) -> Result<()> {
        let device = self.device_ref()?;
        self.buffers[id.0].copy_from_device(device.cpu)
    }

    /// Pack a scalar kernel argument.
    pub fn pack_arg<T: bytemuck::Pod>(&mut self, value: &T) {
        self.kernarg_mut().append(value);
    }

    /// Pack a buffer kernel argument (its device address only).
    pub fn pack_buffer_arg(&mut self, id: BufferId) {
        let device_ptr = self.buffers[id.0].device_ptr() as u64;
        self.kernarg_mut().append(&device_ptr);
    }

    /// Set the workgroup extents on the reserved packet.
    ///
    /// Panics when no packet slot has been reserved yet; extents only exist
    /// on a prepared dispatch.
    pub fn set_workgroup(&mut self, x: u16, y: u16, z: u16) {
        unsafe { packet::set_workgroup(self.reserved_slot(), [x, y, z]) };
    }

    /// Set the grid extents on the reserved packet.
    ///
    /// Panics when no packet slot has been reserved yet.
    pub fn set_grid(&mut self, x: u32, y: u32, z: u32) {
        unsafe { packet::set_grid(self.reserved_slot(), [x, y, z]) };
    }

    // ------------------------------------------------------------------
    // Lifecycle phases
    // ------------------------------------------------------------------

    fn bind_device(&mut self) -> Result<()> {
        let device = agent::discover()?;
        self.note(format!("Using agent: {}", device.name));
        self.note(format!(
            "Memory tiers: system={} local={} kernarg={}",
            device.regions.system, device.regions.local, device.regions.kernarg
        ));

        let queue = CommandQueue::create(&device)?;
        self.note(format!("Queue capacity: {} packets", queue.capacity()));
        let signal = CompletionSignal::create()?;

        self.device = Some(device);
        self.queue = Some(queue);
        self.signal = Some(signal);
        self.state = LifecycleState::DeviceBound;
        Ok(())
    }

    fn prepare_packet(&mut self) -> Result<()> {
        let queue = self.queue.as_ref().expect("device bound");
        let signal = self.signal.as_ref().expect("device bound");

        self.packet_index = queue.reserve()?;
        self.slot = queue.slot(self.packet_index);
        unsafe {
            packet::clear_body(self.slot);
            packet::set_completion_signal(self.slot, signal.handle());
        }
        self.note(format!("Reserved packet index {}", self.packet_index));
        self.state = LifecycleState::DispatchPrepared;
        Ok(())
    }

    fn bind_executable(&mut self, task: &mut dyn DispatchTask) -> Result<()> {
        let gpu = self.device_ref()?.gpu;
        let executable = match task.setup_code_object()? {
            CodeObjectSource::File(path) => {
                self.note(format!("Loading code object from {}", path.display()));
                KernelExecutable::load_from_file(gpu, &path, task.kernel_symbol())?
            }
            CodeObjectSource::Memory(image) => {
                self.note(format!("Loading code object from memory ({} bytes)", image.len()));
                KernelExecutable::load(gpu, image, task.kernel_symbol())?
            }
        };

        unsafe {
            packet::set_kernel_object(self.slot, executable.kernel_object());
            packet::set_segment_sizes(
                self.slot,
                executable.group_segment_size(),
                executable.private_segment_size(),
            );
        }
        self.note(format!(
            "Resolved entry point {:?} (kernarg {} bytes, group {} bytes, private {} bytes)",
            task.kernel_symbol(),
            executable.kernarg_segment_size(),
            executable.group_segment_size(),
            executable.private_segment_size()
        ));
        self.executable = Some(executable);
        self.state = LifecycleState::ExecutableBound;
        Ok(())
    }

    fn pack_arguments(&mut self, task: &mut dyn DispatchTask) -> Result<()> {
        task.setup(self)?;
        let grid = unsafe { packet::grid_of(self.slot) };
        self.note(format!(
            "Extents: grid={}x{}x{} kernarg={} bytes",
            grid[0],
            grid[1],
            grid[2],
            self.kernarg.as_ref().map_or(0, |k| k.len())
        ));
        self.state = LifecycleState::ArgumentsPacked;
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        let grid = unsafe { packet::grid_of(self.slot) };
        unsafe {
            packet::publish(self.slot, packet::dispatch_header(), packet::dispatch_setup(grid));
        }
        self.queue
            .as_ref()
            .expect("device bound")
            .ring_doorbell(self.packet_index)?;
        self.note(format!("Published packet {}", self.packet_index));
        self.state = LifecycleState::Submitted;
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.signal
            .as_ref()
            .expect("device bound")
            .wait_until_zero(self.deadline)?;
        self.note("Kernel completed");
        self.state = LifecycleState::Completed;
        Ok(())
    }

    /// Run all seven phases against `task`, short-circuiting to `Failed` on
    /// the first error.
    pub fn run(&mut self, task: &mut dyn DispatchTask) -> Result<()> {
        let result = self.run_phases(task);
        if let Err(e) = &result {
            self.state = LifecycleState::Failed;
            let line = format!("Error: {e}");
            log::warn!("{line}");
            let _ = writeln!(self.transcript, "{line}");
        }
        result
    }

    fn run_phases(&mut self, task: &mut dyn DispatchTask) -> Result<()> {
        assert_eq!(
            self.state,
            LifecycleState::Uninitialized,
            "a dispatch lifecycle runs exactly once"
        );
        self.bind_device()?;
        self.prepare_packet()?;
        self.bind_executable(task)?;
        self.pack_arguments(task)?;
        self.submit()?;
        self.wait()?;
        task.verify(self)
    }

    /// Run, flush the transcript and verdict to stdout, and return a process
    /// exit code.
    pub fn run_main(&mut self, task: &mut dyn DispatchTask) -> i32 {
        let result = self.run(task);
        if !self.transcript.is_empty() {
            print!("{}", self.transcript);
        }
        println!("{}", if result.is_ok() { "Success" } else { "Failed" });
        i32::from(result.is_err())
    }

    fn device_ref(&self) -> Result<&BoundDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| DispatchError::Discovery("no device bound".into()))
    }

    fn kernarg_mut(&mut self) -> &mut KernargBlock {
        self.kernarg
            .as_mut()
            .expect("allocate_kernarg must be called before packing arguments")
    }

    fn reserved_slot(&self) -> *mut HsaKernelDispatchPacket {
        assert!(
            !self.slot.is_null(),
            "no packet reserved: packet fields can only be set from a task's setup"
        );
        self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_dispatch_starts_uninitialized() {
        let d = Dispatch::new();
        assert_eq!(d.state(), LifecycleState::Uninitialized);
        assert!(d.transcript().is_empty());
    }

    #[test]
    fn notes_accumulate_without_flushing() {
        let mut d = Dispatch::new();
        d.note("first");
        d.note("second");
        assert_eq!(d.transcript(), "first\nsecond\n");
    }

    #[test]
    #[should_panic(expected = "no packet reserved")]
    fn setting_the_grid_without_a_reserved_packet_is_fatal() {
        Dispatch::new().set_grid(16, 16, 1);
    }

    #[test]
    #[should_panic(expected = "no packet reserved")]
    fn setting_the_workgroup_without_a_reserved_packet_is_fatal() {
        Dispatch::new().set_workgroup(16, 16, 1);
    }
}
