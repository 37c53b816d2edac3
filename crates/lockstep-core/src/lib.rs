//! Lockstep orchestration core for a dual-CPU console virtual machine.
//!
//! This crate owns the emulation loop and everything that has to stay consistent
//! around it: the cross-thread command mailbox, the handler slots frontends plug
//! graphics/input/audio into, the fixed-ratio tick scheduler and the save-state
//! orchestration. Processor cores, renderers and drivers are collaborators that
//! plug in through the traits in [`hardware`] and [`devices`].

/// Named-section save-state archive.
pub mod archive;

/// Fixed-size sound block mixing.
pub mod audio;

/// Graphics/input/audio handler traits and their slots.
pub mod devices;

/// Error types shared across the crate.
pub mod error;

/// Diagnostic frame capture.
pub mod frame_capture;

/// Processor, co-processor, sound core and media collaborator traits.
pub mod hardware;

/// Ordered cross-thread command queue.
pub mod mailbox;

/// Clock constants, vblank pacing and utilisation counters.
pub mod timing;

/// The virtual machine: consumer thread, scheduler loop and public handle.
pub mod vm;

pub use error::{ExecutionError, StateError, VmError};
pub use vm::{ProcessorId, StateHandle, VirtualMachine, VmConfig, VmEvent, VmHandle, VmStatus};
