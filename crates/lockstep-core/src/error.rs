use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
/// Failure while writing or applying a save state.
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("failed to move state file into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("missing section `{0}`")]
    MissingSection(String),

    #[error("section `{0}` read out of order")]
    SectionOutOfOrder(String),

    #[error("duplicate section `{0}`")]
    DuplicateSection(String),

    #[error("payload of {0} bytes does not fit a section")]
    Oversized(usize),

    #[error("corrupt section `{section}`: {reason}")]
    Corrupt {
        section: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{processor}: {message}")]
/// A processor could not continue executing.
pub struct ExecutionError {
    pub processor: &'static str,
    pub message: String,
}

impl ExecutionError {
    pub fn new(processor: &'static str, message: impl Into<String>) -> Self {
        Self {
            processor,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
/// Outcome of the emulation thread.
pub enum VmError {
    #[error("execution fault: {0}")]
    Execution(#[from] ExecutionError),

    #[error("the virtual machine is already running")]
    AlreadyRunning,

    #[error("failed to spawn the emulation thread: {0}")]
    Spawn(io::Error),

    #[error("the emulation thread panicked")]
    ThreadPanicked,
}
