use std::fmt;
use std::sync::Arc;

use log::info;

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::error::StateError;
use crate::frame_capture::{FrameNotifier, FrameRecorder};

/// Graphics synthesizer frontend.
///
/// Handlers are built by a factory on the emulation thread and never leave
/// it, so they do not need to be `Send`.
pub trait GraphicsHandler {
    /// Called once after construction. `frames` is used to report finished
    /// frames and may be moved to another thread.
    fn initialize(&mut self, frames: FrameNotifier);

    /// Called right before the handler is dropped.
    fn release(&mut self);

    fn reset(&mut self);

    fn set_vblank(&mut self);
    fn reset_vblank(&mut self);

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError>;
    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError>;

    /// Local memory snapshot taken when a frame capture starts.
    fn memory(&self) -> &[u8] {
        &[]
    }

    /// Privileged register snapshot taken when a frame capture starts.
    fn registers(&self) -> &[u64] {
        &[]
    }

    /// Start (`Some`) or stop (`None`) forwarding submitted packets to a
    /// frame capture.
    fn set_frame_recorder(&mut self, _recorder: Option<FrameRecorder>) {}
}

/// Pad input frontend.
pub trait InputHandler {
    /// Publish the current pad state into the primary memory image.
    fn update(&mut self, memory: &mut [u8]);

    fn remove_all_listeners(&mut self);
    fn insert_listener(&mut self, listener: Arc<dyn InputListener>);
}

/// A device module interested in pad state changes.
pub trait InputListener: Send + Sync {
    fn set_button_state(&self, pad: u32, button: u32, pressed: bool);

    fn set_axis_state(&self, _pad: u32, _axis: u32, _value: u8) {}
}

/// Audio output frontend.
pub trait AudioHandler {
    fn has_free_buffers(&self) -> bool;
    fn recycle_buffers(&mut self);

    /// Queue interleaved stereo samples for playback at `sample_rate`.
    fn write(&mut self, samples: &[i16], sample_rate: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Graphics,
    Input,
    Audio,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerKind::Graphics => "graphics",
            HandlerKind::Input => "input",
            HandlerKind::Audio => "audio",
        })
    }
}

/// A slot holding at most one live handler.
pub struct HandlerSlot<T: ?Sized> {
    handler: Option<Box<T>>,
}

impl<T: ?Sized> HandlerSlot<T> {
    pub fn new() -> Self {
        Self { handler: None }
    }

    /// Build a handler with `factory` if the slot is empty. The factory is not
    /// called when a handler is already attached.
    pub fn attach(&mut self, factory: impl FnOnce() -> Box<T>) -> Option<&mut T> {
        if self.handler.is_some() {
            return None;
        }
        Some(&mut **self.handler.insert(factory()))
    }

    pub fn detach(&mut self) -> Option<Box<T>> {
        self.handler.take()
    }

    pub fn is_attached(&self) -> bool {
        self.handler.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.handler.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.handler.as_deref_mut()
    }
}

impl<T: ?Sized> Default for HandlerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three frontend slots of a machine.
#[derive(Default)]
pub struct Devices {
    pub graphics: HandlerSlot<dyn GraphicsHandler>,
    pub input: HandlerSlot<dyn InputHandler>,
    pub audio: HandlerSlot<dyn AudioHandler>,
}

impl Devices {
    pub fn is_attached(&self, kind: HandlerKind) -> bool {
        match kind {
            HandlerKind::Graphics => self.graphics.is_attached(),
            HandlerKind::Input => self.input.is_attached(),
            HandlerKind::Audio => self.audio.is_attached(),
        }
    }

    /// Tear down the handler in `kind`'s slot. Returns whether one was
    /// attached.
    pub fn detach(&mut self, kind: HandlerKind) -> bool {
        let detached = match kind {
            HandlerKind::Graphics => match self.graphics.detach() {
                Some(mut gs) => {
                    gs.release();
                    true
                }
                None => false,
            },
            HandlerKind::Input => self.input.detach().is_some(),
            HandlerKind::Audio => self.audio.detach().is_some(),
        };
        if detached {
            info!("VM: {kind} handler detached");
        }
        detached
    }

    pub fn detach_all(&mut self) {
        self.detach(HandlerKind::Graphics);
        self.detach(HandlerKind::Input);
        self.detach(HandlerKind::Audio);
    }
}
