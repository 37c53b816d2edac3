use std::sync::{Arc, Weak};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::devices::InputListener;
use crate::error::{ExecutionError, StateError};

/// An emulated CPU together with the devices it clocks.
///
/// Processors are driven exclusively from the emulation thread.
pub trait Processor: Send {
    /// Run for up to `ticks` ticks and return how many were consumed.
    fn execute(&mut self, ticks: i32) -> Result<i32, ExecutionError>;

    /// Whether the processor is waiting for an interrupt. An idle processor
    /// is charged its whole budget.
    fn is_idle(&self) -> bool;

    /// Whether execution stopped on a breakpoint.
    fn must_break(&self) -> bool {
        false
    }

    /// Ignore a breakpoint at the current position once, so a resumed
    /// machine can step past it.
    fn disable_breakpoints_once(&mut self) {}

    fn reset(&mut self);

    /// Advance timers and other tick-driven devices.
    fn count_ticks(&mut self, ticks: i32);

    fn notify_vblank_start(&mut self);
    fn notify_vblank_end(&mut self);

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError>;
    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError>;

    /// Main memory image, sampled into by the input handler.
    fn memory_mut(&mut self) -> &mut [u8] {
        &mut []
    }

    /// Modules that want to hear about pad input.
    fn input_listeners(&self) -> Vec<Arc<dyn InputListener>> {
        Vec::new()
    }

    /// Point media-backed devices at the mounted media, or at nothing.
    fn set_removable_media(&mut self, _media: Option<Weak<dyn RemovableMedia>>) {}
}

/// A vector unit clocked alongside the primary processor.
pub trait CoProcessor: Send {
    fn execute(&mut self, ticks: i32);

    fn must_break(&self) -> bool {
        false
    }

    fn disable_breakpoints_once(&mut self) {}

    fn reset(&mut self) {}
}

/// One of the sound processor cores feeding the mixer.
pub trait SoundCore: Send {
    fn is_enabled(&self) -> bool;

    /// Fill `samples` (interleaved stereo) for output at `sample_rate`.
    fn render(&mut self, samples: &mut [i16], sample_rate: u32);
}

/// Removable disc media. Owned by the machine; devices only hold weak
/// references to it.
pub trait RemovableMedia: Send + Sync {
    fn label(&self) -> &str;

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// Everything the scheduler drives.
pub struct Hardware {
    pub primary: Box<dyn Processor>,
    pub secondary: Box<dyn Processor>,
    pub vector0: Box<dyn CoProcessor>,
    pub vector1: Box<dyn CoProcessor>,
    pub sound0: Box<dyn SoundCore>,
    pub sound1: Box<dyn SoundCore>,
}

impl Hardware {
    pub(crate) fn must_break(&self) -> bool {
        self.primary.must_break()
            || self.secondary.must_break()
            || self.vector0.must_break()
            || self.vector1.must_break()
    }

    pub(crate) fn disable_breakpoints_once(&mut self) {
        self.primary.disable_breakpoints_once();
        self.secondary.disable_breakpoints_once();
        self.vector0.disable_breakpoints_once();
        self.vector1.disable_breakpoints_once();
    }

    pub(crate) fn reset(&mut self) {
        self.primary.reset();
        self.secondary.reset();
        self.vector0.reset();
        self.vector1.reset();
    }

    pub(crate) fn set_removable_media(&mut self, media: Option<&Arc<dyn RemovableMedia>>) {
        let weak = media.map(Arc::downgrade);
        self.primary.set_removable_media(weak.clone());
        self.secondary.set_removable_media(weak);
    }

    pub(crate) fn input_listeners(&self) -> Vec<Arc<dyn InputListener>> {
        let mut listeners = self.primary.input_listeners();
        listeners.extend(self.secondary.input_listeners());
        listeners
    }
}
