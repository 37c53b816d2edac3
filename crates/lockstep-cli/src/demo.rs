//! A small synthetic console used by the command-line runner.
//!
//! None of these parts emulate real silicon. They tick, produce a tone, draw
//! nothing and read sectors, which is enough to drive the scheduler, the
//! handler slots and the save-state path end to end.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, info};
use lockstep_core::archive::{ArchiveReader, ArchiveWriter, SectionReader, SectionWriter};
use lockstep_core::devices::{GraphicsHandler, InputHandler, InputListener};
use lockstep_core::frame_capture::{FrameNotifier, FrameRecorder};
use lockstep_core::hardware::{CoProcessor, Hardware, Processor, RemovableMedia, SoundCore};
use lockstep_core::{ExecutionError, StateError};

pub const SECTOR_SIZE: usize = 2048;

const PRIMARY_MEMORY: usize = 64 * 1024;
const SECONDARY_MEMORY: usize = 8 * 1024;
const PAD_OFFSET: usize = 0x100;
const SECTOR_OFFSET: usize = 0x1000;

/// A processor that burns its budget, sleeps through vblank and stamps a
/// frame counter into its memory.
pub struct ClockedCpu {
    name: &'static str,
    memory: Vec<u8>,
    executed: u64,
    frames: u64,
    in_vblank: bool,
    listeners: Vec<Arc<dyn InputListener>>,
    media: Option<Weak<dyn RemovableMedia>>,
}

impl ClockedCpu {
    pub fn new(name: &'static str, memory_size: usize) -> Self {
        Self {
            name,
            memory: vec![0; memory_size],
            executed: 0,
            frames: 0,
            in_vblank: false,
            listeners: Vec::new(),
            media: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn InputListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Pull the sector matching the current frame from the mounted media.
    fn stream_sector(&mut self) {
        let Some(media) = self.media.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let end = SECTOR_OFFSET + SECTOR_SIZE;
        if self.memory.len() < end {
            return;
        }
        if let Err(e) = media.read_sector(self.frames, &mut self.memory[SECTOR_OFFSET..end]) {
            debug!("{}: sector {} unreadable: {e}", self.name, self.frames);
        }
    }
}

impl Processor for ClockedCpu {
    fn execute(&mut self, ticks: i32) -> Result<i32, ExecutionError> {
        if ticks < 0 {
            return Err(ExecutionError::new(self.name, "negative tick budget"));
        }
        if !self.in_vblank {
            self.executed += ticks as u64;
        }
        Ok(ticks)
    }

    fn is_idle(&self) -> bool {
        self.in_vblank
    }

    fn reset(&mut self) {
        self.memory.fill(0);
        self.executed = 0;
        self.frames = 0;
        self.in_vblank = false;
    }

    fn count_ticks(&mut self, _ticks: i32) {}

    fn notify_vblank_start(&mut self) {
        self.in_vblank = true;
        self.frames += 1;
        if let Some(stamp) = self.memory.get_mut(..8) {
            stamp.copy_from_slice(&self.frames.to_le_bytes());
        }
        self.stream_sector();
    }

    fn notify_vblank_end(&mut self) {
        self.in_vblank = false;
    }

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError> {
        let data = SectionWriter::new()
            .write_u64(self.executed)
            .write_u64(self.frames)
            .write_bool(self.in_vblank)
            .write_blob(&self.memory)?
            .finish();
        archive.insert(self.name, data)
    }

    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError> {
        let data = archive.read_section(self.name)?;
        let mut reader = SectionReader::new(self.name, data);
        let executed = reader.read_u64()?;
        let frames = reader.read_u64()?;
        let in_vblank = reader.read_bool()?;
        let memory = reader.read_blob()?;
        reader.finish()?;
        if memory.len() != self.memory.len() {
            return Err(StateError::Corrupt {
                section: self.name.to_owned(),
                reason: "memory size mismatch",
            });
        }

        self.executed = executed;
        self.frames = frames;
        self.in_vblank = in_vblank;
        self.memory.copy_from_slice(memory);
        Ok(())
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn input_listeners(&self) -> Vec<Arc<dyn InputListener>> {
        self.listeners.clone()
    }

    fn set_removable_media(&mut self, media: Option<Weak<dyn RemovableMedia>>) {
        self.media = media;
    }
}

#[derive(Default)]
pub struct VectorUnit {
    executed: u64,
}

impl CoProcessor for VectorUnit {
    fn execute(&mut self, ticks: i32) {
        self.executed += u64::from(ticks.unsigned_abs());
    }

    fn reset(&mut self) {
        if self.executed > 0 {
            debug!("Vector unit reset after {} ticks", self.executed);
        }
        self.executed = 0;
    }
}

/// Square wave generator standing in for a sound core.
pub struct ToneCore {
    frequency: u32,
    amplitude: i16,
    phase: u32,
    enabled: bool,
}

impl ToneCore {
    pub fn new(frequency: u32, amplitude: i16, enabled: bool) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0,
            enabled,
        }
    }
}

impl SoundCore for ToneCore {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn render(&mut self, samples: &mut [i16], sample_rate: u32) {
        if !self.enabled {
            samples.fill(0);
            return;
        }
        let rate = sample_rate.max(1);
        for frame in samples.chunks_exact_mut(2) {
            let high = (u64::from(self.phase) * u64::from(self.frequency) * 2 / u64::from(rate)) % 2
                == 0;
            let value = if high { self.amplitude } else { -self.amplitude };
            frame.fill(value);
            self.phase = (self.phase + 1) % rate;
        }
    }
}

/// Pad port module living on the secondary processor.
#[derive(Default)]
pub struct PadPort {
    buttons: AtomicU32,
}

impl PadPort {
    pub fn buttons(&self) -> u32 {
        self.buttons.load(Ordering::Acquire)
    }
}

impl InputListener for PadPort {
    fn set_button_state(&self, pad: u32, button: u32, pressed: bool) {
        if pad != 0 || button >= 32 {
            return;
        }
        let mask = 1 << button;
        if pressed {
            self.buttons.fetch_or(mask, Ordering::AcqRel);
        } else {
            self.buttons.fetch_and(!mask, Ordering::AcqRel);
        }
    }
}

/// Graphics frontend that renders nothing but keeps the frame cadence and a
/// little local memory so captures and save states have content.
pub struct HeadlessGraphics {
    frames: Arc<AtomicU64>,
    notifier: Option<FrameNotifier>,
    recorder: Option<FrameRecorder>,
    memory: Vec<u8>,
    registers: [u64; 2],
}

impl HeadlessGraphics {
    pub fn new(frames: Arc<AtomicU64>) -> Self {
        Self {
            frames,
            notifier: None,
            recorder: None,
            memory: vec![0; 1024],
            registers: [0; 2],
        }
    }
}

impl GraphicsHandler for HeadlessGraphics {
    fn initialize(&mut self, frames: FrameNotifier) {
        self.notifier = Some(frames);
    }

    fn release(&mut self) {
        self.notifier = None;
        self.recorder = None;
    }

    fn reset(&mut self) {
        self.memory.fill(0);
        self.registers = [0; 2];
    }

    fn set_vblank(&mut self) {
        let frame = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
        self.registers[0] = frame;
        self.registers[1] |= 1;
        let index = (frame as usize) % self.memory.len();
        self.memory[index] = self.memory[index].wrapping_add(1);

        if let Some(recorder) = &self.recorder {
            recorder.record(&frame.to_le_bytes());
        }
        if let Some(notifier) = &self.notifier {
            notifier.notify_new_frame();
        }
    }

    fn reset_vblank(&mut self) {
        self.registers[1] &= !1;
    }

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError> {
        let data = SectionWriter::new()
            .write_u64(self.registers[0])
            .write_u64(self.registers[1])
            .write_blob(&self.memory)?
            .finish();
        archive.insert("graphics", data)
    }

    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError> {
        let mut reader = SectionReader::new("graphics", archive.read_section("graphics")?);
        let registers = [reader.read_u64()?, reader.read_u64()?];
        let memory = reader.read_blob()?.to_vec();
        reader.finish()?;
        if memory.is_empty() {
            return Err(StateError::Corrupt {
                section: "graphics".to_owned(),
                reason: "empty local memory",
            });
        }
        self.registers = registers;
        self.memory = memory;
        Ok(())
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn registers(&self) -> &[u64] {
        &self.registers
    }

    fn set_frame_recorder(&mut self, recorder: Option<FrameRecorder>) {
        self.recorder = recorder;
    }
}

/// Input frontend that taps the start button once a second.
#[derive(Default)]
pub struct ScriptedPad {
    listeners: Vec<Arc<dyn InputListener>>,
    frame: u64,
}

const START_BUTTON: u32 = 3;

impl InputHandler for ScriptedPad {
    fn update(&mut self, memory: &mut [u8]) {
        self.frame += 1;
        let pressed = self.frame % 60 == 0;
        for listener in &self.listeners {
            listener.set_button_state(0, START_BUTTON, pressed);
        }
        if let Some(slot) = memory.get_mut(PAD_OFFSET..PAD_OFFSET + 2) {
            let state: u16 = if pressed { !(1 << START_BUTTON) } else { 0xFFFF };
            slot.copy_from_slice(&state.to_le_bytes());
        }
    }

    fn remove_all_listeners(&mut self) {
        self.listeners.clear();
    }

    fn insert_listener(&mut self, listener: Arc<dyn InputListener>) {
        self.listeners.push(listener);
    }
}

/// A raw sector image on disk.
pub struct RawImage {
    label: String,
    file: Mutex<File>,
    sectors: u64,
}

impl RawImage {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!("Opened disc image {label} ({sectors} sectors)");
        Ok(Self {
            label,
            file: Mutex::new(file),
            sectors,
        })
    }
}

impl RemovableMedia for RawImage {
    fn label(&self) -> &str {
        &self.label
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.sectors == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty image"));
        }
        let len = buf.len().min(SECTOR_SIZE);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((sector % self.sectors) * SECTOR_SIZE as u64))?;
        file.read_exact(&mut buf[..len])
    }
}

/// Build the synthetic console. The pad port is returned so the runner can
/// report what the secondary processor saw.
pub fn hardware() -> (Hardware, Arc<PadPort>) {
    let pad = Arc::new(PadPort::default());
    let hardware = Hardware {
        primary: Box::new(ClockedCpu::new("primary", PRIMARY_MEMORY)),
        secondary: Box::new(
            ClockedCpu::new("secondary", SECONDARY_MEMORY)
                .with_listener(Arc::clone(&pad) as Arc<dyn InputListener>),
        ),
        vector0: Box::new(VectorUnit::default()),
        vector1: Box::new(VectorUnit::default()),
        sound0: Box::new(ToneCore::new(440, 2000, true)),
        sound1: Box::new(ToneCore::new(660, 1000, true)),
    };
    (hardware, pad)
}
