#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lockstep_core::archive::{ArchiveReader, ArchiveWriter, SectionReader, SectionWriter};
use lockstep_core::devices::{AudioHandler, GraphicsHandler, InputHandler, InputListener};
use lockstep_core::frame_capture::{FrameNotifier, FrameRecorder};
use lockstep_core::hardware::{CoProcessor, Hardware, Processor, RemovableMedia, SoundCore};
use lockstep_core::{ExecutionError, StateError, VirtualMachine, VmConfig, VmHandle, VmStatus};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Poll `condition` until it holds or [`TIMEOUT`] expires.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn wait_for_status(handle: &VmHandle, status: VmStatus) -> bool {
    wait_until(|| handle.status() == status)
}

#[derive(Default)]
pub struct CpuTally {
    pub executed: AtomicI64,
    pub execute_calls: AtomicU32,
    pub resets: AtomicU32,
    pub saves: AtomicU32,
    pub loads: AtomicU32,
    pub vblank_starts: AtomicU32,
    pub vblank_ends: AtomicU32,
    pub idle: AtomicBool,
    /// Stop once `executed` reaches this value. Negative when unset.
    pub break_at: AtomicI64,
    pub breaking: AtomicBool,
    pub breakpoints_skipped: AtomicU32,
    pub fail_execute: AtomicBool,
    pub fail_load: AtomicBool,
    pub media: Mutex<Option<Weak<dyn RemovableMedia>>>,
}

impl CpuTally {
    pub fn new() -> Arc<Self> {
        let tally = Self::default();
        tally.break_at.store(-1, Ordering::Relaxed);
        Arc::new(tally)
    }

    pub fn executed(&self) -> i64 {
        self.executed.load(Ordering::Acquire)
    }

    /// Every processor-method count the orchestrator can drive.
    pub fn activity(&self) -> [u32; 4] {
        [
            self.execute_calls.load(Ordering::Acquire),
            self.resets.load(Ordering::Acquire),
            self.saves.load(Ordering::Acquire),
            self.loads.load(Ordering::Acquire),
        ]
    }

    pub fn media_label(&self) -> Option<String> {
        let media = self.media.lock().unwrap();
        media
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|media| media.label().to_owned())
    }
}

pub struct MockCpu {
    name: &'static str,
    tally: Arc<CpuTally>,
    memory: Vec<u8>,
    listeners: Vec<Arc<dyn InputListener>>,
}

impl MockCpu {
    pub fn new(name: &'static str, tally: Arc<CpuTally>) -> Self {
        Self {
            name,
            tally,
            memory: vec![0; 64],
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn InputListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl Processor for MockCpu {
    fn execute(&mut self, ticks: i32) -> Result<i32, ExecutionError> {
        self.tally.execute_calls.fetch_add(1, Ordering::AcqRel);
        if self.tally.fail_execute.load(Ordering::Acquire) {
            return Err(ExecutionError::new(self.name, "invalid opcode"));
        }
        if self.tally.idle.load(Ordering::Acquire) {
            return Ok(0);
        }

        let executed = self.tally.executed();
        let mut ran = ticks;
        let break_at = self.tally.break_at.load(Ordering::Acquire);
        if break_at >= 0 && executed + i64::from(ticks) >= break_at {
            ran = (break_at - executed) as i32;
            self.tally.break_at.store(-1, Ordering::Release);
            self.tally.breaking.store(true, Ordering::Release);
        }
        self.tally.executed.fetch_add(i64::from(ran), Ordering::AcqRel);
        Ok(ran)
    }

    fn is_idle(&self) -> bool {
        self.tally.idle.load(Ordering::Acquire)
    }

    fn must_break(&self) -> bool {
        self.tally.breaking.load(Ordering::Acquire)
    }

    fn disable_breakpoints_once(&mut self) {
        if self.tally.breaking.swap(false, Ordering::AcqRel) {
            self.tally.breakpoints_skipped.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn reset(&mut self) {
        self.tally.resets.fetch_add(1, Ordering::AcqRel);
    }

    fn count_ticks(&mut self, _ticks: i32) {}

    fn notify_vblank_start(&mut self) {
        self.tally.vblank_starts.fetch_add(1, Ordering::AcqRel);
    }

    fn notify_vblank_end(&mut self) {
        self.tally.vblank_ends.fetch_add(1, Ordering::AcqRel);
    }

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError> {
        self.tally.saves.fetch_add(1, Ordering::AcqRel);
        let data = SectionWriter::new()
            .write_u64(self.tally.executed() as u64)
            .write_blob(&self.memory)?
            .finish();
        archive.insert(self.name, data)
    }

    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError> {
        self.tally.loads.fetch_add(1, Ordering::AcqRel);
        if self.tally.fail_load.load(Ordering::Acquire) {
            return Err(StateError::Corrupt {
                section: self.name.to_owned(),
                reason: "rejected by test",
            });
        }
        let mut reader = SectionReader::new(self.name, archive.read_section(self.name)?);
        let executed = reader.read_u64()?;
        self.memory = reader.read_blob()?.to_vec();
        reader.finish()?;
        self.tally.executed.store(executed as i64, Ordering::Release);
        Ok(())
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn input_listeners(&self) -> Vec<Arc<dyn InputListener>> {
        self.listeners.clone()
    }

    fn set_removable_media(&mut self, media: Option<Weak<dyn RemovableMedia>>) {
        *self.tally.media.lock().unwrap() = media;
    }
}

pub struct NullVu;

impl CoProcessor for NullVu {
    fn execute(&mut self, _ticks: i32) {}
}

pub struct Tone {
    pub value: i16,
    pub enabled: bool,
}

impl SoundCore for Tone {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn render(&mut self, samples: &mut [i16], _sample_rate: u32) {
        samples.fill(self.value);
    }
}

pub struct Disc(pub &'static str);

impl RemovableMedia for Disc {
    fn label(&self) -> &str {
        self.0
    }

    fn read_sector(&self, _sector: u64, buf: &mut [u8]) -> std::io::Result<()> {
        buf.fill(0);
        Ok(())
    }
}

#[derive(Default)]
pub struct GsTally {
    pub built: AtomicU32,
    pub initialized: AtomicU32,
    pub released: AtomicU32,
    pub resets: AtomicU32,
    pub loads: AtomicU32,
    pub vblank_set: AtomicU32,
    pub vblank_reset: AtomicU32,
    pub fail_load: AtomicBool,
    pub loaded: Mutex<Vec<u8>>,
    pub notifier: Mutex<Option<FrameNotifier>>,
    pub recording: AtomicBool,
}

/// Graphics handler that draws one packet and finishes one frame per vblank.
pub struct MockGs {
    tally: Arc<GsTally>,
    frames: Option<FrameNotifier>,
    recorder: Option<FrameRecorder>,
    memory: Vec<u8>,
    frame: u32,
}

impl MockGs {
    pub fn factory(
        tally: &Arc<GsTally>,
    ) -> impl FnOnce() -> Box<dyn GraphicsHandler> + Send + 'static {
        let tally = Arc::clone(tally);
        move || -> Box<dyn GraphicsHandler> {
            tally.built.fetch_add(1, Ordering::AcqRel);
            Box::new(MockGs {
                tally,
                frames: None,
                recorder: None,
                memory: vec![0x5A; 16],
                frame: 0,
            })
        }
    }
}

impl GraphicsHandler for MockGs {
    fn initialize(&mut self, frames: FrameNotifier) {
        self.tally.initialized.fetch_add(1, Ordering::AcqRel);
        *self.tally.notifier.lock().unwrap() = Some(frames.clone());
        self.frames = Some(frames);
    }

    fn release(&mut self) {
        self.tally.released.fetch_add(1, Ordering::AcqRel);
    }

    fn reset(&mut self) {
        self.tally.resets.fetch_add(1, Ordering::AcqRel);
    }

    fn set_vblank(&mut self) {
        self.tally.vblank_set.fetch_add(1, Ordering::AcqRel);
        self.frame += 1;
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.frame.to_le_bytes());
        }
        if let Some(frames) = &self.frames {
            frames.notify_new_frame();
        }
    }

    fn reset_vblank(&mut self) {
        self.tally.vblank_reset.fetch_add(1, Ordering::AcqRel);
    }

    fn save_state(&self, archive: &mut ArchiveWriter) -> Result<(), StateError> {
        archive.insert("graphics", self.memory.clone())
    }

    fn load_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError> {
        self.tally.loads.fetch_add(1, Ordering::AcqRel);
        if self.tally.fail_load.load(Ordering::Acquire) {
            return Err(StateError::MissingSection("graphics".to_owned()));
        }
        self.memory = archive.read_section("graphics")?.to_vec();
        *self.tally.loaded.lock().unwrap() = self.memory.clone();
        Ok(())
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn registers(&self) -> &[u64] {
        &[0x1234, 0x5678]
    }

    fn set_frame_recorder(&mut self, recorder: Option<FrameRecorder>) {
        self.tally
            .recording
            .store(recorder.is_some(), Ordering::Release);
        self.recorder = recorder;
    }
}

#[derive(Default)]
pub struct PadTally {
    pub built: AtomicU32,
    pub updates: AtomicU32,
    pub cleared: AtomicU32,
    pub listeners: AtomicUsize,
    pub memory_len: AtomicUsize,
}

pub struct MockPad {
    tally: Arc<PadTally>,
    listeners: Vec<Arc<dyn InputListener>>,
}

impl MockPad {
    pub fn factory(
        tally: &Arc<PadTally>,
    ) -> impl FnOnce() -> Box<dyn InputHandler> + Send + 'static {
        let tally = Arc::clone(tally);
        move || -> Box<dyn InputHandler> {
            tally.built.fetch_add(1, Ordering::AcqRel);
            Box::new(MockPad {
                tally,
                listeners: Vec::new(),
            })
        }
    }
}

impl InputHandler for MockPad {
    fn update(&mut self, memory: &mut [u8]) {
        self.tally.updates.fetch_add(1, Ordering::AcqRel);
        self.tally.memory_len.store(memory.len(), Ordering::Release);
        for listener in &self.listeners {
            listener.set_button_state(0, 0, true);
        }
    }

    fn remove_all_listeners(&mut self) {
        self.tally.cleared.fetch_add(1, Ordering::AcqRel);
        self.listeners.clear();
        self.tally.listeners.store(0, Ordering::Release);
    }

    fn insert_listener(&mut self, listener: Arc<dyn InputListener>) {
        self.listeners.push(listener);
        self.tally
            .listeners
            .store(self.listeners.len(), Ordering::Release);
    }
}

#[derive(Default)]
pub struct PadModule {
    pub presses: AtomicU32,
}

impl InputListener for PadModule {
    fn set_button_state(&self, _pad: u32, _button: u32, pressed: bool) {
        if pressed {
            self.presses.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[derive(Default)]
pub struct AudioTally {
    pub built: AtomicU32,
    pub writes: AtomicU32,
    pub samples: AtomicUsize,
    pub last_sample: Mutex<Option<i16>>,
}

pub struct MockAudio {
    tally: Arc<AudioTally>,
}

impl MockAudio {
    pub fn factory(
        tally: &Arc<AudioTally>,
    ) -> impl FnOnce() -> Box<dyn AudioHandler> + Send + 'static {
        let tally = Arc::clone(tally);
        move || -> Box<dyn AudioHandler> {
            tally.built.fetch_add(1, Ordering::AcqRel);
            Box::new(MockAudio { tally })
        }
    }
}

impl AudioHandler for MockAudio {
    fn has_free_buffers(&self) -> bool {
        false
    }

    fn recycle_buffers(&mut self) {}

    fn write(&mut self, samples: &[i16], _sample_rate: u32) {
        self.tally.writes.fetch_add(1, Ordering::AcqRel);
        self.tally.samples.store(samples.len(), Ordering::Release);
        *self.tally.last_sample.lock().unwrap() = samples.last().copied();
    }
}

pub struct Rig {
    pub vm: VirtualMachine,
    pub handle: VmHandle,
    pub primary: Arc<CpuTally>,
    pub secondary: Arc<CpuTally>,
    pub pad_module: Arc<PadModule>,
}

/// An initialized, paused machine built from mocks, saving states under `dir`.
pub fn rig(dir: &Path) -> Rig {
    rig_with(VmConfig {
        state_directory: dir.to_path_buf(),
        ..VmConfig::default()
    })
}

pub fn rig_with(config: VmConfig) -> Rig {
    let (hardware, primary, secondary, pad_module) = mock_hardware();
    let mut vm = VirtualMachine::new(hardware, config);
    vm.initialize().unwrap();
    let handle = vm.handle();
    Rig {
        vm,
        handle,
        primary,
        secondary,
        pad_module,
    }
}

pub fn mock_hardware() -> (Hardware, Arc<CpuTally>, Arc<CpuTally>, Arc<PadModule>) {
    let primary = CpuTally::new();
    let secondary = CpuTally::new();
    let pad_module = Arc::new(PadModule::default());

    let hardware = Hardware {
        primary: Box::new(MockCpu::new("primary", Arc::clone(&primary))),
        secondary: Box::new(
            MockCpu::new("secondary", Arc::clone(&secondary))
                .with_listener(Arc::clone(&pad_module) as Arc<dyn InputListener>),
        ),
        vector0: Box::new(NullVu),
        vector1: Box::new(NullVu),
        sound0: Box::new(Tone {
            value: 1000,
            enabled: true,
        }),
        sound1: Box::new(Tone {
            value: 500,
            enabled: true,
        }),
    };
    (hardware, primary, secondary, pad_module)
}
