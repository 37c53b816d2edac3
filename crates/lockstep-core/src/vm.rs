use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, error, info, warn};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::audio::{AudioMixer, DEFAULT_BLOCK_COUNT, clamp_block_count};
use crate::devices::{AudioHandler, Devices, GraphicsHandler, HandlerKind, InputHandler};
use crate::error::{ExecutionError, StateError, VmError};
use crate::frame_capture::{FrameCapture, FrameDump, FrameNotifier};
use crate::hardware::{Hardware, RemovableMedia};
use crate::mailbox::Mailbox;
use crate::timing::{CpuUtilisation, SECONDARY_TICK_STEP, TICK_STEP, VblankEdge, VblankPacer};

/// How long a paused machine sleeps between mailbox checks.
const PAUSED_IDLE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Where numbered save-state slots live.
    pub state_directory: PathBuf,
    /// Sound blocks buffered before each write to the audio handler.
    pub spu_block_count: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            state_directory: PathBuf::from("states"),
            spu_block_count: DEFAULT_BLOCK_COUNT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VmStatus {
    #[default]
    Paused,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmEvent {
    /// The machine switched between paused and running.
    RunningStateChanged,
    /// Machine state changed behind the observer's back (pause, load, reset).
    MachineStateChanged,
}

/// Processors that can be single-stepped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorId {
    Primary,
    Secondary,
    Vector0,
    Vector1,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State readable from any thread without going through the mailbox.
#[derive(Default)]
struct Shared {
    status: AtomicU8,
    subscribers: Mutex<Vec<cb::Sender<VmEvent>>>,
    utilisation: Mutex<CpuUtilisation>,
    capture: FrameCapture,
}

impl Shared {
    fn status(&self) -> VmStatus {
        if self.status.load(Ordering::Acquire) == VmStatus::Running as u8 {
            VmStatus::Running
        } else {
            VmStatus::Paused
        }
    }

    fn set_status(&self, status: VmStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn emit(&self, event: VmEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event).is_ok());
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SingleStep {
    primary: bool,
    secondary: bool,
    vector0: bool,
    vector1: bool,
}

impl SingleStep {
    fn any(&self) -> bool {
        self.primary || self.secondary || self.vector0 || self.vector1
    }

    fn set(&mut self, target: ProcessorId) {
        match target {
            ProcessorId::Primary => self.primary = true,
            ProcessorId::Secondary => self.secondary = true,
            ProcessorId::Vector0 => self.vector0 = true,
            ProcessorId::Vector1 => self.vector1 = true,
        }
    }
}

/// Everything the emulation thread owns. Only mailbox calls touch it.
pub(crate) struct VmCore {
    hardware: Hardware,
    devices: Devices,
    shared: Arc<Shared>,
    media: Option<Arc<dyn RemovableMedia>>,
    pacer: VblankPacer,
    mixer: AudioMixer,
    primary_ticks: i32,
    secondary_ticks: i32,
    single_step: SingleStep,
    utilisation: CpuUtilisation,
    frame_notifier: FrameNotifier,
    frame_events: cb::Receiver<()>,
    end: bool,
}

impl VmCore {
    fn new(hardware: Hardware, shared: Arc<Shared>, spu_block_count: usize) -> Self {
        let (frame_notifier, frame_events) = FrameNotifier::channel();
        let mut core = Self {
            hardware,
            devices: Devices::default(),
            shared,
            media: None,
            pacer: VblankPacer::default(),
            mixer: AudioMixer::new(spu_block_count),
            primary_ticks: 0,
            secondary_ticks: 0,
            single_step: SingleStep::default(),
            utilisation: CpuUtilisation::default(),
            frame_notifier,
            frame_events,
            end: false,
        };
        core.reset_vm();
        core
    }

    fn run(&mut self, mailbox: &Mailbox<VmCore>) -> Result<(), ExecutionError> {
        info!("VM: emulation thread started");
        loop {
            while mailbox.is_pending() {
                mailbox.receive_call(self);
            }
            self.drain_frame_events();
            if self.end {
                break;
            }
            if self.shared.status() == VmStatus::Paused {
                mailbox.wait_for_call_timeout(PAUSED_IDLE);
                continue;
            }
            self.run_iteration()?;
        }
        info!("VM: emulation thread stopped");
        Ok(())
    }

    /// Advance the machine by one scheduler quantum.
    fn run_iteration(&mut self) -> Result<(), ExecutionError> {
        if self.mixer.is_due() {
            let audio = self
                .devices
                .audio
                .get_mut()
                .map(|audio| audio as &mut dyn AudioHandler);
            self.mixer.update(
                &mut *self.hardware.sound0,
                &mut *self.hardware.sound1,
                audio,
            );
        }

        if let Some(edge) = self.pacer.poll() {
            self.on_vblank_edge(edge);
        }

        self.primary_ticks += TICK_STEP;
        self.secondary_ticks += SECONDARY_TICK_STEP;
        self.update_primary()?;
        self.update_secondary()?;

        if self.hardware.must_break() || self.single_step.any() {
            debug!("VM: paused on breakpoint or single step");
            self.shared.set_status(VmStatus::Paused);
            self.single_step = SingleStep::default();
            self.shared.emit(VmEvent::RunningStateChanged);
            self.shared.emit(VmEvent::MachineStateChanged);
        }
        Ok(())
    }

    fn update_primary(&mut self) -> Result<(), ExecutionError> {
        let hw = &mut self.hardware;
        while self.primary_ticks > 0 {
            let budget = if self.single_step.primary {
                1
            } else {
                self.primary_ticks
            };
            let mut executed = hw.primary.execute(budget)?;
            if hw.primary.is_idle() {
                self.utilisation.primary_idle_ticks += i64::from(self.primary_ticks - executed);
                executed = self.primary_ticks;
            }
            self.utilisation.primary_total_ticks += i64::from(executed);

            hw.vector0
                .execute(if self.single_step.vector0 { 1 } else { executed });
            hw.vector1
                .execute(if self.single_step.vector1 { 1 } else { executed });

            self.primary_ticks -= executed;
            hw.primary.count_ticks(executed);
            self.pacer.consume(executed);

            if self.single_step.primary || hw.primary.must_break() {
                break;
            }
        }
        Ok(())
    }

    fn update_secondary(&mut self) -> Result<(), ExecutionError> {
        let hw = &mut self.hardware;
        while self.secondary_ticks > 0 {
            let budget = if self.single_step.secondary {
                1
            } else {
                self.secondary_ticks
            };
            let mut executed = hw.secondary.execute(budget)?;
            if hw.secondary.is_idle() {
                self.utilisation.secondary_idle_ticks +=
                    i64::from(self.secondary_ticks - executed);
                executed = self.secondary_ticks;
            }
            self.utilisation.secondary_total_ticks += i64::from(executed);

            self.secondary_ticks -= executed;
            self.mixer.consume(executed);
            hw.secondary.count_ticks(executed);

            if self.single_step.secondary || hw.secondary.must_break() {
                break;
            }
        }
        Ok(())
    }

    fn on_vblank_edge(&mut self, edge: VblankEdge) {
        match edge {
            VblankEdge::Start => {
                self.hardware.primary.notify_vblank_start();
                self.hardware.secondary.notify_vblank_start();
                if let Some(gs) = self.devices.graphics.get_mut() {
                    gs.set_vblank();
                }
                if let Some(input) = self.devices.input.get_mut() {
                    input.update(self.hardware.primary.memory_mut());
                }
                *lock(&self.shared.utilisation) = std::mem::take(&mut self.utilisation);
            }
            VblankEdge::End => {
                self.hardware.primary.notify_vblank_end();
                self.hardware.secondary.notify_vblank_end();
                if let Some(gs) = self.devices.graphics.get_mut() {
                    gs.reset_vblank();
                }
            }
        }
    }

    fn drain_frame_events(&mut self) {
        while self.frame_events.try_recv().is_ok() {
            if let Some(gs) = self.devices.graphics.get_mut() {
                self.shared.capture.on_new_frame(gs);
            }
        }
    }

    fn pause(&mut self) {
        self.shared.set_status(VmStatus::Paused);
    }

    fn resume(&mut self) {
        self.hardware.disable_breakpoints_once();
        self.shared.set_status(VmStatus::Running);
    }

    fn step(&mut self, target: ProcessorId) {
        if self.shared.status() == VmStatus::Running {
            return;
        }
        self.single_step.set(target);
        self.resume();
    }

    fn reset(&mut self) {
        if self.shared.status() == VmStatus::Running {
            warn!("VM: reset ignored while running");
            return;
        }
        self.reset_vm();
        info!("VM: machine reset");
        self.shared.emit(VmEvent::MachineStateChanged);
    }

    fn reset_vm(&mut self) {
        self.hardware.reset();
        if let Some(gs) = self.devices.graphics.get_mut() {
            gs.reset();
        }
        self.hardware.set_removable_media(self.media.as_ref());

        self.pacer.reset();
        self.primary_ticks = 0;
        self.secondary_ticks = 0;
        self.mixer.reset();
        self.utilisation = CpuUtilisation::default();

        self.register_input_listeners();
    }

    fn register_input_listeners(&mut self) {
        let Some(input) = self.devices.input.get_mut() else {
            return;
        };
        input.remove_all_listeners();
        for listener in self.hardware.input_listeners() {
            input.insert_listener(listener);
        }
    }

    fn attach_graphics(&mut self, factory: impl FnOnce() -> Box<dyn GraphicsHandler>) {
        let frames = self.frame_notifier.clone();
        if let Some(gs) = self.devices.graphics.attach(factory) {
            gs.initialize(frames);
            info!("VM: graphics handler attached");
        }
    }

    fn attach_input(&mut self, factory: impl FnOnce() -> Box<dyn InputHandler>) {
        if self.devices.input.attach(factory).is_some() {
            self.register_input_listeners();
            info!("VM: input handler attached");
        }
    }

    fn attach_audio(&mut self, factory: impl FnOnce() -> Box<dyn AudioHandler>) {
        if self.devices.audio.attach(factory).is_some() {
            info!("VM: audio handler attached");
        }
    }

    fn detach(&mut self, kind: HandlerKind) {
        if self.devices.detach(kind) && kind == HandlerKind::Graphics {
            self.shared.capture.abandon_recording();
        }
    }

    fn save_state(&self, path: &Path) -> bool {
        let Some(gs) = self.devices.graphics.get() else {
            warn!("VM: no graphics handler attached, cannot save state");
            return false;
        };
        match self.write_state(gs, path) {
            Ok(()) => {
                info!("VM: state saved to {}", path.display());
                true
            }
            Err(err) => {
                warn!("VM: failed to save state to {}: {err}", path.display());
                false
            }
        }
    }

    fn write_state(&self, gs: &dyn GraphicsHandler, path: &Path) -> Result<(), StateError> {
        let mut archive = ArchiveWriter::new();
        self.hardware.primary.save_state(&mut archive)?;
        self.hardware.secondary.save_state(&mut archive)?;
        gs.save_state(&mut archive)?;
        archive.write_atomic(path)
    }

    fn load_state(&mut self, path: &Path) -> bool {
        if !self.devices.graphics.is_attached() {
            warn!("VM: no graphics handler attached, cannot load state");
            return false;
        }
        let mut archive = match ArchiveReader::open(path) {
            Ok(archive) => archive,
            Err(err) => {
                warn!("VM: failed to open state {}: {err}", path.display());
                return false;
            }
        };

        if let Err(err) = self.apply_state(&mut archive) {
            error!(
                "VM: state {} was only partially applied, pausing: {err}",
                path.display()
            );
            let was_running = self.shared.status() == VmStatus::Running;
            self.pause();
            if was_running {
                self.shared.emit(VmEvent::RunningStateChanged);
            }
            return false;
        }

        info!("VM: state loaded from {}", path.display());
        self.shared.emit(VmEvent::MachineStateChanged);
        true
    }

    fn apply_state(&mut self, archive: &mut ArchiveReader) -> Result<(), StateError> {
        self.hardware.primary.load_state(archive)?;
        self.hardware.secondary.load_state(archive)?;
        if let Some(gs) = self.devices.graphics.get_mut() {
            gs.load_state(archive)?;
        }
        Ok(())
    }

    fn mount_media(&mut self, media: Arc<dyn RemovableMedia>) {
        info!("VM: mounted media `{}`", media.label());
        self.media = Some(media);
        self.hardware.set_removable_media(self.media.as_ref());
    }

    fn eject_media(&mut self) {
        self.hardware.set_removable_media(None);
        if let Some(media) = self.media.take() {
            info!("VM: ejected media `{}`", media.label());
        }
    }

    fn terminate(&mut self) {
        self.devices.detach_all();
        self.end = true;
    }

    /// Tear down whatever the loop left attached and hand the hardware back.
    fn shut_down(mut self) -> Hardware {
        self.devices.detach_all();
        self.shared.capture.abandon_recording();
        self.eject_media();
        self.hardware
    }
}

/// Marks the mailbox defunct when the emulation thread exits, panics included.
struct ReleaseOnExit<'a>(&'a Mailbox<VmCore>);

impl Drop for ReleaseOnExit<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

type ThreadOutcome = (Hardware, Result<(), ExecutionError>);

/// Owns the emulation thread.
///
/// The hardware is moved onto the thread by [`VirtualMachine::initialize`] and
/// handed back by [`VirtualMachine::destroy`]. Everything else goes through a
/// [`VmHandle`].
pub struct VirtualMachine {
    config: VmConfig,
    hardware: Option<Hardware>,
    mailbox: Arc<Mailbox<VmCore>>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<ThreadOutcome>>,
}

impl VirtualMachine {
    pub fn new(hardware: Hardware, mut config: VmConfig) -> Self {
        config.spu_block_count = clamp_block_count(config.spu_block_count);
        if let Err(err) = fs::create_dir_all(&config.state_directory) {
            warn!(
                "VM: failed to create state directory {}: {err}",
                config.state_directory.display()
            );
        }

        let mailbox = Arc::new(Mailbox::new());
        // Nothing consumes calls until the thread is up.
        mailbox.release();

        Self {
            config,
            hardware: Some(hardware),
            mailbox,
            shared: Arc::new(Shared::default()),
            thread: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// `<state directory>/<executable>.st<slot>.zip`
    pub fn state_path(&self, executable: &str, slot: u32) -> PathBuf {
        self.config
            .state_directory
            .join(format!("{executable}.st{slot}.zip"))
    }

    /// The hardware, while the emulation thread is not running.
    pub fn hardware(&self) -> Option<&Hardware> {
        self.hardware.as_ref()
    }

    pub fn hardware_mut(&mut self) -> Option<&mut Hardware> {
        self.hardware.as_mut()
    }

    pub fn is_initialized(&self) -> bool {
        self.thread.is_some()
    }

    pub fn handle(&self) -> VmHandle {
        VmHandle {
            mailbox: Arc::clone(&self.mailbox),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Reset the machine and start the emulation thread, paused.
    pub fn initialize(&mut self) -> Result<(), VmError> {
        if self.thread.is_some() {
            return Err(VmError::AlreadyRunning);
        }
        // Only a panicked thread leaves us without hardware.
        let hardware = self.hardware.take().ok_or(VmError::ThreadPanicked)?;

        self.shared.set_status(VmStatus::Paused);
        self.mailbox.reset();

        let mailbox = Arc::clone(&self.mailbox);
        let shared = Arc::clone(&self.shared);
        let block_count = self.config.spu_block_count;
        let thread = thread::Builder::new()
            .name("lockstep-vm".into())
            .spawn(move || {
                let _release = ReleaseOnExit(&mailbox);
                let mut core = VmCore::new(hardware, shared, block_count);
                let result = core.run(&mailbox);
                if let Err(err) = &result {
                    error!("VM: emulation stopped on a fatal error: {err}");
                    core.shared.set_status(VmStatus::Paused);
                    core.shared.emit(VmEvent::RunningStateChanged);
                }
                (core.shut_down(), result)
            })
            .map_err(|err| {
                self.mailbox.release();
                VmError::Spawn(err)
            })?;

        self.thread = Some(thread);
        // The thread resets the machine before serving its first call.
        self.mailbox.flush_calls();
        Ok(())
    }

    /// Detach every handler, stop the thread and take the hardware back.
    ///
    /// Returns the fatal error that ended emulation early, if any.
    pub fn destroy(&mut self) -> Result<(), VmError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.mailbox.post_call(VmCore::terminate);
        match thread.join() {
            Ok((hardware, result)) => {
                self.hardware = Some(hardware);
                result.map_err(VmError::from)
            }
            Err(_) => {
                self.mailbox.release();
                Err(VmError::ThreadPanicked)
            }
        }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!("VM: {err}");
        }
    }
}

/// One-shot result of a queued save or load.
pub struct StateHandle {
    rx: cb::Receiver<bool>,
    result: Option<bool>,
}

impl StateHandle {
    fn new() -> (cb::Sender<bool>, Self) {
        let (tx, rx) = cb::bounded(1);
        (tx, Self { rx, result: None })
    }

    /// Block until the operation has run. A machine torn down before running
    /// it reports `false`.
    pub fn wait(mut self) -> bool {
        if let Some(result) = self.result {
            return result;
        }
        *self.result.insert(self.rx.recv().unwrap_or(false))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<bool> {
        if self.result.is_none() {
            self.result = match self.rx.recv_timeout(timeout) {
                Ok(result) => Some(result),
                Err(cb::RecvTimeoutError::Timeout) => None,
                Err(cb::RecvTimeoutError::Disconnected) => Some(false),
            };
        }
        self.result
    }

    pub fn try_get(&mut self) -> Option<bool> {
        if self.result.is_none() {
            self.result = match self.rx.try_recv() {
                Ok(result) => Some(result),
                Err(cb::TryRecvError::Empty) => None,
                Err(cb::TryRecvError::Disconnected) => Some(false),
            };
        }
        self.result
    }
}

/// Cloneable control surface of a [`VirtualMachine`], usable from any thread.
///
/// Every request becomes a mailbox call executed on the emulation thread.
/// Once the machine is destroyed requests are silently dropped.
#[derive(Clone)]
pub struct VmHandle {
    mailbox: Arc<Mailbox<VmCore>>,
    shared: Arc<Shared>,
}

impl VmHandle {
    pub fn status(&self) -> VmStatus {
        self.shared.status()
    }

    pub fn resume(&self) {
        if self.status() == VmStatus::Running || self.mailbox.is_released() {
            return;
        }
        self.mailbox.send_call(VmCore::resume, true, false);
        self.shared.emit(VmEvent::RunningStateChanged);
    }

    pub fn pause(&self) {
        if self.status() == VmStatus::Paused || self.mailbox.is_released() {
            return;
        }
        self.mailbox.send_call(VmCore::pause, true, false);
        self.shared.emit(VmEvent::MachineStateChanged);
        self.shared.emit(VmEvent::RunningStateChanged);
    }

    /// Reset processors, graphics and timing. Ignored while running.
    pub fn reset(&self) {
        self.mailbox.send_call(VmCore::reset, true, false);
    }

    /// Run `target` for a single tick and pause again. Ignored while running.
    pub fn step(&self, target: ProcessorId) {
        if self.status() == VmStatus::Running {
            return;
        }
        self.mailbox
            .send_call(move |core: &mut VmCore| core.step(target), true, false);
    }

    pub fn attach_graphics<F>(&self, factory: F)
    where
        F: FnOnce() -> Box<dyn GraphicsHandler> + Send + 'static,
    {
        self.mailbox
            .send_call(move |core: &mut VmCore| core.attach_graphics(factory), true, false);
    }

    pub fn attach_input<F>(&self, factory: F)
    where
        F: FnOnce() -> Box<dyn InputHandler> + Send + 'static,
    {
        self.mailbox
            .send_call(move |core: &mut VmCore| core.attach_input(factory), true, false);
    }

    pub fn attach_audio<F>(&self, factory: F)
    where
        F: FnOnce() -> Box<dyn AudioHandler> + Send + 'static,
    {
        self.mailbox
            .send_call(move |core: &mut VmCore| core.attach_audio(factory), true, false);
    }

    pub fn detach(&self, kind: HandlerKind) {
        self.mailbox
            .send_call(move |core: &mut VmCore| core.detach(kind), true, false);
    }

    /// Whether a handler occupies `kind`'s slot. `false` once destroyed.
    pub fn is_attached(&self, kind: HandlerKind) -> bool {
        self.query(move |core| core.devices.is_attached(kind))
            .unwrap_or(false)
    }

    /// Queue a save after every earlier request.
    pub fn save_state(&self, path: impl Into<PathBuf>) -> StateHandle {
        let path = path.into();
        let (tx, handle) = StateHandle::new();
        self.mailbox.post_call(move |core: &mut VmCore| {
            let _ = tx.send(core.save_state(&path));
        });
        handle
    }

    /// Queue a load after every earlier request. A load that fails half way
    /// leaves the machine paused.
    pub fn load_state(&self, path: impl Into<PathBuf>) -> StateHandle {
        let path = path.into();
        let (tx, handle) = StateHandle::new();
        self.mailbox.post_call(move |core: &mut VmCore| {
            let _ = tx.send(core.load_state(&path));
        });
        handle
    }

    /// Record the next complete frame and pass it to `callback`. Ignored while
    /// another capture is pending.
    pub fn trigger_frame_capture<F>(&self, callback: F)
    where
        F: FnOnce(FrameDump) + Send + 'static,
    {
        self.mailbox.post_call(move |core: &mut VmCore| {
            if !core.shared.capture.arm(Box::new(callback)) {
                debug!("VM: frame capture already pending");
            }
        });
    }

    pub fn reload_spu_block_count(&self, count: usize) {
        self.mailbox.post_call(move |core: &mut VmCore| {
            core.mixer.set_block_count(count);
            info!("VM: sound block count set to {}", core.mixer.block_count());
        });
    }

    pub fn mount_media(&self, media: Arc<dyn RemovableMedia>) {
        self.mailbox
            .send_call(move |core: &mut VmCore| core.mount_media(media), true, false);
    }

    pub fn eject_media(&self) {
        self.mailbox.send_call(VmCore::eject_media, true, false);
    }

    /// Counters for the last complete frame.
    pub fn cpu_utilisation(&self) -> CpuUtilisation {
        *lock(&self.shared.utilisation)
    }

    pub fn subscribe(&self) -> cb::Receiver<VmEvent> {
        let (tx, rx) = cb::unbounded();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Block until every earlier request has run.
    pub fn flush(&self) {
        self.mailbox.flush_calls();
    }

    fn query<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut VmCore) -> T + Send + 'static,
    {
        let (tx, rx) = cb::bounded(1);
        self.mailbox.send_call(
            move |core: &mut VmCore| {
                let _ = tx.send(f(core));
            },
            true,
            false,
        );
        rx.recv().ok()
    }
}
