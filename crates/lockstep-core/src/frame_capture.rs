use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel as cb;
use log::debug;

use crate::devices::GraphicsHandler;

/// Everything needed to replay one frame: the graphics memory and registers
/// at the start of the frame, followed by every packet submitted during it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDump {
    initial_memory: Vec<u8>,
    initial_registers: Vec<u64>,
    packets: Vec<Vec<u8>>,
}

impl FrameDump {
    pub fn new(initial_memory: Vec<u8>, initial_registers: Vec<u64>) -> Self {
        Self {
            initial_memory,
            initial_registers,
            packets: Vec::new(),
        }
    }

    pub fn initial_memory(&self) -> &[u8] {
        &self.initial_memory
    }

    pub fn initial_registers(&self) -> &[u64] {
        &self.initial_registers
    }

    pub fn packets(&self) -> &[Vec<u8>] {
        &self.packets
    }

    pub fn record(&mut self, packet: &[u8]) {
        self.packets.push(packet.to_vec());
    }
}

pub type FrameCaptureCallback = Box<dyn FnOnce(FrameDump) + Send>;

#[derive(Default)]
struct CaptureState {
    callback: Option<FrameCaptureCallback>,
    /// Present while a frame is being recorded.
    dump: Option<FrameDump>,
}

fn lock(state: &Mutex<CaptureState>) -> MutexGuard<'_, CaptureState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handed to the graphics handler while a capture is recording. May be used
/// from any thread.
#[derive(Clone)]
pub struct FrameRecorder {
    state: Arc<Mutex<CaptureState>>,
}

impl FrameRecorder {
    pub fn record(&self, packet: &[u8]) {
        if let Some(dump) = lock(&self.state).dump.as_mut() {
            dump.record(packet);
        }
    }
}

/// Lets a graphics handler report finished frames, possibly from its own
/// thread. The emulation thread picks the reports up once per iteration.
#[derive(Clone)]
pub struct FrameNotifier {
    tx: cb::Sender<()>,
}

impl FrameNotifier {
    pub(crate) fn channel() -> (Self, cb::Receiver<()>) {
        let (tx, rx) = cb::unbounded();
        (Self { tx }, rx)
    }

    pub fn notify_new_frame(&self) {
        let _ = self.tx.send(());
    }
}

enum Step {
    Idle,
    Start(FrameRecorder),
    Finish(FrameCaptureCallback, FrameDump),
}

/// The frame capture buffer. Armed from the command queue, filled from the
/// graphics side; it has its own lock for that reason.
#[derive(Clone, Default)]
pub(crate) struct FrameCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FrameCapture {
    /// Arm a capture of the next full frame. Ignored while another capture
    /// is armed.
    pub(crate) fn arm(&self, callback: FrameCaptureCallback) -> bool {
        let mut state = lock(&self.state);
        if state.callback.is_some() {
            return false;
        }
        state.callback = Some(callback);
        true
    }

    pub(crate) fn on_new_frame(&self, gs: &mut dyn GraphicsHandler) {
        let step = {
            let mut state = lock(&self.state);
            match state.dump.take() {
                Some(dump) if !dump.packets.is_empty() => match state.callback.take() {
                    Some(callback) => Step::Finish(callback, dump),
                    None => Step::Idle,
                },
                Some(dump) => {
                    state.dump = Some(dump);
                    Step::Idle
                }
                None if state.callback.is_some() => {
                    state.dump = Some(FrameDump::new(
                        gs.memory().to_vec(),
                        gs.registers().to_vec(),
                    ));
                    Step::Start(FrameRecorder {
                        state: Arc::clone(&self.state),
                    })
                }
                None => Step::Idle,
            }
        };

        match step {
            Step::Idle => {}
            Step::Start(recorder) => {
                debug!("VM: frame capture started");
                gs.set_frame_recorder(Some(recorder));
            }
            Step::Finish(callback, dump) => {
                gs.set_frame_recorder(None);
                debug!(
                    "VM: frame capture finished with {} packets",
                    dump.packets.len()
                );
                callback(dump);
            }
        }
    }

    /// Drop a half-recorded frame, e.g. when the graphics handler goes away.
    /// An armed callback stays armed.
    pub(crate) fn abandon_recording(&self) {
        lock(&self.state).dump = None;
    }
}
