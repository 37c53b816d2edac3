mod audio;
mod audio_queue;
mod config;
mod demo;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel as cb;
use log::{debug, error, info, warn};
use lockstep_core::archive::{SectionWriter, length_prefix};
use lockstep_core::devices::{AudioHandler, GraphicsHandler, HandlerKind, InputHandler};
use lockstep_core::frame_capture::FrameDump;
use lockstep_core::hardware::RemovableMedia;
use lockstep_core::{StateError, VirtualMachine, VmEvent, VmStatus};

use crate::audio::{CpalAudio, SilentAudio};
use crate::demo::{HeadlessGraphics, RawImage, ScriptedPad};

/// Name used for numbered save-state slots.
const EXECUTABLE: &str = "demo";

/// How long the runner waits for a save to complete.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
struct Args {
    /// Path to the runner config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long)]
    frames: Option<u64>,

    /// Number of seconds to run
    #[arg(long)]
    seconds: Option<u64>,

    /// Raw disc image to mount
    #[arg(long)]
    disc: Option<PathBuf>,

    /// Load a save state before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a save state when the run ends
    #[arg(long, conflicts_with = "slot")]
    save_state: Option<PathBuf>,

    /// Write the final save state into this numbered slot
    #[arg(long)]
    slot: Option<u32>,

    /// Capture the first full frame into this file
    #[arg(long)]
    capture_frame: Option<PathBuf>,

    /// Run without opening an audio device
    #[arg(long)]
    no_audio: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    info!("Starting lockstep");

    let source = config::locate(
        args.config.as_deref(),
        |key| std::env::var_os(key),
        Path::new("."),
    );
    let (cfg, vm_config) = match config::load(&source).and_then(|cfg| {
        let vm_config = cfg.vm_config()?;
        Ok((cfg, vm_config))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    debug!("Config {source:?} -> {cfg:?}");

    let (hardware, pad_port) = demo::hardware();
    let mut vm = VirtualMachine::new(hardware, vm_config);
    if let Err(e) = vm.initialize() {
        error!("Failed to start the virtual machine: {e}");
        return ExitCode::FAILURE;
    }
    let handle = vm.handle();
    let events = handle.subscribe();

    let frames = Arc::new(AtomicU64::new(0));
    let gs_frames = Arc::clone(&frames);
    handle.attach_graphics(move || -> Box<dyn GraphicsHandler> {
        Box::new(HeadlessGraphics::new(gs_frames))
    });
    handle.attach_input(|| -> Box<dyn InputHandler> { Box::new(ScriptedPad::default()) });
    if cfg.output.audio && !args.no_audio {
        handle.attach_audio(|| -> Box<dyn AudioHandler> {
            match CpalAudio::open() {
                Some(audio) => Box::new(audio),
                None => Box::new(SilentAudio),
            }
        });
    }

    if let Some(path) = &args.disc {
        match RawImage::open(path) {
            Ok(image) => {
                let media: Arc<dyn RemovableMedia> = Arc::new(image);
                handle.mount_media(media);
            }
            Err(e) => warn!("Failed to open disc image {}: {e}", path.display()),
        }
    }

    if let Some(path) = &args.load_state {
        if handle.load_state(path.as_path()).wait() {
            info!("Loaded state from {}", path.display());
        } else {
            error!("Failed to load state from {}", path.display());
        }
    }

    let capture = args.capture_frame.as_ref().map(|_| {
        let (tx, rx) = cb::bounded(1);
        handle.trigger_frame_capture(move |dump| {
            let _ = tx.send(dump);
        });
        rx
    });

    handle.resume();
    let started = Instant::now();
    let deadline = args.seconds.map(Duration::from_secs);
    let frame_limit = args.frames;
    if deadline.is_none() && frame_limit.is_none() {
        info!("No --frames or --seconds limit given, running for one second");
    }
    let deadline = deadline.or(frame_limit.is_none().then_some(Duration::from_secs(1)));

    loop {
        if frame_limit.is_some_and(|limit| frames.load(Ordering::Acquire) >= limit) {
            break;
        }
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if handle.status() == VmStatus::Paused {
            warn!("Machine paused itself");
            break;
        }
        match events.recv_timeout(Duration::from_millis(10)) {
            Ok(VmEvent::MachineStateChanged) => debug!("Machine state changed"),
            Ok(VmEvent::RunningStateChanged) | Err(_) => {}
        }
    }
    handle.pause();

    let elapsed = started.elapsed();
    let frame_count = frames.load(Ordering::Acquire);
    let usage = handle.cpu_utilisation();
    info!(
        "Ran {frame_count} frames in {:.2}s ({:.1} fps)",
        elapsed.as_secs_f64(),
        frame_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    info!(
        "Last frame: primary {}/{} idle, secondary {}/{} idle, pad buttons {:#x}",
        usage.primary_idle_ticks,
        usage.primary_total_ticks,
        usage.secondary_idle_ticks,
        usage.secondary_total_ticks,
        pad_port.buttons()
    );

    if let (Some(path), Some(rx)) = (&args.capture_frame, capture) {
        // The machine is paused, so a capture still recording will never finish.
        match rx.try_recv() {
            Ok(dump) => match write_frame_dump(path, &dump) {
                Ok(()) => info!(
                    "Captured frame with {} packets into {}",
                    dump.packets().len(),
                    path.display()
                ),
                Err(e) => error!("Failed to write frame dump {}: {e}", path.display()),
            },
            Err(_) => warn!("No complete frame was captured"),
        }
    }

    let save_path = args
        .save_state
        .clone()
        .or_else(|| args.slot.map(|slot| vm.state_path(EXECUTABLE, slot)));
    let mut ok = true;
    if let Some(path) = save_path {
        let mut pending = handle.save_state(path.as_path());
        match pending.wait_timeout(REQUEST_TIMEOUT) {
            Some(true) => info!("Saved state to {}", path.display()),
            Some(false) => {
                error!("Failed to save state to {}", path.display());
                ok = false;
            }
            None => {
                error!("Timed out saving state to {}", path.display());
                ok = false;
            }
        }
    }

    handle.detach(HandlerKind::Audio);
    if let Err(e) = vm.destroy() {
        error!("Virtual machine stopped with an error: {e}");
        ok = false;
    }

    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

/// Length-prefixed dump: local memory, registers, then one blob per packet.
fn write_frame_dump(path: &Path, dump: &FrameDump) -> Result<(), StateError> {
    let mut out = SectionWriter::new();
    out.write_blob(dump.initial_memory())?;
    out.write_u32(length_prefix(dump.initial_registers().len())?);
    for &register in dump.initial_registers() {
        out.write_u64(register);
    }
    out.write_u32(length_prefix(dump.packets().len())?);
    for packet in dump.packets() {
        out.write_blob(packet)?;
    }
    std::fs::write(path, out.finish())?;
    Ok(())
}
