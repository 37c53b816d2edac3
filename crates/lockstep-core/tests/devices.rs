//! Handler slots, media and frame capture wired through a running machine.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{
    AudioTally, Disc, GsTally, MockAudio, MockGs, MockPad, PadTally, TIMEOUT, rig, wait_until,
};
use crossbeam_channel as cb;
use lockstep_core::audio::BLOCK_SIZE;
use lockstep_core::devices::HandlerKind;
use lockstep_core::hardware::RemovableMedia;
use lockstep_core::{VmConfig, VmStatus};

#[test]
fn attach_is_idempotent_and_detach_releases() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path());
    let gs = Arc::new(GsTally::default());

    rig.handle.attach_graphics(MockGs::factory(&gs));
    rig.handle.attach_graphics(MockGs::factory(&gs));
    assert_eq!(gs.built.load(Ordering::Acquire), 1);
    assert_eq!(gs.initialized.load(Ordering::Acquire), 1);

    rig.handle.detach(HandlerKind::Graphics);
    rig.handle.detach(HandlerKind::Graphics);
    assert_eq!(gs.released.load(Ordering::Acquire), 1);
    assert!(!rig.handle.is_attached(HandlerKind::Graphics));

    rig.handle.attach_graphics(MockGs::factory(&gs));
    assert_eq!(gs.built.load(Ordering::Acquire), 2);
    assert!(rig.handle.is_attached(HandlerKind::Graphics));
    rig.vm.destroy().unwrap();
}

#[test]
fn graphics_follows_vblank_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path());
    let gs = Arc::new(GsTally::default());
    rig.handle.attach_graphics(MockGs::factory(&gs));

    rig.handle.resume();
    assert!(wait_until(|| gs.vblank_reset.load(Ordering::Acquire) >= 2));
    rig.handle.pause();
    let set = gs.vblank_set.load(Ordering::Acquire);
    let reset = gs.vblank_reset.load(Ordering::Acquire);
    assert!(set == reset || set == reset + 1);

    rig.handle.reset();
    assert_eq!(gs.resets.load(Ordering::Acquire), 1);
    rig.vm.destroy().unwrap();
}

#[test]
fn input_handler_gets_listeners_and_samples_at_vblank() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path());
    let pad = Arc::new(PadTally::default());

    rig.handle.attach_input(MockPad::factory(&pad));
    rig.handle.attach_input(MockPad::factory(&pad));
    assert_eq!(pad.built.load(Ordering::Acquire), 1);
    assert_eq!(pad.listeners.load(Ordering::Acquire), 1);

    rig.handle.resume();
    assert!(wait_until(|| pad.updates.load(Ordering::Acquire) > 0));
    rig.handle.pause();
    assert_eq!(pad.memory_len.load(Ordering::Acquire), 64);
    assert!(rig.pad_module.presses.load(Ordering::Acquire) > 0);

    // Reset re-registers listeners instead of accumulating them.
    rig.handle.reset();
    assert_eq!(pad.listeners.load(Ordering::Acquire), 1);
    assert_eq!(pad.cleared.load(Ordering::Acquire), 2);
    rig.vm.destroy().unwrap();
}

#[test]
fn audio_receives_mixed_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = common::rig_with(VmConfig {
        state_directory: dir.path().to_path_buf(),
        spu_block_count: 4,
    });
    let audio = Arc::new(AudioTally::default());
    rig.handle.attach_audio(MockAudio::factory(&audio));
    rig.handle.attach_audio(MockAudio::factory(&audio));
    assert_eq!(audio.built.load(Ordering::Acquire), 1);

    rig.handle.resume();
    assert!(wait_until(|| audio.writes.load(Ordering::Acquire) > 0));
    rig.handle.pause();
    assert_eq!(audio.samples.load(Ordering::Acquire), 4 * BLOCK_SIZE);
    assert_eq!(*audio.last_sample.lock().unwrap(), Some(1500));

    rig.handle.reload_spu_block_count(2);
    rig.handle.resume();
    assert!(wait_until(|| audio.samples.load(Ordering::Acquire) == 2 * BLOCK_SIZE));
    rig.handle.detach(HandlerKind::Audio);
    assert!(!rig.handle.is_attached(HandlerKind::Audio));
    rig.vm.destroy().unwrap();
}

#[test]
fn media_is_shared_through_weak_references() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path());

    let disc: Arc<dyn RemovableMedia> = Arc::new(Disc("SLUS-00001"));
    rig.handle.mount_media(Arc::clone(&disc));
    assert_eq!(rig.primary.media_label().as_deref(), Some("SLUS-00001"));
    assert_eq!(rig.secondary.media_label().as_deref(), Some("SLUS-00001"));

    rig.handle.reset();
    assert_eq!(rig.secondary.media_label().as_deref(), Some("SLUS-00001"));

    rig.handle.eject_media();
    assert_eq!(rig.secondary.media_label(), None);
    assert_eq!(Arc::strong_count(&disc), 1);

    rig.handle.mount_media(Arc::new(Disc("SCES-00002")));
    rig.vm.destroy().unwrap();
    assert_eq!(rig.secondary.media_label(), None);
}

#[test]
fn frame_capture_records_the_next_full_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path());
    let gs = Arc::new(GsTally::default());
    rig.handle.attach_graphics(MockGs::factory(&gs));

    let (tx, rx) = cb::bounded(1);
    rig.handle.trigger_frame_capture(move |dump| {
        let _ = tx.send(dump);
    });
    rig.handle
        .trigger_frame_capture(|_| panic!("second capture must be ignored"));
    rig.handle.resume();

    let dump = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(dump.initial_memory(), &[0x5A; 16][..]);
    assert_eq!(dump.initial_registers(), &[0x1234, 0x5678]);
    assert_eq!(dump.packets().len(), 1);
    assert!(wait_until(|| !gs.recording.load(Ordering::Acquire)));

    rig.handle.pause();
    assert_eq!(rig.handle.status(), VmStatus::Paused);
    rig.vm.destroy().unwrap();
}
