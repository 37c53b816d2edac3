use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Stereo frame ring shared by the emulation thread (writer) and the output
/// device callback (reader).
///
/// Frames are packed into one `AtomicU32` each, so no slot is ever read
/// half-written. The positions are free-running counters; their difference is
/// the fill level.
struct Ring {
    slots: Box<[AtomicU32]>,
    mask: usize,
    written: AtomicUsize,
    read: AtomicUsize,
}

impl Ring {
    fn queued(&self) -> usize {
        let written = self.written.load(Ordering::Acquire);
        written.wrapping_sub(self.read.load(Ordering::Acquire))
    }
}

fn pack([left, right]: [i16; 2]) -> u32 {
    (u32::from(left as u16) << 16) | u32::from(right as u16)
}

fn unpack(frame: u32) -> [i16; 2] {
    [(frame >> 16) as u16 as i16, frame as u16 as i16]
}

pub struct RingWriter {
    ring: Arc<Ring>,
}

pub struct RingReader {
    ring: Arc<Ring>,
    underruns: usize,
}

/// Build a ring holding at least `min_frames` frames (rounded up to a power
/// of two).
pub fn frame_ring(min_frames: usize) -> (RingWriter, RingReader) {
    let capacity = min_frames.max(2).next_power_of_two();
    let ring = Arc::new(Ring {
        slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
        mask: capacity - 1,
        written: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });
    (
        RingWriter {
            ring: Arc::clone(&ring),
        },
        RingReader { ring, underruns: 0 },
    )
}

impl RingWriter {
    /// Queue one frame. Returns `false`, leaving the ring untouched, when it
    /// is full.
    pub fn write(&mut self, frame: [i16; 2]) -> bool {
        let ring = &*self.ring;
        let written = ring.written.load(Ordering::Relaxed);
        if written.wrapping_sub(ring.read.load(Ordering::Acquire)) == ring.slots.len() {
            return false;
        }
        ring.slots[written & ring.mask].store(pack(frame), Ordering::Relaxed);
        ring.written.store(written.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn free(&self) -> usize {
        self.ring.slots.len() - self.ring.queued()
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }
}

impl RingReader {
    /// Next queued frame, or silence when the writer has fallen behind.
    pub fn next_frame(&mut self) -> [i16; 2] {
        let ring = &*self.ring;
        let read = ring.read.load(Ordering::Relaxed);
        if read == ring.written.load(Ordering::Acquire) {
            self.underruns += 1;
            return [0, 0];
        }
        let frame = unpack(ring.slots[read & ring.mask].load(Ordering::Relaxed));
        ring.read.store(read.wrapping_add(1), Ordering::Release);
        frame
    }

    pub fn queued(&self) -> usize {
        self.ring.queued()
    }

    /// Silent frames handed out since the last call.
    pub fn take_underruns(&mut self) -> usize {
        std::mem::take(&mut self.underruns)
    }
}
