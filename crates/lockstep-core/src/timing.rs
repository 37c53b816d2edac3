/// Primary processor clock, in ticks per second.
pub const PRIMARY_CLOCK_FREQ: i32 = 294_912_000;

/// The primary processor runs this many times faster than the secondary one.
pub const CLOCK_RATIO: i32 = 8;

pub const SECONDARY_CLOCK_FREQ: i32 = PRIMARY_CLOCK_FREQ / CLOCK_RATIO;

pub const FRAME_RATE: i32 = 60;

/// Primary ticks in one video frame.
pub const FRAME_TICKS: i32 = PRIMARY_CLOCK_FREQ / FRAME_RATE;

/// Primary ticks granted per scheduler iteration.
pub const TICK_STEP: i32 = 4800;

/// Secondary ticks granted per scheduler iteration.
pub const SECONDARY_TICK_STEP: i32 = TICK_STEP / CLOCK_RATIO;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VblankEdge {
    /// The beam left the visible area.
    Start,
    /// The beam re-entered the visible area.
    End,
}

/// Splits each frame into an on-screen phase (9/10 of the frame) and a
/// blanking phase (1/10).
///
/// Ticks overshooting a phase boundary are carried into the next phase so the
/// long-run frame length stays exact regardless of the execution quantum.
#[derive(Clone, Debug)]
pub struct VblankPacer {
    ticks: i32,
    in_vblank: bool,
    onscreen_ticks: i32,
    vblank_ticks: i32,
}

impl VblankPacer {
    pub fn new(frame_ticks: i32) -> Self {
        let onscreen_ticks = frame_ticks * 9 / 10;
        Self {
            ticks: onscreen_ticks,
            in_vblank: false,
            onscreen_ticks,
            vblank_ticks: frame_ticks / 10,
        }
    }

    /// Back to the start of the on-screen phase.
    pub fn reset(&mut self) {
        self.ticks = self.onscreen_ticks;
        self.in_vblank = false;
    }

    pub fn consume(&mut self, ticks: i32) {
        self.ticks -= ticks;
    }

    /// Cross the pending phase boundary, if the current phase has run out.
    pub fn poll(&mut self) -> Option<VblankEdge> {
        if self.ticks > 0 {
            return None;
        }
        self.in_vblank = !self.in_vblank;
        if self.in_vblank {
            self.ticks += self.vblank_ticks;
            Some(VblankEdge::Start)
        } else {
            self.ticks += self.onscreen_ticks;
            Some(VblankEdge::End)
        }
    }

    pub fn in_vblank(&self) -> bool {
        self.in_vblank
    }

    /// Ticks left in the current phase.
    pub fn remaining(&self) -> i32 {
        self.ticks
    }
}

impl Default for VblankPacer {
    fn default() -> Self {
        Self::new(FRAME_TICKS)
    }
}

/// Ticks executed per processor over the last complete frame, and how many of
/// those were spent idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuUtilisation {
    pub primary_total_ticks: i64,
    pub primary_idle_ticks: i64,
    pub secondary_total_ticks: i64,
    pub secondary_idle_ticks: i64,
}
