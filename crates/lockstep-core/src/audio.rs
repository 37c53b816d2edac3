use log::warn;

use crate::devices::AudioHandler;
use crate::hardware::SoundCore;
use crate::timing::SECONDARY_CLOCK_FREQ;

/// Output sample rate handed to the sound cores and the audio handler.
pub const DST_SAMPLE_RATE: u32 = 44_100;

/// Samples per mixed block (interleaved stereo, so half as many frames).
pub const BLOCK_SIZE: usize = 32;

/// Upper bound for the number of blocks buffered before a write.
pub const BLOCK_COUNT: usize = 400;

pub const DEFAULT_BLOCK_COUNT: usize = 100;

/// Secondary-processor ticks between two mixed blocks.
pub const SPU_UPDATE_TICKS: i32 =
    (SECONDARY_CLOCK_FREQ / DST_SAMPLE_RATE as i32) * (BLOCK_SIZE as i32 / 2);

/// Clamp a configured block count into `1..=BLOCK_COUNT`.
pub fn clamp_block_count(count: usize) -> usize {
    if count > BLOCK_COUNT {
        warn!("VM: sound block count {count} exceeds {BLOCK_COUNT}, clamping");
        BLOCK_COUNT
    } else {
        count.max(1)
    }
}

/// Mixes the two sound cores block by block and flushes a batch of blocks to
/// the audio handler once the configured count is reached.
pub struct AudioMixer {
    samples: Vec<i16>,
    cursor: usize,
    block_count: usize,
    update_ticks: i32,
}

impl AudioMixer {
    pub fn new(block_count: usize) -> Self {
        Self {
            samples: vec![0; BLOCK_SIZE * BLOCK_COUNT],
            cursor: 0,
            block_count: clamp_block_count(block_count),
            update_ticks: SPU_UPDATE_TICKS,
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Blocks mixed since the last flush.
    pub fn pending_blocks(&self) -> usize {
        self.cursor
    }

    /// Change the batch size. Blocks mixed so far are discarded.
    pub fn set_block_count(&mut self, count: usize) {
        self.cursor = 0;
        self.block_count = clamp_block_count(count);
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.update_ticks = SPU_UPDATE_TICKS;
    }

    /// Charge secondary-processor ticks against the mixing budget.
    pub fn consume(&mut self, ticks: i32) {
        self.update_ticks -= ticks;
    }

    pub fn is_due(&self) -> bool {
        self.update_ticks <= 0
    }

    /// Mix one block and recharge the budget. Returns whether a batch was
    /// flushed.
    pub fn update(
        &mut self,
        sound0: &mut dyn SoundCore,
        sound1: &mut dyn SoundCore,
        audio: Option<&mut dyn AudioHandler>,
    ) -> bool {
        self.update_ticks += SPU_UPDATE_TICKS;

        let offset = BLOCK_SIZE * self.cursor;
        let block = &mut self.samples[offset..offset + BLOCK_SIZE];
        sound0.render(block, DST_SAMPLE_RATE);

        if sound1.is_enabled() {
            let mut other = [0i16; BLOCK_SIZE];
            sound1.render(&mut other, DST_SAMPLE_RATE);
            for (sample, extra) in block.iter_mut().zip(other) {
                *sample = sample.saturating_add(extra);
            }
        }

        self.cursor += 1;
        if self.cursor < self.block_count {
            return false;
        }

        if let Some(audio) = audio {
            if audio.has_free_buffers() {
                audio.recycle_buffers();
            }
            audio.write(&self.samples[..BLOCK_SIZE * self.block_count], DST_SAMPLE_RATE);
        }
        self.cursor = 0;
        true
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_COUNT)
    }
}
