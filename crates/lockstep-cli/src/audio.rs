use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, trace, warn};
use lockstep_core::devices::AudioHandler;

use crate::audio_queue::{RingReader, RingWriter, frame_ring};

/// Plays mixed batches on the default output device.
///
/// Built by the attach factory on the emulation thread, which also keeps the
/// stream alive; the device callback only sees the reading half of the ring.
pub struct CpalAudio {
    _stream: cpal::Stream,
    ring: RingWriter,
    resampler: Resampler,
    dropped: usize,
}

impl CpalAudio {
    pub fn open() -> Option<Self> {
        let host = cpal::default_host();
        let Some(device) = host.default_output_device() else {
            warn!("No audio output device available");
            return None;
        };
        let supported = match device.default_output_config() {
            Ok(c) => c,
            Err(e) => {
                warn!("No supported output config: {e}");
                return None;
            }
        };
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let device_rate = config.sample_rate;
        let channels = usize::from(config.channels);

        // Half a second of headroom.
        let (ring, reader) = frame_ring(device_rate as usize / 2);
        let stream = match sample_format {
            cpal::SampleFormat::I16 => {
                build_stream(&device, &config, channels, reader, |s: i16| s)
            }
            cpal::SampleFormat::U16 => build_stream(&device, &config, channels, reader, |s| {
                (i32::from(s) + 32768) as u16
            }),
            cpal::SampleFormat::F32 => build_stream(&device, &config, channels, reader, |s| {
                f32::from(s) / 32768.0
            }),
            other => {
                warn!("Unsupported sample format {other:?}");
                return None;
            }
        };
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to build output stream: {e}");
                return None;
            }
        };
        if let Err(e) = stream.play() {
            warn!("Failed to start output stream: {e}");
            return None;
        }

        info!("Audio output at {device_rate} Hz, {channels} channel(s)");
        Some(Self {
            _stream: stream,
            ring,
            resampler: Resampler::new(device_rate),
            dropped: 0,
        })
    }
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut reader: RingReader,
    convert: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + Default,
    F: Fn(i16) -> T + Send + 'static,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            for frame in data.chunks_mut(channels) {
                let [left, right] = reader.next_frame();
                frame[0] = convert(left);
                if let Some(slot) = frame.get_mut(1) {
                    *slot = convert(right);
                }
                for slot in frame.iter_mut().skip(2) {
                    *slot = T::default();
                }
            }
            let missed = reader.take_underruns();
            if missed > 0 {
                trace!("Audio underrun, {missed} silent frames");
            }
        },
        |err| warn!("Audio stream error: {err}"),
        None,
    )
}

impl AudioHandler for CpalAudio {
    fn has_free_buffers(&self) -> bool {
        self.ring.free() >= self.ring.capacity() / 4
    }

    fn recycle_buffers(&mut self) {
        if self.dropped > 0 {
            debug!("Audio queue overflowed, {} frames dropped", self.dropped);
            self.dropped = 0;
        }
    }

    fn write(&mut self, samples: &[i16], sample_rate: u32) {
        let ring = &mut self.ring;
        let mut dropped = 0;
        self.resampler.run(samples, sample_rate, |left, right| {
            if !ring.write([left, right]) {
                dropped += 1;
            }
        });
        self.dropped += dropped;
    }
}

/// Stand-in used when no output device could be opened, so the mixer still
/// has somewhere to flush.
pub struct SilentAudio;

impl AudioHandler for SilentAudio {
    fn has_free_buffers(&self) -> bool {
        true
    }

    fn recycle_buffers(&mut self) {}

    fn write(&mut self, _samples: &[i16], _sample_rate: u32) {}
}

/// Nearest-neighbour rate conversion with the phase carried across batches.
struct Resampler {
    output_rate: u32,
    phase: u64,
}

impl Resampler {
    fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            phase: 0,
        }
    }

    fn run(&mut self, samples: &[i16], input_rate: u32, mut emit: impl FnMut(i16, i16)) {
        let input_rate = u64::from(input_rate.max(1));
        for frame in samples.chunks_exact(2) {
            self.phase += u64::from(self.output_rate);
            while self.phase >= input_rate {
                self.phase -= input_rate;
                emit(frame[0], frame[1]);
            }
        }
    }
}
