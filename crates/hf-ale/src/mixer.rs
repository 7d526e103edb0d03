//! Mixer
//!
//! Sums layer and stinger renders into an interleaved output buffer.
//! The scratch buffer is allocated once; rendering never allocates.

use crate::source::AudioSource;

/// Summing mixer with a pre-allocated scratch buffer
#[derive(Debug)]
pub struct Mixer {
    scratch: Vec<f32>,
    channels: usize,
}

impl Mixer {
    /// Mixer for blocks of up to `max_frames` frames
    pub fn new(max_frames: usize, channels: usize) -> Self {
        let channels = channels.clamp(1, crate::MAX_CHANNELS);
        Self {
            scratch: vec![0.0; max_frames.max(1) * channels],
            channels,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Largest block rendered in one pass
    #[inline]
    pub fn max_frames(&self) -> usize {
        self.scratch.len() / self.channels
    }

    /// Render `source` and add it to `out` with a per-sample linear ramp
    /// from `gain_start` (first frame) toward `gain_end` (first frame of
    /// the next block). Returns frames rendered.
    pub fn mix_layer(
        &mut self,
        out: &mut [f32],
        source: &mut dyn AudioSource,
        gain_start: f32,
        gain_end: f32,
    ) -> usize {
        let channels = self.channels;
        let total = out.len() / channels;
        if total == 0 {
            return 0;
        }

        let step = (gain_end - gain_start) / total as f32;
        let chunk_frames = self.max_frames();
        let mut done = 0;

        while done < total {
            let frames = chunk_frames.min(total - done);
            let scratch = &mut self.scratch[..frames * channels];
            let rendered = source.render(scratch, channels);

            let dst = &mut out[done * channels..(done + rendered) * channels];
            for (i, (frame_out, frame_in)) in dst
                .chunks_exact_mut(channels)
                .zip(scratch.chunks_exact(channels))
                .enumerate()
            {
                let gain = gain_start + step * (done + i) as f32;
                for (o, s) in frame_out.iter_mut().zip(frame_in) {
                    *o += s * gain;
                }
            }

            done += rendered;
            if rendered < frames {
                break;
            }
        }

        done
    }

    /// Render `source` and add it to `out` at constant gain
    pub fn mix_stinger(
        &mut self,
        out: &mut [f32],
        source: &mut dyn AudioSource,
        gain: f32,
    ) -> usize {
        self.mix_layer(out, source, gain, gain)
    }

    /// Pull `frames` frames from a source without mixing them
    pub fn skip(&mut self, source: &mut dyn AudioSource, frames: usize) -> usize {
        let channels = self.channels;
        let chunk_frames = self.max_frames();
        let mut done = 0;

        while done < frames {
            let want = chunk_frames.min(frames - done);
            let rendered = source.render(&mut self.scratch[..want * channels], channels);
            done += rendered;
            if rendered < want {
                break;
            }
        }

        done
    }

    /// Zero an output block
    #[inline]
    pub fn clear(out: &mut [f32]) {
        out.fill(0.0);
    }
}
