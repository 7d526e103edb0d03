//! Audio sources
//!
//! The engine never decodes or synthesizes anything: a layer or stinger is
//! backed by an opaque [`AudioSource`] that renders interleaved f32 frames.

use std::sync::Arc;

/// Opaque render handle for a layer loop or a one-shot cue
pub trait AudioSource: Send {
    /// Render up to `out.len() / channels` frames of interleaved audio.
    /// Returns the number of frames written; the rest of `out` is untouched.
    fn render(&mut self, out: &mut [f32], channels: usize) -> usize;

    /// A one-shot source that has played to its end
    fn is_finished(&self) -> bool;

    /// Return to the first frame
    fn rewind(&mut self);
}

/// Interleaved in-memory buffer, looping or one-shot
#[derive(Debug, Clone)]
pub struct BufferSource {
    samples: Arc<[f32]>,
    /// Channel count of `samples`
    channels: usize,
    /// Read position in frames
    position: usize,
    looping: bool,
}

impl BufferSource {
    pub fn new(samples: Arc<[f32]>, channels: usize, looping: bool) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            position: 0,
            looping,
        }
    }

    /// Silent buffer of `frames` frames
    pub fn silence(frames: usize, channels: usize, looping: bool) -> Self {
        let channels = channels.max(1);
        Self::new(vec![0.0; frames * channels].into(), channels, looping)
    }

    /// Length in frames
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Sample for an output channel. Mono fans out, extra output channels
    /// beyond the source reuse the last source channel.
    #[inline]
    fn sample(&self, frame: usize, out_channel: usize) -> f32 {
        let ch = out_channel.min(self.channels - 1);
        self.samples[frame * self.channels + ch]
    }
}

impl AudioSource for BufferSource {
    fn render(&mut self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.max(1);
        let wanted = out.len() / channels;
        let total = self.frames();

        if total == 0 {
            return 0;
        }

        let mut written = 0;
        while written < wanted {
            if self.position >= total {
                if self.looping {
                    self.position = 0;
                } else {
                    break;
                }
            }

            let run = (total - self.position).min(wanted - written);
            for i in 0..run {
                let frame = self.position + i;
                let base = (written + i) * channels;
                for ch in 0..channels {
                    out[base + ch] = self.sample(frame, ch);
                }
            }
            self.position += run;
            written += run;
        }

        written
    }

    fn is_finished(&self) -> bool {
        !self.looping && self.position >= self.frames()
    }

    fn rewind(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_buffer(frames: usize) -> Arc<[f32]> {
        (0..frames).map(|i| i as f32).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_one_shot_finishes() {
        let mut source = BufferSource::new(ramp_buffer(4), 1, false);
        let mut out = [9.0f32; 6];

        let written = source.render(&mut out, 1);
        assert_eq!(written, 4);
        assert_eq!(&out[..4], &[0.0, 1.0, 2.0, 3.0]);
        // Untouched tail
        assert_eq!(out[4], 9.0);
        assert!(source.is_finished());
    }

    #[test]
    fn test_loop_wraps() {
        let mut source = BufferSource::new(ramp_buffer(3), 1, true);
        let mut out = [0.0f32; 7];

        assert_eq!(source.render(&mut out, 1), 7);
        assert_eq!(out, [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0]);
        assert!(!source.is_finished());
    }

    #[test]
    fn test_mono_fans_out_to_stereo() {
        let mut source = BufferSource::new(ramp_buffer(2), 1, false);
        let mut out = [0.0f32; 4];

        assert_eq!(source.render(&mut out, 2), 2);
        assert_eq!(out, [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_rewind() {
        let mut source = BufferSource::new(ramp_buffer(2), 1, false);
        let mut out = [0.0f32; 2];
        source.render(&mut out, 1);
        assert!(source.is_finished());

        source.rewind();
        assert!(!source.is_finished());
        assert_eq!(source.position(), 0);
    }
}
