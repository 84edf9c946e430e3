//! Audio sink, the consumed external interface AICA paces emulation
//! against (spec.md §5 "emulation is paced by the audio sink's low-water
//! mark", §6).

/// Interleaved signed 16-bit stereo frames at 44,100 Hz.
pub trait AudioSink {
    fn push(&mut self, samples: &[i16]);
    /// True when the host's playback buffer has drained enough that the
    /// core thread should run another slice before sleeping again.
    fn buffer_low(&self) -> bool;
}
