//! Feedback delay (echo) applied in place to captured buffers

use super::error::AudioError;

/// Longest echo delay accepted, in milliseconds
pub const MAX_DELAY_MS: u32 = 10_000;

/// Single-tap feedback delay on interleaved 16-bit PCM
///
/// Each output sample is `input + decay * history[cursor]`; the output is
/// written back into the history, so an impulse repeats every delay-line
/// length with amplitude `decay^k`.
///
/// `process` never allocates. `set_delay_time` may reallocate the history,
/// which is why reconfiguration belongs on a control thread.
#[derive(Debug)]
pub struct DelayEffect {
    sample_rate: u32,
    channels: u16,
    delay_ms: u32,
    decay: f32,
    history: Vec<i16>,
    cursor: usize,
}

impl DelayEffect {
    /// Create a delay line of `delay_ms` milliseconds
    ///
    /// Fails with [`AudioError::UnsupportedConfig`] above [`MAX_DELAY_MS`] and
    /// with [`AudioError::DelayLineAllocation`] if the history cannot be
    /// allocated.
    pub fn new(
        sample_rate: u32,
        channels: u16,
        delay_ms: u32,
        decay: f32,
    ) -> Result<Self, AudioError> {
        let history = allocate_history(sample_rate, channels, delay_ms)?;
        Ok(Self {
            sample_rate,
            channels,
            delay_ms,
            decay: clamp_decay(decay),
            history,
            cursor: 0,
        })
    }

    /// Apply the echo to the first `frame_count` frames of `samples`
    pub fn process(&mut self, samples: &mut [i16], frame_count: usize) {
        let len = self.history.len();
        if len == 0 {
            return;
        }

        let n = (frame_count * self.channels as usize).min(samples.len());
        let decay = self.decay;
        for sample in samples[..n].iter_mut() {
            let delayed = self.history[self.cursor] as f32 * decay;
            let mixed = (*sample as f32 + delayed)
                .round()
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            self.history[self.cursor] = mixed;
            *sample = mixed;

            self.cursor += 1;
            if self.cursor == len {
                self.cursor = 0;
            }
        }
    }

    /// Change the delay; a new line length drops the history
    ///
    /// On error the current delay line is kept.
    pub fn set_delay_time(&mut self, delay_ms: u32) -> Result<(), AudioError> {
        check_delay(delay_ms)?;
        let len = delay_line_len(self.sample_rate, self.channels, delay_ms);
        if len != self.history.len() {
            self.history = allocate_history(self.sample_rate, self.channels, delay_ms)?;
            self.cursor = 0;
        }
        self.delay_ms = delay_ms;
        Ok(())
    }

    /// Change the decay weight; applies from the next sample, unsmoothed
    pub fn set_decay_weight(&mut self, decay: f32) {
        self.decay = clamp_decay(decay);
    }

    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    pub fn decay_weight(&self) -> f32 {
        self.decay
    }

    /// Delay-line length in interleaved samples
    pub fn delay_samples(&self) -> usize {
        self.history.len()
    }
}

fn delay_line_len(sample_rate: u32, channels: u16, delay_ms: u32) -> usize {
    let frames = delay_ms as u64 * sample_rate as u64 / 1000;
    frames as usize * channels as usize
}

fn check_delay(delay_ms: u32) -> Result<(), AudioError> {
    if delay_ms > MAX_DELAY_MS {
        return Err(AudioError::UnsupportedConfig(format!(
            "Echo delay {} ms exceeds the maximum of {} ms",
            delay_ms, MAX_DELAY_MS
        )));
    }
    Ok(())
}

fn allocate_history(
    sample_rate: u32,
    channels: u16,
    delay_ms: u32,
) -> Result<Vec<i16>, AudioError> {
    check_delay(delay_ms)?;
    let len = delay_line_len(sample_rate, channels, delay_ms);
    let mut history = Vec::new();
    history
        .try_reserve_exact(len)
        .map_err(|_| AudioError::DelayLineAllocation { samples: len })?;
    history.resize(len, 0);
    Ok(history)
}

fn clamp_decay(decay: f32) -> f32 {
    if decay.is_nan() {
        0.0
    } else {
        decay.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_line_length_from_ms() {
        let delay = DelayEffect::new(48000, 1, 50, 0.5).unwrap();
        assert_eq!(delay.delay_samples(), 2400);

        let stereo = DelayEffect::new(48000, 2, 50, 0.5).unwrap();
        assert_eq!(stereo.delay_samples(), 4800);
    }

    #[test]
    fn test_zero_decay_is_identity() {
        let mut delay = DelayEffect::new(1000, 1, 3, 0.0).unwrap();
        let input: Vec<i16> = (0..64).map(|i| (i * 97 % 2001) as i16 - 1000).collect();
        let mut samples = input.clone();

        delay.process(&mut samples, 32);
        delay.process(&mut samples[32..], 32);

        assert_eq!(samples, input);
    }

    #[test]
    fn test_impulse_repeats_with_decay() {
        // 4 ms at 1 kHz -> 4-sample delay line
        let mut delay = DelayEffect::new(1000, 1, 4, 0.5).unwrap();
        let mut samples = vec![0i16; 20];
        samples[0] = 16000;

        delay.process(&mut samples, 20);

        for (i, &s) in samples.iter().enumerate() {
            let expected = if i % 4 == 0 {
                16000.0 * 0.5f32.powi((i / 4) as i32)
            } else {
                0.0
            };
            assert!(
                (s as f32 - expected).abs() <= 1.0,
                "sample {} = {}, expected {}",
                i,
                s,
                expected
            );
        }
    }

    #[test]
    fn test_echo_spans_buffers() {
        let mut delay = DelayEffect::new(1000, 1, 5, 0.5).unwrap();
        let mut first = [1000i16, 0, 0];
        let mut second = [0i16, 0, 0];
        delay.process(&mut first, 3);
        delay.process(&mut second, 3);

        // Echo of sample 0 lands at overall index 5
        assert_eq!(second, [0, 0, 500]);
    }

    #[test]
    fn test_output_saturates() {
        let mut delay = DelayEffect::new(1000, 1, 1, 1.0).unwrap();
        let mut samples = [30000i16, 30000, -30000, -30000];
        delay.process(&mut samples, 4);
        assert_eq!(samples[0], 30000);
        assert_eq!(samples[1], i16::MAX);
    }

    #[test]
    fn test_frame_count_limits_processing() {
        let mut delay = DelayEffect::new(1000, 2, 1, 1.0).unwrap();
        let mut samples = [100i16, 200, 0, 0, 0, 0];
        delay.process(&mut samples, 2);
        // Frame 1 echoes frame 0, frame 2 untouched
        assert_eq!(samples, [100, 200, 100, 200, 0, 0]);
    }

    #[test]
    fn test_set_delay_time_resets_only_on_length_change() {
        let mut delay = DelayEffect::new(1000, 1, 2, 1.0).unwrap();
        let mut samples = [500i16];
        delay.process(&mut samples, 1);

        // Same length keeps the pending echo
        delay.set_delay_time(2).unwrap();
        let mut next = [0i16, 0];
        delay.process(&mut next, 2);
        assert_eq!(next, [0, 500]);

        // New length drops it
        delay.set_delay_time(3).unwrap();
        assert_eq!(delay.delay_samples(), 3);
        let mut after = [0i16; 6];
        delay.process(&mut after, 6);
        assert!(after.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_delay_above_maximum_is_rejected() {
        assert!(matches!(
            DelayEffect::new(48000, 2, MAX_DELAY_MS + 1, 0.5),
            Err(AudioError::UnsupportedConfig(_))
        ));

        let mut delay = DelayEffect::new(48000, 2, 100, 0.5).unwrap();
        assert!(delay.set_delay_time(u32::MAX).is_err());
        // The old line survives a rejected change
        assert_eq!(delay.delay_ms(), 100);
        assert_eq!(delay.delay_samples(), 9600);

        delay.set_delay_time(MAX_DELAY_MS).unwrap();
        assert_eq!(delay.delay_samples(), 960_000);
    }

    #[test]
    fn test_zero_delay_passes_through() {
        let mut delay = DelayEffect::new(48000, 1, 0, 0.9).unwrap();
        let mut samples = [1i16, 2, 3];
        delay.process(&mut samples, 3);
        assert_eq!(samples, [1, 2, 3]);
    }

    #[test]
    fn test_decay_weight_is_clamped_and_immediate() {
        let mut delay = DelayEffect::new(1000, 1, 1, 0.5).unwrap();
        delay.set_decay_weight(3.0);
        assert_eq!(delay.decay_weight(), 1.0);
        delay.set_decay_weight(-1.0);
        assert_eq!(delay.decay_weight(), 0.0);
        delay.set_decay_weight(f32::NAN);
        assert_eq!(delay.decay_weight(), 0.0);

        let mut samples = [1000i16, 0];
        delay.set_decay_weight(0.25);
        delay.process(&mut samples, 2);
        assert_eq!(samples, [1000, 250]);
    }
}
