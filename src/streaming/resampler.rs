//! Sample-rate conversion for backends that only run at their native rate
//!
//! Linear interpolation between consecutive native frames. Phase is tracked
//! exactly in integer ticks: one input frame spans `out_rate` ticks and one
//! output frame spans `in_rate` ticks, so no drift accumulates however long
//! the preview runs. Output lags the input by one frame.

/// Streaming linear-interpolation resampler for stereo i16 frames
#[derive(Debug, Clone)]
pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
    /// Position of the next output frame past `prev`, in ticks
    phase: u64,
    prev: Option<[i16; 2]>,
}

impl LinearResampler {
    /// Create a resampler from `in_rate` to `out_rate` (both clamped to >= 1)
    pub fn new(in_rate: u32, out_rate: u32) -> Self {
        LinearResampler {
            in_rate: in_rate.max(1),
            out_rate: out_rate.max(1),
            phase: 0,
            prev: None,
        }
    }

    /// Input rate
    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Output rate
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Whether frames pass through unchanged
    pub fn is_passthrough(&self) -> bool {
        self.in_rate == self.out_rate
    }

    /// Forget history; the next frame starts a fresh stream
    pub fn reset(&mut self) {
        self.phase = 0;
        self.prev = None;
    }

    /// Output frames produced once `input_frames` more frames are pushed
    pub fn output_len(&self, input_frames: usize) -> usize {
        let ticks = self.phase;
        let span = input_frames as u64 * u64::from(self.out_rate);
        if span <= ticks {
            return 0;
        }
        ((span - ticks).div_ceil(u64::from(self.in_rate))) as usize
    }

    /// Input frames needed to produce at least `output_frames` more frames
    pub fn input_len(&self, output_frames: usize) -> usize {
        if output_frames == 0 {
            return 0;
        }
        let last = self.phase + (output_frames as u64 - 1) * u64::from(self.in_rate);
        (last / u64::from(self.out_rate) + 1) as usize
    }

    /// Feed one native frame, appending any produced output frames
    pub fn push(&mut self, frame: [i16; 2], out: &mut Vec<[i16; 2]>) {
        let prev = *self.prev.get_or_insert(frame);
        let out_rate = u64::from(self.out_rate);
        while self.phase < out_rate {
            out.push(lerp(prev, frame, self.phase, out_rate));
            self.phase += u64::from(self.in_rate);
        }
        self.phase -= out_rate;
        self.prev = Some(frame);
    }

    /// Feed a batch of native frames
    pub fn process(&mut self, input: &[[i16; 2]], out: &mut Vec<[i16; 2]>) {
        out.reserve(self.output_len(input.len()));
        for &frame in input {
            self.push(frame, out);
        }
    }
}

fn lerp(a: [i16; 2], b: [i16; 2], num: u64, den: u64) -> [i16; 2] {
    let mix = |x: i16, y: i16| {
        let x = i64::from(x);
        let y = i64::from(y);
        (x + (y - x) * num as i64 / den as i64) as i16
    };
    [mix(a[0], b[0]), mix(a[1], b[1])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opl3::NATIVE_RATE;

    fn run(resampler: &mut LinearResampler, frames: usize) -> Vec<[i16; 2]> {
        let input: Vec<[i16; 2]> = (0..frames)
            .map(|i| {
                let v = (i % 1000) as i16;
                [v, -v]
            })
            .collect();
        let mut out = Vec::new();
        resampler.process(&input, &mut out);
        out
    }

    #[test]
    fn test_output_count_tracks_ratio() {
        for frames in [0usize, 1, 2, 7, 100, 997, 4096, 49_716] {
            let mut r = LinearResampler::new(NATIVE_RATE, 44_100);
            let out = run(&mut r, frames);
            let expected = frames as f64 * 44_100.0 / f64::from(NATIVE_RATE);
            assert!(
                (out.len() as f64 - expected).abs() <= 1.0,
                "{frames} frames -> {} (expected ~{expected})",
                out.len()
            );
        }
    }

    #[test]
    fn test_output_len_predicts_exactly() {
        let mut r = LinearResampler::new(NATIVE_RATE, 48_000);
        for chunk in [1usize, 13, 512, 3, 1000] {
            let predicted = r.output_len(chunk);
            assert_eq!(run(&mut r, chunk).len(), predicted);
        }
    }

    #[test]
    fn test_input_len_is_sufficient() {
        let r = LinearResampler::new(NATIVE_RATE, 44_100);
        for wanted in [1usize, 2, 100, 441] {
            let needed = r.input_len(wanted);
            assert!(r.output_len(needed) >= wanted);
            assert!(r.output_len(needed - 1) < wanted, "input_len must be minimal");
        }
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let input: Vec<[i16; 2]> = (0..1000).map(|i| [(i * 7) as i16, (i * 3) as i16]).collect();

        let mut whole = LinearResampler::new(NATIVE_RATE, 44_100);
        let mut expected = Vec::new();
        whole.process(&input, &mut expected);

        let mut split = LinearResampler::new(NATIVE_RATE, 44_100);
        let mut got = Vec::new();
        for chunk in input.chunks(37) {
            split.process(chunk, &mut got);
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut r = LinearResampler::new(44_100, 44_100);
        assert!(r.is_passthrough());
        let out = run(&mut r, 5);
        // One frame of latency: the first frame is repeated once
        assert_eq!(out, vec![[0, 0], [0, 0], [1, -1], [2, -2], [3, -3]]);
    }

    #[test]
    fn test_interpolates_between_frames() {
        let mut r = LinearResampler::new(1, 2);
        let mut out = Vec::new();
        r.process(&[[0, 0], [100, -100]], &mut out);
        assert_eq!(out, vec![[0, 0], [0, 0], [0, 0], [50, -50]]);
    }

    #[test]
    fn test_reset_restarts_stream() {
        let mut r = LinearResampler::new(NATIVE_RATE, 44_100);
        let first = run(&mut r, 300);
        r.reset();
        assert_eq!(run(&mut r, 300), first);
    }
}
