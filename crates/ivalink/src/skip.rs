//! Frame-rate conversion by periodic dropping.

/// Converts an input rate to a lower output rate by dropping frames evenly.
///
/// Over every `input` consecutive calls exactly `output` frames are kept
/// when `output <= input`; a higher output rate keeps everything.
///
/// # Example
/// ```rust
/// use ivalink::skip::FrameSkip;
///
/// let mut skip = FrameSkip::new(30, 15);
/// let kept = (0..30).filter(|_| !skip.should_skip()).count();
/// assert_eq!(kept, 15);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSkip {
    input: u64,
    output: u64,
    in_cnt: u64,
    out_cnt: u64,
    period: u64,
    restart: bool,
}

impl FrameSkip {
    pub fn new(input_fps: u32, output_fps: u32) -> Self {
        Self {
            input: u64::from(input_fps),
            output: u64::from(output_fps),
            in_cnt: 0,
            out_cnt: 0,
            period: 0,
            restart: true,
        }
    }

    pub fn input_fps(&self) -> u32 {
        self.input as u32
    }

    pub fn output_fps(&self) -> u32 {
        self.output as u32
    }

    /// Change the rates and start a new cycle.
    pub fn set_rates(&mut self, input_fps: u32, output_fps: u32) {
        *self = Self::new(input_fps, output_fps);
    }

    /// Decide for the next frame.
    pub fn should_skip(&mut self) -> bool {
        if self.restart {
            self.in_cnt = 0;
            self.out_cnt = 0;
            self.period = self.input * self.output;
            self.restart = false;
        }
        if self.in_cnt > self.out_cnt {
            self.out_cnt += self.output;
            return true;
        }
        // Both counters are multiples of the period here.
        if self.in_cnt == self.period {
            self.in_cnt = 0;
            self.out_cnt = 0;
        }
        self.in_cnt += self.input;
        self.out_cnt += self.output;
        false
    }
}

impl Default for FrameSkip {
    fn default() -> Self {
        Self::new(30, 30)
    }
}
