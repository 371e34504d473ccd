//! Waveform data-block codec shared by `Adc` (16-bit integer samples) and `RealWave` (32-bit
//! float samples): a sequence of evenly-spaced "runs", each separated from the next by a gap of
//! at least one missed sample.

use crate::constants::BLOCK_HEAD_SIZE;
use crate::types::{Range, Tick};

/// A sample type storable in a waveform run. Implemented for `i16` (`Adc`) and `f32` (`RealWave`).
pub trait WaveSample: Copy + Default {
    const SIZE: usize;
    fn to_le(self) -> [u8; 4];
    fn from_le(bytes: &[u8]) -> Self;
}

impl WaveSample for i16 {
    const SIZE: usize = 2;
    fn to_le(self) -> [u8; 4] {
        let b = self.to_le_bytes();
        [b[0], b[1], 0, 0]
    }
    fn from_le(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl WaveSample for f32 {
    const SIZE: usize = 4;
    fn to_le(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes(bytes[0..4].try_into().unwrap())
    }
}

/// One contiguous, evenly-spaced run of samples.
#[derive(Debug, Clone)]
pub struct Run<T> {
    pub first_time: Tick,
    pub samples: Vec<T>,
}

impl<T: WaveSample> Run<T> {
    pub fn last_time(&self, tick_divide: i64) -> Tick {
        self.first_time + (self.samples.len() as i64 - 1) * tick_divide
    }

    /// Byte length of this run's on-disk encoding: an 8-byte `(first_time)` + 4-byte `n` + 4-byte
    /// pad header, followed by `n` samples, rounded up to 8 bytes total.
    fn encoded_len(&self) -> usize {
        let raw = 16 + self.samples.len() * T::SIZE;
        (raw + 7) & !7
    }
}

/// An in-memory waveform data block: an ordered sequence of runs.
#[derive(Debug, Clone)]
pub struct WaveBlock<T> {
    pub runs: Vec<Run<T>>,
    pub tick_divide: i64,
}

impl<T: WaveSample + Copy> WaveBlock<T> {
    pub fn empty(tick_divide: i64) -> Self {
        WaveBlock { runs: Vec::new(), tick_divide }
    }

    pub fn first_time(&self) -> Tick {
        self.runs.first().map(|r| r.first_time).unwrap_or(-1)
    }

    pub fn last_time(&self) -> Tick {
        self.runs.last().map(|r| r.last_time(self.tick_divide)).unwrap_or(-1)
    }

    fn used_bytes(&self) -> usize {
        BLOCK_HEAD_SIZE + self.runs.iter().map(|r| r.encoded_len()).sum::<usize>()
    }

    fn would_fit(&self, extra_samples: usize, new_run: bool) -> bool {
        let dbsize = crate::constants::DBSIZE;
        let extra_header = if new_run { 16 } else { 0 };
        let raw_extra = extra_header + extra_samples * T::SIZE;
        // conservative: assume the whole addition needs its own 8-byte rounding
        self.used_bytes() + ((raw_extra + 7) & !7) <= dbsize
    }

    /// Appends samples in time order starting at `t_from`. If `t_from == last_time +
    /// tick_divide`, extends the current run; otherwise, if `t_from` is strictly after the last
    /// time and there is room, starts a new run. Returns the number of samples accepted.
    pub fn add_data(&mut self, t_from: Tick, samples: &[T]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let extends_current = self.last_time() >= 0 && t_from == self.last_time() + self.tick_divide;
        if extends_current {
            if !self.would_fit(samples.len(), false) {
                return self.partial_extend(samples);
            }
            self.runs.last_mut().unwrap().samples.extend_from_slice(samples);
            return samples.len();
        }
        if self.last_time() >= 0 && t_from <= self.last_time() {
            return 0;
        }
        if !self.would_fit(samples.len(), true) {
            return self.partial_new_run(t_from, samples);
        }
        self.runs.push(Run { first_time: t_from, samples: samples.to_vec() });
        samples.len()
    }

    fn partial_extend(&mut self, samples: &[T]) -> usize {
        let mut n = 0;
        for &s in samples {
            if !self.would_fit(1, false) {
                break;
            }
            self.runs.last_mut().unwrap().samples.push(s);
            n += 1;
        }
        n
    }

    fn partial_new_run(&mut self, t_from: Tick, samples: &[T]) -> usize {
        if !self.would_fit(1, true) {
            return 0;
        }
        self.runs.push(Run { first_time: t_from, samples: Vec::new() });
        let mut n = 0;
        for &s in samples {
            if !self.would_fit(1, false) {
                break;
            }
            self.runs.last_mut().unwrap().samples.push(s);
            n += 1;
        }
        n
    }

    /// Reads samples whose time falls in `[range.from, range.upto)`. Sets the first delivered
    /// sample's time via the returned `Option<Tick>` (the codec contract's `t_first`); batches
    /// after the first must present `range.from` equal to the expected next time or the read
    /// ends early.
    ///
    /// `range.from` must land within some run's inclusive time span to deliver anything: a
    /// `from` that falls strictly inside a gap between runs returns `(None, 0)` rather than
    /// skipping forward to the next run's start. Locating the right run for an arbitrary time is
    /// the block manager's job (`seek`/`next_block`); a single data block only ever serves the
    /// contiguous stretch starting exactly where it's asked to.
    pub fn get_data(&self, dst: &mut Vec<T>, range: &mut Range) -> (Option<Tick>, usize) {
        let Some(start_run) = self.runs.iter().position(|r| {
            range.from >= r.first_time && range.from <= r.last_time(self.tick_divide)
        }) else {
            return (None, 0);
        };

        let mut t_first = None;
        let mut n = 0;
        let mut expected_next: Option<Tick> = None;
        'runs: for run in &self.runs[start_run..] {
            for (i, &s) in run.samples.iter().enumerate() {
                let t = run.first_time + (i as i64) * self.tick_divide;
                if t < range.from {
                    continue;
                }
                if t >= range.upto || n >= range.max {
                    break 'runs;
                }
                if let Some(exp) = expected_next {
                    if t != exp {
                        break 'runs;
                    }
                }
                if range.tick_yield() {
                    break 'runs;
                }
                if t_first.is_none() {
                    t_first = Some(t);
                }
                dst.push(s);
                n += 1;
                expected_next = Some(t + self.tick_divide);
            }
        }
        (t_first, n)
    }

    /// Overwrites samples in place where timestamps coincide with existing ones (nearest-sample
    /// alignment), without crossing runs or extending the block. Returns the count overwritten.
    pub fn change_wave(&mut self, src: &[T], t_from: Tick) -> usize {
        let mut n = 0;
        for run in &mut self.runs {
            let run_last = run.first_time + (run.samples.len() as i64 - 1) * self.tick_divide;
            if t_from < run.first_time || t_from > run_last {
                continue;
            }
            let start_idx = ((t_from - run.first_time) / self.tick_divide) as usize;
            for (i, &s) in src.iter().enumerate() {
                let idx = start_idx + i;
                if idx >= run.samples.len() {
                    break;
                }
                run.samples[idx] = s;
                n += 1;
            }
            break;
        }
        n
    }

    pub fn prev_n_time(&self, range: &Range) -> Tick {
        let mut remaining = range.max;
        for run in self.runs.iter().rev() {
            let n_in_run = run.samples.len();
            for i in (0..n_in_run).rev() {
                let t = run.first_time + (i as i64) * self.tick_divide;
                if t >= range.upto {
                    continue;
                }
                if t < range.from {
                    return -1;
                }
                if remaining == 1 {
                    return t;
                }
                remaining -= 1;
            }
        }
        -1
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        let mut pos = BLOCK_HEAD_SIZE;
        for run in &self.runs {
            buf[pos..pos + 8].copy_from_slice(&run.first_time.to_le_bytes());
            buf[pos + 8..pos + 12].copy_from_slice(&(run.samples.len() as u32).to_le_bytes());
            pos += 16;
            for &s in &run.samples {
                let bytes = s.to_le();
                buf[pos..pos + T::SIZE].copy_from_slice(&bytes[..T::SIZE]);
                pos += T::SIZE;
            }
            pos = (pos + 7) & !7;
        }
    }

    pub fn from_bytes(buf: &[u8], n_runs: usize, tick_divide: i64) -> Self {
        let mut runs = Vec::with_capacity(n_runs);
        let mut pos = BLOCK_HEAD_SIZE;
        for _ in 0..n_runs {
            let first_time = Tick::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let n = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
            pos += 16;
            let mut samples = Vec::with_capacity(n);
            for _ in 0..n {
                samples.push(T::from_le(&buf[pos..pos + T::SIZE]));
                pos += T::SIZE;
            }
            pos = (pos + 7) & !7;
            runs.push(Run { first_time, samples });
        }
        WaveBlock { runs, tick_divide }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_starts_a_new_run_matching_scenario_2() {
        let mut block: WaveBlock<i16> = WaveBlock::empty(100);
        let n1 = block.add_data(0, &[1, 2, 3, 4]);
        assert_eq!(n1, 4);
        let n2 = block.add_data(1000, &[5, 6]);
        assert_eq!(n2, 2);
        assert_eq!(block.runs.len(), 2);

        let mut dst = Vec::new();
        let mut range = Range::new(0, 2000, 100);
        let (t_first, n) = block.get_data(&mut dst, &mut range);
        assert_eq!(t_first, Some(0));
        assert_eq!(n, 4);
        assert_eq!(dst, vec![1, 2, 3, 4]);

        let mut dst2 = Vec::new();
        let mut range2 = Range::new(400, 2000, 100);
        let (t_first2, n2b) = block.get_data(&mut dst2, &mut range2);
        assert_eq!(t_first2, None);
        assert_eq!(n2b, 0);

        let mut dst3 = Vec::new();
        let mut range3 = Range::new(1000, 2000, 100);
        let (t_first3, n3) = block.get_data(&mut dst3, &mut range3);
        assert_eq!(t_first3, Some(1000));
        assert_eq!(n3, 2);
    }

    #[test]
    fn change_wave_overwrites_in_place() {
        let mut block: WaveBlock<i16> = WaveBlock::empty(10);
        block.add_data(0, &[1, 2, 3, 4]);
        let n = block.change_wave(&[99, 98], 10);
        assert_eq!(n, 2);
        assert_eq!(block.runs[0].samples, vec![1, 99, 98, 4]);
    }

    #[test]
    fn serialize_round_trip() {
        let mut block: WaveBlock<f32> = WaveBlock::empty(50);
        block.add_data(0, &[1.0, 2.0]);
        block.add_data(200, &[3.0]);
        let mut buf = vec![0u8; crate::constants::DBSIZE];
        block.to_bytes(&mut buf);
        let back = WaveBlock::<f32>::from_bytes(&buf, 2, 50);
        assert_eq!(back.runs.len(), 2);
        assert_eq!(back.runs[0].samples, vec![1.0, 2.0]);
        assert_eq!(back.runs[1].samples, vec![3.0]);
    }
}
