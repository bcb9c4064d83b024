//! Per-edit-unit sample counts.
//!
//! Sound tracks at a sampling rate that is not an integer multiple of the
//! edit rate carry a repeating cycle of sample counts, e.g. 1602, 1601, 1602,
//! 1601, 1602 samples of 48 kHz audio per 29.97 Hz frame.

use crate::error::{MxfError, Result};
use crate::types::{gcd, Rational};

/// Longest cycle accepted for the computed fallback
pub const MAX_SEQUENCE_LEN: u64 = 4096;

const KNOWN_SEQUENCES: &[(Rational, Rational, &[u32])] = &[
    (
        Rational::new(30000, 1001),
        Rational::new(48000, 1),
        &[1602, 1601, 1602, 1601, 1602],
    ),
    (
        Rational::new(60000, 1001),
        Rational::new(48000, 1),
        &[801, 801, 801, 800, 801, 801, 801, 800, 801, 801],
    ),
    (
        Rational::new(24000, 1001),
        Rational::new(48000, 1),
        &[2002],
    ),
];

/// Sample counts per edit unit for `sampling_rate` samples in `edit_rate` units
pub fn sample_sequence(edit_rate: Rational, sampling_rate: Rational) -> Result<Vec<u32>> {
    if !edit_rate.is_valid_rate() || !sampling_rate.is_valid_rate() {
        return Err(MxfError::InvalidConfig(format!(
            "no sample sequence for edit rate {} and sampling rate {}",
            edit_rate, sampling_rate
        )));
    }

    if edit_rate.same_rate(&sampling_rate) {
        return Ok(vec![1]);
    }

    for (er, sr, seq) in KNOWN_SEQUENCES {
        if er.same_rate(&edit_rate) && sr.same_rate(&sampling_rate) {
            return Ok(seq.to_vec());
        }
    }

    // samples per edit unit = S / C
    let mut s = sampling_rate.numerator as u64 * edit_rate.denominator as u64;
    let mut c = sampling_rate.denominator as u64 * edit_rate.numerator as u64;
    let g = gcd(s, c);
    s /= g;
    c /= g;

    if c == 1 {
        return u32::try_from(s)
            .map(|n| vec![n])
            .map_err(|_| MxfError::InvalidConfig(format!("{} samples per edit unit", s)));
    }
    if c > MAX_SEQUENCE_LEN {
        return Err(MxfError::InvalidConfig(format!(
            "sample sequence for {} in {} repeats only every {} edit units",
            sampling_rate, edit_rate, c
        )));
    }

    let round = |k: u64| (2 * k * s + c) / (2 * c);
    (0..c)
        .map(|k| {
            let count = round(k + 1) - round(k);
            u32::try_from(count).map_err(|_| MxfError::InvalidConfig(format!("{} samples per edit unit", count)))
        })
        .collect()
}

/// Rotate `sequence` left by `offset` positions
pub fn offset_sample_sequence(sequence: &[u32], offset: usize) -> Vec<u32> {
    if sequence.is_empty() {
        return Vec::new();
    }
    let offset = offset % sequence.len();
    sequence[offset..]
        .iter()
        .chain(&sequence[..offset])
        .copied()
        .collect()
}

/// Total samples in the first `count` edit units of a repeating sequence
pub fn samples_in(sequence: &[u32], count: u64) -> u64 {
    if sequence.is_empty() {
        return 0;
    }
    let len = sequence.len() as u64;
    let cycle: u64 = sequence.iter().map(|&n| n as u64).sum();
    let rem: u64 = sequence[..(count % len) as usize].iter().map(|&n| n as u64).sum();
    (count / len) * cycle + rem
}

/// Endless iterator over a repeating sample sequence
#[derive(Debug, Clone)]
pub struct SampleSequence {
    counts: Vec<u32>,
    index: usize,
}

impl SampleSequence {
    pub fn new(counts: Vec<u32>) -> Self {
        SampleSequence { counts, index: 0 }
    }

    /// Count for the edit unit at `position`
    pub fn count_at(&self, position: u64) -> u32 {
        if self.counts.is_empty() {
            return 0;
        }
        self.counts[(position % self.counts.len() as u64) as usize]
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// Largest count in the cycle
    pub fn max_count(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Largest count that is smaller than the maximum, if counts differ
    pub fn second_max_count(&self) -> Option<u32> {
        let max = self.max_count();
        self.counts.iter().copied().filter(|&n| n < max).max()
    }
}

impl Iterator for SampleSequence {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.counts.is_empty() {
            return None;
        }
        let count = self.counts[self.index];
        self.index = (self.index + 1) % self.counts.len();
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_sequences() {
        assert_eq!(
            sample_sequence(Rational::fps_29_97(), Rational::hz_48000()).unwrap(),
            vec![1602, 1601, 1602, 1601, 1602]
        );
        assert_eq!(
            sample_sequence(Rational::fps_59_94(), Rational::hz_48000()).unwrap(),
            vec![801, 801, 801, 800, 801, 801, 801, 800, 801, 801]
        );
    }

    #[test]
    fn test_integer_ratio() {
        assert_eq!(sample_sequence(Rational::fps_25(), Rational::hz_48000()).unwrap(), vec![1920]);
        assert_eq!(sample_sequence(Rational::fps_25(), Rational::new(50, 2)).unwrap(), vec![1]);
    }

    #[test]
    fn test_computed_sequence() {
        // 44.1 kHz at 30000/1001 → 1471.47 samples per frame
        let seq = sample_sequence(Rational::fps_29_97(), Rational::new(44100, 1)).unwrap();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq.iter().map(|&n| n as u64).sum::<u64>(), 147_147);
        assert!(seq.iter().all(|&n| n == 1471 || n == 1472));
    }

    #[test]
    fn test_invalid_rates() {
        assert!(sample_sequence(Rational::new(0, 1), Rational::hz_48000()).is_err());
        assert!(sample_sequence(Rational::new(1, 1), Rational::new(1, 100_003)).is_err());
    }

    #[test]
    fn test_offset_sequence() {
        assert_eq!(offset_sample_sequence(&[1, 2, 3], 1), vec![2, 3, 1]);
        assert_eq!(offset_sample_sequence(&[1, 2, 3], 4), vec![2, 3, 1]);
        assert!(offset_sample_sequence(&[], 2).is_empty());
    }

    #[test]
    fn test_iterator() {
        let seq = SampleSequence::new(vec![1602, 1601]);
        assert_eq!(seq.clone().take(3).collect::<Vec<_>>(), vec![1602, 1601, 1602]);
        assert_eq!(seq.count_at(3), 1601);
        assert_eq!(seq.second_max_count(), Some(1601));
        assert_eq!(SampleSequence::new(vec![1920]).second_max_count(), None);
        assert_eq!(samples_in(&[1602, 1601, 1602, 1601, 1602], 7), 8008 + 3203);
    }

    proptest! {
        #[test]
        fn prop_no_drift_over_cycles(
            num in 1i32..120_000,
            den in 1i32..1002,
            rate in prop::sample::select(vec![32000i32, 44100, 48000, 96000]),
            cycles in 1u64..5,
        ) {
            let edit_rate = Rational::new(num, den);
            let sampling_rate = Rational::new(rate, 1);
            if let Ok(seq) = sample_sequence(edit_rate, sampling_rate) {
                let units = seq.len() as u64 * cycles;
                let total = samples_in(&seq, units) as u128;
                // total samples * edit rate == units * sampling rate
                prop_assert_eq!(total * num as u128, units as u128 * rate as u128 * den as u128);
            }
        }
    }
}
