//! Interval iteration helpers.
//!
//! All three operators touch only the samples inside a list of closed
//! intervals. This module validates interval lists against a detector row and
//! splits intervals at step boundaries so that every piece maps to a single
//! amplitude:
//!
//! ```text
//! step = 4, interval [2, 13]:
//!
//!   [2, 3]  -> step 0
//!   [4, 7]  -> step 1
//!   [8, 11] -> step 2
//!   [12,13] -> step 3
//! ```

use super::types::{Interval, OffsetError, StepGeometry};

/// Convert `[first, last]` pairs coming from a signed integer buffer.
pub fn from_pairs(pairs: &[[i64; 2]]) -> Result<Vec<Interval>, OffsetError> {
    pairs
        .iter()
        .enumerate()
        .map(|(view, &[first, last])| {
            if first < 0 || last < 0 {
                return Err(OffsetError::NegativeInterval { view, first, last });
            }
            Ok(Interval::new(first as usize, last as usize))
        })
        .collect()
}

/// Check `first <= last < n_samp` for every interval.
pub fn validate(intervals: &[Interval], n_samp: usize) -> Result<(), OffsetError> {
    for (view, ival) in intervals.iter().enumerate() {
        if ival.first > ival.last || ival.last >= n_samp {
            return Err(OffsetError::IntervalOutOfRange {
                view,
                first: ival.first as i64,
                last: ival.last as i64,
                n_samp,
            });
        }
    }
    Ok(())
}

/// Check that every sample of every interval maps inside `[0, n_amp)`.
///
/// The mapping is monotone in the sample index, so the endpoints suffice.
pub fn validate_amplitudes(
    intervals: &[Interval],
    geometry: &StepGeometry,
    n_amp: usize,
) -> Result<(), OffsetError> {
    for (view, ival) in intervals.iter().enumerate() {
        for amp in [geometry.amp_index(ival.first), geometry.amp_index(ival.last)] {
            if usize::try_from(amp).map_or(true, |amp| amp >= n_amp) {
                return Err(OffsetError::AmplitudeOutOfRange { view, amp, n_amp });
            }
        }
    }
    Ok(())
}

/// Total number of samples covered, counting overlaps twice.
pub fn total_samples(intervals: &[Interval]) -> usize {
    intervals.iter().map(Interval::len).sum()
}

/// Smallest and largest amplitude index touched by the intervals.
pub fn amplitude_span(intervals: &[Interval], geometry: &StepGeometry) -> Option<(i64, i64)> {
    intervals
        .iter()
        .filter(|ival| !ival.is_empty())
        .map(|ival| (geometry.amp_index(ival.first), geometry.amp_index(ival.last)))
        .reduce(|(lo, hi), (a, b)| (lo.min(a), hi.max(b)))
}

/// Split an interval into pieces that never cross a step boundary.
///
/// Yields `(step, piece)` where `step = isamp / step_length` for every sample
/// of the piece.
pub fn step_chunks(ival: Interval, step_length: usize) -> StepChunks {
    StepChunks {
        next: ival.first,
        last: ival.last,
        step_length,
        done: ival.is_empty(),
    }
}

/// Iterator returned by [`step_chunks`].
#[derive(Clone, Debug)]
pub struct StepChunks {
    next: usize,
    last: usize,
    step_length: usize,
    done: bool,
}

impl Iterator for StepChunks {
    type Item = (usize, Interval);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.next / self.step_length;
        let step_last = (step + 1) * self.step_length - 1;
        let piece = Interval::new(self.next, step_last.min(self.last));
        if piece.last == self.last {
            self.done = true;
        } else {
            self.next = piece.last + 1;
        }
        Some((step, piece))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_chunks_aligned() {
        let chunks: Vec<_> = step_chunks(Interval::new(2, 13), 4).collect();
        assert_eq!(
            chunks,
            vec![
                (0, Interval::new(2, 3)),
                (1, Interval::new(4, 7)),
                (2, Interval::new(8, 11)),
                (3, Interval::new(12, 13)),
            ]
        );
    }

    #[test]
    fn test_step_chunks_single_sample_and_unit_step() {
        let one: Vec<_> = step_chunks(Interval::new(5, 5), 3).collect();
        assert_eq!(one, vec![(1, Interval::new(5, 5))]);

        let unit: Vec<_> = step_chunks(Interval::new(0, 2), 1).collect();
        assert_eq!(unit.len(), 3);
        assert!(unit.iter().all(|(s, piece)| piece.first == *s && piece.last == *s));
    }

    #[test]
    fn test_step_chunks_cover_every_sample_once() {
        let ival = Interval::new(7, 100);
        let covered: usize = step_chunks(ival, 6).map(|(_, piece)| piece.len()).sum();
        assert_eq!(covered, ival.len());
    }

    #[test]
    fn test_validate() {
        let ok = [Interval::new(0, 4), Interval::new(6, 9)];
        assert!(validate(&ok, 10).is_ok());

        let past_end = [Interval::new(0, 4), Interval::new(6, 10)];
        assert_eq!(
            validate(&past_end, 10),
            Err(OffsetError::IntervalOutOfRange {
                view: 1,
                first: 6,
                last: 10,
                n_samp: 10
            })
        );

        let inverted = [Interval::new(4, 3)];
        assert!(validate(&inverted, 10).is_err());
    }

    #[test]
    fn test_validate_amplitudes() {
        let geom = StepGeometry::new(2, 1).unwrap();
        let ivals = [Interval::new(0, 5)];
        // samples 0..=5 -> amplitudes 1..=3
        assert!(validate_amplitudes(&ivals, &geom, 4).is_ok());
        assert_eq!(
            validate_amplitudes(&ivals, &geom, 3),
            Err(OffsetError::AmplitudeOutOfRange {
                view: 0,
                amp: 3,
                n_amp: 3
            })
        );

        let negative = StepGeometry::new(2, -1).unwrap();
        assert!(validate_amplitudes(&ivals, &negative, 10).is_err());
    }

    #[test]
    fn test_validate_amplitudes_near_i64_max() {
        let geom = StepGeometry::new(1, i64::MAX).unwrap();
        assert_eq!(
            validate_amplitudes(&[Interval::new(0, 3)], &geom, 8),
            Err(OffsetError::AmplitudeOutOfRange {
                view: 0,
                amp: i64::MAX,
                n_amp: 8
            })
        );

        // only the last sample overflows
        let edge = StepGeometry::new(1, i64::MAX - 1).unwrap();
        assert_eq!(
            validate_amplitudes(&[Interval::new(0, 3)], &edge, 8),
            Err(OffsetError::AmplitudeOutOfRange {
                view: 0,
                amp: i64::MAX - 1,
                n_amp: 8
            })
        );
    }

    #[test]
    fn test_span_and_totals() {
        let geom = StepGeometry::new(10, 3).unwrap();
        let ivals = [Interval::new(25, 40), Interval::new(0, 4)];
        assert_eq!(amplitude_span(&ivals, &geom), Some((3, 7)));
        assert_eq!(total_samples(&ivals), 16 + 5);
        assert_eq!(amplitude_span(&[], &geom), None);
    }

    #[test]
    fn test_from_pairs() {
        let ivals = from_pairs(&[[0, 3], [5, 8]]).unwrap();
        assert_eq!(ivals, vec![Interval::new(0, 3), Interval::new(5, 8)]);
        assert_eq!(
            from_pairs(&[[0, 3], [-1, 8]]),
            Err(OffsetError::NegativeInterval {
                view: 1,
                first: -1,
                last: 8
            })
        );
        assert!(from_pairs(&[[4, -2]]).is_err());
    }
}
