//! Core data types for the offset template operators.
//!
//! # Overview
//!
//! An offset template models slow detector drift as a piecewise-constant
//! function. One amplitude coefficient covers `step_length` consecutive samples:
//!
//! ```text
//! samples:    0  1  2  3  4  5  6  7
//! step = 3:  [a0 a0 a0][a1 a1 a1][a2 a2]
//! ```
//!
//! The operators work in two spaces:
//!
//! - **Sample space**: one detector row of length `n_samp`
//! - **Amplitude space**: `n_amp` coefficients, possibly shared by several
//!   template blocks (each block starts at its own `amp_offset`)
//!
//! # Main Types
//!
//! - [`Interval`]: Closed range of valid samples
//! - [`StepGeometry`]: Sample-to-amplitude mapping for one template block
//! - [`FlagSelection`]: Optional flag masking for projection
//! - [`KernelConfig`]: Execution parameters
//! - [`OffsetError`]: Everything the entry points can reject

use ndarray::ArrayView2;
use std::ops::RangeInclusive;
use thiserror::Error;

// =============================================================================
// OffsetError
// =============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum OffsetError {
    #[error("step_length must be at least 1, got {0}")]
    InvalidStepLength(i64),

    #[error("{name} row {index} is out of range for {n_rows} rows")]
    RowOutOfRange {
        name: &'static str,
        index: i64,
        n_rows: usize,
    },

    #[error("interval {view} = [{first}, {last}] is not a valid range of {n_samp} samples")]
    IntervalOutOfRange {
        view: usize,
        first: i64,
        last: i64,
        n_samp: usize,
    },

    #[error("interval {view} = [{first}, {last}] has a negative sample index")]
    NegativeInterval { view: usize, first: i64, last: i64 },

    #[error("interval {view} touches amplitude {amp}, outside of {n_amp} amplitudes")]
    AmplitudeOutOfRange { view: usize, amp: i64, n_amp: usize },

    #[error("{name} has shape {actual:?}, expected {expected}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("flag_index = {index} selects a flag row, but no flag_data was given")]
    MissingFlags { index: i64 },

    #[error("{name} must be contiguous in memory")]
    NotContiguous { name: &'static str },

    #[error("device error: {0}")]
    Device(String),
}

// =============================================================================
// Interval
// =============================================================================

/// A closed range `[first, last]` of valid samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interval {
    pub first: usize,
    pub last: usize,
}

impl Interval {
    #[inline]
    pub const fn new(first: usize, last: usize) -> Self {
        Self { first, last }
    }

    /// Number of samples covered (`last - first + 1`, or 0 if inverted).
    #[inline]
    pub fn len(&self) -> usize {
        if self.last < self.first {
            0
        } else {
            self.last - self.first + 1
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn samples(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}

// =============================================================================
// StepGeometry
// =============================================================================

/// Mapping from sample index to amplitude index for one template block.
///
/// `amp = amp_offset + floor(isamp / step_length)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepGeometry {
    /// Number of samples covered by each amplitude.
    pub step_length: usize,
    /// Index of the first amplitude of this block.
    pub amp_offset: i64,
}

impl StepGeometry {
    /// Build a geometry from the signed values used at the binding boundary.
    pub fn new(step_length: i64, amp_offset: i64) -> Result<Self, OffsetError> {
        if step_length < 1 {
            return Err(OffsetError::InvalidStepLength(step_length));
        }
        Ok(Self {
            step_length: step_length as usize,
            amp_offset,
        })
    }

    /// Signed amplitude index for a sample, before range checking.
    ///
    /// Saturates at the `i64` bounds, so an index that overflows is still
    /// reported as out of range.
    #[inline]
    pub fn amp_index(&self, isamp: usize) -> i64 {
        i64::try_from(isamp / self.step_length)
            .map_or(i64::MAX, |step| self.amp_offset.saturating_add(step))
    }

    /// Amplitude index for a sample whose range was already validated.
    #[inline(always)]
    pub(crate) fn amp(&self, isamp: usize) -> usize {
        (self.amp_offset + (isamp / self.step_length) as i64) as usize
    }
}

// =============================================================================
// FlagSelection
// =============================================================================

/// Which samples projection is allowed to read.
///
/// Replaces the "negative flag index disables flagging" convention.
#[derive(Clone, Copy, Debug, Default)]
pub enum FlagSelection<'a> {
    /// Every sample inside the intervals is used.
    #[default]
    None,
    /// Samples with `flags[index][isamp] & mask != 0` are skipped.
    Masked {
        flags: ArrayView2<'a, u8>,
        index: usize,
        mask: u8,
    },
}

impl<'a> FlagSelection<'a> {
    /// Build a selection from the signed flag row used at the binding boundary.
    ///
    /// A negative `index` disables flagging whether or not `flags` is given.
    /// A non-negative `index` requires `flags`.
    pub fn from_index(
        index: i64,
        flags: Option<ArrayView2<'a, u8>>,
        mask: u8,
    ) -> Result<Self, OffsetError> {
        if index < 0 {
            return Ok(FlagSelection::None);
        }
        let flags = flags.ok_or(OffsetError::MissingFlags { index })?;
        let index = usize::try_from(index).map_err(|_| OffsetError::RowOutOfRange {
            name: "flag_data",
            index,
            n_rows: flags.nrows(),
        })?;
        Ok(FlagSelection::Masked { flags, index, mask })
    }
}

// =============================================================================
// KernelConfig
// =============================================================================

/// Execution parameters shared by all three kernels.
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// Work items (samples, chunks or amplitudes) below which a kernel runs
    /// serially instead of through rayon.
    pub min_parallel_len: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            min_parallel_len: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_geometry_rejects_zero_step() {
        assert_eq!(
            StepGeometry::new(0, 0),
            Err(OffsetError::InvalidStepLength(0))
        );
        assert_eq!(
            StepGeometry::new(-3, 0),
            Err(OffsetError::InvalidStepLength(-3))
        );
    }

    #[test]
    fn test_amp_index() {
        let geom = StepGeometry::new(4, 10).unwrap();
        assert_eq!(geom.amp_index(0), 10);
        assert_eq!(geom.amp_index(3), 10);
        assert_eq!(geom.amp_index(4), 11);
        assert_eq!(geom.amp(9), 12);

        let shifted = StepGeometry::new(2, -5).unwrap();
        assert_eq!(shifted.amp_index(0), -5);
        assert_eq!(shifted.amp_index(10), 0);
    }

    #[test]
    fn test_amp_index_saturates() {
        let geom = StepGeometry::new(1, i64::MAX).unwrap();
        assert_eq!(geom.amp_index(0), i64::MAX);
        assert_eq!(geom.amp_index(3), i64::MAX);

        let low = StepGeometry::new(1, i64::MIN).unwrap();
        assert_eq!(low.amp_index(0), i64::MIN);
        assert_eq!(low.amp_index(2), i64::MIN + 2);
    }

    #[test]
    fn test_flag_selection_from_index() {
        let flags = ndarray::Array2::<u8>::zeros((2, 4));

        let sel = FlagSelection::from_index(-1, Some(flags.view()), 1).unwrap();
        assert!(matches!(sel, FlagSelection::None));
        let sel = FlagSelection::from_index(-1, None, 1).unwrap();
        assert!(matches!(sel, FlagSelection::None));

        let sel = FlagSelection::from_index(1, Some(flags.view()), 3).unwrap();
        assert!(matches!(sel, FlagSelection::Masked { index: 1, mask: 3, .. }));

        // a flag row without flag data must not silently disable flagging
        assert_eq!(
            FlagSelection::from_index(0, None, 1).unwrap_err(),
            OffsetError::MissingFlags { index: 0 }
        );
    }

    #[test]
    fn test_interval_len() {
        assert_eq!(Interval::new(3, 3).len(), 1);
        assert_eq!(Interval::new(0, 9).len(), 10);
        assert!(Interval::new(5, 4).is_empty());
        assert_eq!(Interval::new(2, 4).samples().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_error_messages() {
        let err = OffsetError::RowOutOfRange {
            name: "det_data",
            index: 7,
            n_rows: 2,
        };
        assert_eq!(err.to_string(), "det_data row 7 is out of range for 2 rows");

        let err = OffsetError::NegativeInterval {
            view: 1,
            first: -1,
            last: 8,
        };
        assert_eq!(
            err.to_string(),
            "interval 1 = [-1, 8] has a negative sample index"
        );
    }
}
