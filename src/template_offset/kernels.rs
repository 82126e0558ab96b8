//! The three offset template kernels.
//!
//! Kernels operate on plain slices that were already validated and resolved
//! by the caller (host buffers, or device buffers inside an offloaded region).
//! They cannot fail and never index outside of the validated ranges.
//!
//! # Parallel Structure
//!
//! - [`add_to_signal`]: each sample of an interval writes a distinct cell of the
//!   detector row, so the samples of one interval run in parallel directly.
//! - [`project_signal`]: many samples share one amplitude. Intervals are split
//!   into step-aligned chunks (one amplitude per chunk), chunk sums are computed
//!   in parallel, and the sums are merged serially in chunk order. The result
//!   does not depend on the number of threads.
//! - [`apply_diag_precond`]: elementwise.

use super::intervals::{step_chunks, total_samples};
use super::types::{Interval, KernelConfig, StepGeometry};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use rayon::prelude::*;

/// One flag row and the mask selecting bad samples.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlagRow<'a> {
    pub flags: &'a [u8],
    pub mask: u8,
}

impl FlagRow<'_> {
    #[inline(always)]
    fn is_flagged(&self, isamp: usize) -> bool {
        self.flags[isamp] & self.mask != 0
    }
}

/// `row[isamp] += amplitudes[amp(isamp)]` for every sample in `intervals`.
pub(crate) fn add_to_signal(
    geometry: &StepGeometry,
    amplitudes: &[f64],
    row: &mut [f64],
    intervals: &[Interval],
    config: &KernelConfig,
) {
    for ival in intervals {
        let first = ival.first;
        let add = |(i, d): (usize, &mut f64)| {
            *d += amplitudes[geometry.amp(first + i)];
        };
        let samples = &mut row[ival.samples()];
        if samples.len() >= config.min_parallel_len {
            samples.par_iter_mut().enumerate().for_each(add);
        } else {
            samples.iter_mut().enumerate().for_each(add);
        }
    }
}

/// `amplitudes[amp(isamp)] += row[isamp]` for every unflagged sample in `intervals`.
pub(crate) fn project_signal(
    geometry: &StepGeometry,
    row: &[f64],
    flags: Option<FlagRow<'_>>,
    amplitudes: &mut [f64],
    intervals: &[Interval],
    config: &KernelConfig,
) {
    let chunks: Vec<Interval> = intervals
        .iter()
        .flat_map(|&ival| step_chunks(ival, geometry.step_length))
        .map(|(_, piece)| piece)
        .collect();

    // None when every sample of the chunk is flagged.
    let chunk_sum = |piece: &Interval| -> Option<f64> {
        let mut sum = 0.0;
        let mut n_good = 0usize;
        for isamp in piece.samples() {
            if flags.is_some_and(|f| f.is_flagged(isamp)) {
                continue;
            }
            sum += row[isamp];
            n_good += 1;
        }
        (n_good > 0).then_some(sum)
    };

    let sums: Vec<Option<f64>> = if total_samples(intervals) >= config.min_parallel_len {
        chunks.par_iter().map(chunk_sum).collect()
    } else {
        chunks.iter().map(chunk_sum).collect()
    };

    for (piece, sum) in chunks.iter().zip(sums) {
        if let Some(sum) = sum {
            amplitudes[geometry.amp(piece.first)] += sum;
        }
    }
}

/// `amplitudes_out[i] = amplitudes_in[i] * variance[i]`.
pub(crate) fn apply_diag_precond(
    variance: &[f64],
    amplitudes_in: &[f64],
    amplitudes_out: &mut [f64],
    config: &KernelConfig,
) {
    let n_amp = amplitudes_out.len();
    let zip = Zip::from(ArrayViewMut1::from(amplitudes_out))
        .and(ArrayView1::from(amplitudes_in))
        .and(ArrayView1::from(variance));
    let scale = |out: &mut f64, &a: &f64, &v: &f64| {
        *out = a;
        *out *= v;
    };
    if n_amp >= config.min_parallel_len {
        zip.par_for_each(scale);
    } else {
        zip.for_each(scale);
    }
}
