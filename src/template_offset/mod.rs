//! Offset template operators for destriping solvers.
//!
//! An offset template describes slow detector drift as one amplitude per
//! `step_length` samples. A destriping solver needs three primitives:
//!
//! - [`add_to_signal`]: synthesis, amplitudes → detector timestream
//! - [`project_signal`]: adjoint, detector timestream → amplitudes
//! - [`apply_diag_precond`]: diagonal preconditioner on amplitudes
//!
//! # Module Structure
//!
//! - [`types`]: Core data types ([`Interval`], [`StepGeometry`], [`FlagSelection`],
//!   [`KernelConfig`], [`OffsetError`])
//! - [`intervals`]: Interval validation and step-aligned chunking
//! - [`dispatch`]: Host/device selection ([`Dispatch`], [`ExecContext`])
//! - `kernels`: The loops themselves, written once for both execution paths
//!
//! # Call Sequence
//!
//! Each entry point validates its buffers, selects a [`Dispatch`], resolves
//! buffers to device memory when offloading, and runs the shared kernel on
//! whichever buffers were resolved.

pub mod dispatch;
pub mod intervals;
mod kernels;
pub mod types;

pub use dispatch::{Dispatch, ExecContext};
pub use types::{FlagSelection, Interval, KernelConfig, OffsetError, StepGeometry};

use crate::accel::{DeviceHeap, DeviceId};
use crate::buffer;
use kernels::FlagRow;
use ndarray::{ArrayView2, ArrayViewMut2};
use std::ops::Range;

#[inline]
fn row_range(index: usize, n_samp: usize) -> Range<usize> {
    index * n_samp..(index + 1) * n_samp
}

// =============================================================================
// Synthesis
// =============================================================================

/// Accumulate offset amplitudes into one detector row.
///
/// For every sample `isamp` of every interval:
///
/// ```text
/// det_data[data_index][isamp] += amplitudes[amp_offset + isamp / step_length]
/// ```
///
/// Samples outside of `intervals` are never touched.
pub fn add_to_signal(
    ctx: &ExecContext<'_>,
    geometry: StepGeometry,
    amplitudes: &[f64],
    data_index: usize,
    mut det_data: ArrayViewMut2<'_, f64>,
    intervals: &[Interval],
    use_accel: bool,
) -> Result<(), OffsetError> {
    let (n_det, n_samp) = det_data.dim();
    buffer::expect_row("det_data", data_index, n_det)?;
    intervals::validate(intervals, n_samp)?;
    intervals::validate_amplitudes(intervals, &geometry, amplitudes.len())?;
    let det_flat = buffer::contiguous_mut("det_data", &mut det_data)?;
    let rows = row_range(data_index, n_samp);

    match Dispatch::select(use_accel, ctx.device) {
        Dispatch::Host => {
            kernels::add_to_signal(
                &geometry,
                amplitudes,
                &mut det_flat[rows],
                intervals,
                &ctx.config,
            );
            Ok(())
        }
        Dispatch::Device(device) => add_to_signal_device(
            ctx, device, &geometry, amplitudes, det_flat, rows, intervals,
        ),
    }
}

fn add_to_signal_device(
    ctx: &ExecContext<'_>,
    device: DeviceId,
    geometry: &StepGeometry,
    amplitudes: &[f64],
    det_flat: &mut [f64],
    rows: Range<usize>,
    intervals: &[Interval],
) -> Result<(), OffsetError> {
    log::debug!(
        "add_to_signal: {} intervals offloaded to device {}",
        intervals.len(),
        device.0
    );
    let mut heap = ctx.device.lock_heap()?;
    let mut dev_det = heap.checkout(&*det_flat)?;
    let run = |heap: &DeviceHeap, dev_row: &mut [f64]| -> Result<(), OffsetError> {
        let dev_amplitudes = heap.resolve(amplitudes)?;
        let dev_intervals = heap.resolve(intervals)?;
        kernels::add_to_signal(
            geometry,
            &dev_amplitudes,
            dev_row,
            &dev_intervals,
            &ctx.config,
        );
        Ok(())
    };
    let result = run(&*heap, &mut dev_det.data[rows]);
    heap.checkin(dev_det, det_flat);
    result
}

// =============================================================================
// Projection
// =============================================================================

/// Accumulate one detector row into offset amplitudes.
///
/// For every unflagged sample `isamp` of every interval:
///
/// ```text
/// amplitudes[amp_offset + isamp / step_length] += det_data[data_index][isamp]
/// ```
///
/// This is the adjoint of [`add_to_signal`] restricted to unflagged samples.
/// Amplitudes are shared by many samples; partial sums are formed per
/// step-aligned chunk and merged in a fixed order, so the result is identical
/// for serial, parallel and offloaded execution.
#[allow(clippy::too_many_arguments)]
pub fn project_signal(
    ctx: &ExecContext<'_>,
    data_index: usize,
    det_data: ArrayView2<'_, f64>,
    flags: FlagSelection<'_>,
    geometry: StepGeometry,
    amplitudes: &mut [f64],
    intervals: &[Interval],
    use_accel: bool,
) -> Result<(), OffsetError> {
    let (n_det, n_samp) = det_data.dim();
    buffer::expect_row("det_data", data_index, n_det)?;
    intervals::validate(intervals, n_samp)?;
    intervals::validate_amplitudes(intervals, &geometry, amplitudes.len())?;
    let det_flat = buffer::contiguous("det_data", &det_data)?;
    let det_rows = row_range(data_index, n_samp);

    let flag_block = match &flags {
        FlagSelection::None => None,
        FlagSelection::Masked { flags, index, mask } => {
            buffer::expect_shape("flag_data", flags.shape(), &[None, Some(n_samp)])?;
            buffer::expect_row("flag_data", *index, flags.nrows())?;
            Some(FlagBlock {
                flat: buffer::contiguous("flag_data", flags)?,
                rows: row_range(*index, n_samp),
                mask: *mask,
            })
        }
    };

    match Dispatch::select(use_accel, ctx.device) {
        Dispatch::Host => {
            kernels::project_signal(
                &geometry,
                &det_flat[det_rows],
                flag_block.as_ref().map(FlagBlock::row),
                amplitudes,
                intervals,
                &ctx.config,
            );
            Ok(())
        }
        Dispatch::Device(device) => project_signal_device(
            ctx,
            device,
            &geometry,
            det_flat,
            det_rows,
            flag_block.as_ref(),
            amplitudes,
            intervals,
        ),
    }
}

/// Flag rows of a whole flag buffer, kept whole so the buffer can be looked
/// up in device memory.
struct FlagBlock<'a> {
    flat: &'a [u8],
    rows: Range<usize>,
    mask: u8,
}

impl FlagBlock<'_> {
    fn row(&self) -> FlagRow<'_> {
        FlagRow {
            flags: &self.flat[self.rows.clone()],
            mask: self.mask,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn project_signal_device(
    ctx: &ExecContext<'_>,
    device: DeviceId,
    geometry: &StepGeometry,
    det_flat: &[f64],
    det_rows: Range<usize>,
    flag_block: Option<&FlagBlock<'_>>,
    amplitudes: &mut [f64],
    intervals: &[Interval],
) -> Result<(), OffsetError> {
    log::debug!(
        "project_signal: {} intervals offloaded to device {}",
        intervals.len(),
        device.0
    );
    let mut heap = ctx.device.lock_heap()?;
    let mut dev_amplitudes = heap.checkout(&*amplitudes)?;
    let run = |heap: &DeviceHeap, dev_amps: &mut [f64]| -> Result<(), OffsetError> {
        let dev_det = heap.resolve(det_flat)?;
        let dev_intervals = heap.resolve(intervals)?;
        let dev_flag_flat = flag_block.map(|block| heap.resolve(block.flat)).transpose()?;
        let dev_flags = flag_block
            .zip(dev_flag_flat.as_deref())
            .map(|(block, flat)| FlagBlock {
                flat,
                rows: block.rows.clone(),
                mask: block.mask,
            });
        kernels::project_signal(
            geometry,
            &dev_det[det_rows.clone()],
            dev_flags.as_ref().map(FlagBlock::row),
            dev_amps,
            &dev_intervals,
            &ctx.config,
        );
        Ok(())
    };
    let result = run(&*heap, &mut dev_amplitudes.data[..]);
    heap.checkin(dev_amplitudes, amplitudes);
    result
}

// =============================================================================
// Preconditioner
// =============================================================================

/// Apply the diagonal preconditioner: `amplitudes_out[i] = amplitudes_in[i] * variance[i]`.
///
/// `amplitudes_in` is left unchanged.
pub fn apply_diag_precond(
    ctx: &ExecContext<'_>,
    variance: &[f64],
    amplitudes_in: &[f64],
    amplitudes_out: &mut [f64],
    use_accel: bool,
) -> Result<(), OffsetError> {
    let n_amp = amplitudes_in.len();
    buffer::expect_shape("amplitudes_out", &[amplitudes_out.len()], &[Some(n_amp)])?;
    buffer::expect_shape("offset_var", &[variance.len()], &[Some(n_amp)])?;

    match Dispatch::select(use_accel, ctx.device) {
        Dispatch::Host => {
            kernels::apply_diag_precond(variance, amplitudes_in, amplitudes_out, &ctx.config);
            Ok(())
        }
        Dispatch::Device(device) => {
            apply_diag_precond_device(ctx, device, variance, amplitudes_in, amplitudes_out)
        }
    }
}

fn apply_diag_precond_device(
    ctx: &ExecContext<'_>,
    device: DeviceId,
    variance: &[f64],
    amplitudes_in: &[f64],
    amplitudes_out: &mut [f64],
) -> Result<(), OffsetError> {
    log::debug!(
        "apply_diag_precond: {} amplitudes offloaded to device {}",
        amplitudes_in.len(),
        device.0
    );
    let mut heap = ctx.device.lock_heap()?;
    let mut dev_out = heap.checkout(&*amplitudes_out)?;
    let run = |heap: &DeviceHeap, dev_out: &mut [f64]| -> Result<(), OffsetError> {
        let dev_var = heap.resolve(variance)?;
        let dev_in = heap.resolve(amplitudes_in)?;
        kernels::apply_diag_precond(&dev_var, &dev_in, dev_out, &ctx.config);
        Ok(())
    };
    let result = run(&*heap, &mut dev_out.data[..]);
    heap.checkin(dev_out, amplitudes_out);
    result
}
