//! Python bindings for the offset template operators.
//!
//! Argument order and names follow the `template_offset_*` functions of the
//! destriping framework that calls these operators. Intervals are passed as an
//! `int64` array of shape `(n_view, 2)` holding `[first, last]` per view.

use crate::accel::DeviceManager;
use crate::buffer;
use crate::template_offset::{
    self, dispatch::OFFLOAD_BUILT, intervals, ExecContext, FlagSelection, Interval, OffsetError,
    StepGeometry,
};
use numpy::{
    PyArrayDyn, PyArrayMethods, PyReadonlyArray1, PyReadonlyArray2, PyReadwriteArray1,
    PyReadwriteArray2,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

impl From<OffsetError> for PyErr {
    fn from(err: OffsetError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

fn row_index(name: &'static str, index: i32, n_rows: usize) -> Result<usize, OffsetError> {
    if index < 0 {
        return Err(OffsetError::RowOutOfRange {
            name,
            index: index as i64,
            n_rows,
        });
    }
    Ok(index as usize)
}

fn interval_list(raw: &PyReadonlyArray2<i64>) -> Result<Vec<Interval>, OffsetError> {
    let arr = raw.as_array();
    buffer::expect_shape("intervals", arr.shape(), &[None, Some(2)])?;
    let pairs: Vec<[i64; 2]> = arr.outer_iter().map(|row| [row[0], row[1]]).collect();
    intervals::from_pairs(&pairs)
}

fn exec_context(accel: &Option<PyRef<'_, AccelContext>>) -> ExecContext<'_> {
    match accel {
        Some(ctx) => ExecContext::new(&ctx.inner),
        None => ExecContext::host(),
    }
}

/// Accumulate offset amplitudes into one row of detector data.
///
/// Parameters
/// ----------
/// step_length : int
///     Number of samples covered by each amplitude.
/// amp_offset : int
///     Index of the first amplitude of this template block.
/// amplitudes : numpy.ndarray (float64), shape (n_amp,)
/// data_index : int
///     Row of `det_data` to accumulate into.
/// det_data : numpy.ndarray (float64), shape (n_det, n_samp)
///     Modified in place.
/// intervals : numpy.ndarray (int64), shape (n_view, 2)
///     Inclusive `[first, last]` sample ranges.
/// use_accel : bool
///     Run on the accelerator if one is available.
/// accel : AccelContext, optional
///     Device to offload to. Host only when omitted.
#[pyfunction]
#[pyo3(signature = (step_length, amp_offset, amplitudes, data_index, det_data, intervals, use_accel=false, accel=None))]
#[allow(clippy::too_many_arguments)]
pub fn template_offset_add_to_signal(
    py: Python<'_>,
    step_length: i64,
    amp_offset: i64,
    amplitudes: PyReadonlyArray1<f64>,
    data_index: i32,
    mut det_data: PyReadwriteArray2<f64>,
    intervals: PyReadonlyArray2<i64>,
    use_accel: bool,
    accel: Option<PyRef<'_, AccelContext>>,
) -> PyResult<()> {
    let geometry = StepGeometry::new(step_length, amp_offset)?;
    let amplitudes = amplitudes.as_slice()?;
    let det_view = det_data.as_array_mut();
    let data_index = row_index("det_data", data_index, det_view.nrows())?;
    let intervals = interval_list(&intervals)?;
    let ctx = exec_context(&accel);

    py.allow_threads(|| {
        template_offset::add_to_signal(
            &ctx,
            geometry,
            amplitudes,
            data_index,
            det_view,
            &intervals,
            use_accel,
        )
    })?;
    Ok(())
}

/// Accumulate one row of detector data into offset amplitudes.
///
/// Parameters
/// ----------
/// data_index : int
///     Row of `det_data` to read.
/// det_data : numpy.ndarray (float64), shape (n_det, n_samp)
/// flag_index : int
///     Row of `flag_data` to check. Negative disables flag checking.
/// flag_data : numpy.ndarray (uint8), shape (n_det_flags, n_samp), optional
///     Required when `flag_index` is non-negative.
/// flag_mask : int
///     Samples with `flag & flag_mask != 0` are skipped.
/// step_length : int
/// amp_offset : int
/// amplitudes : numpy.ndarray (float64), shape (n_amp,)
///     Accumulated in place.
/// intervals : numpy.ndarray (int64), shape (n_view, 2)
/// use_accel : bool
/// accel : AccelContext, optional
#[pyfunction]
#[pyo3(signature = (data_index, det_data, flag_index, flag_data, flag_mask, step_length, amp_offset, amplitudes, intervals, use_accel=false, accel=None))]
#[allow(clippy::too_many_arguments)]
pub fn template_offset_project_signal(
    py: Python<'_>,
    data_index: i32,
    det_data: PyReadonlyArray2<f64>,
    flag_index: i32,
    flag_data: Option<PyReadonlyArray2<u8>>,
    flag_mask: u8,
    step_length: i64,
    amp_offset: i64,
    mut amplitudes: PyReadwriteArray1<f64>,
    intervals: PyReadonlyArray2<i64>,
    use_accel: bool,
    accel: Option<PyRef<'_, AccelContext>>,
) -> PyResult<()> {
    let geometry = StepGeometry::new(step_length, amp_offset)?;
    let det_view = det_data.as_array();
    let data_index = row_index("det_data", data_index, det_view.nrows())?;
    let flags = FlagSelection::from_index(
        i64::from(flag_index),
        flag_data.as_ref().map(|flags| flags.as_array()),
        flag_mask,
    )?;
    let amplitudes = amplitudes.as_slice_mut()?;
    let intervals = interval_list(&intervals)?;
    let ctx = exec_context(&accel);

    py.allow_threads(|| {
        template_offset::project_signal(
            &ctx,
            data_index,
            det_view,
            flags,
            geometry,
            amplitudes,
            &intervals,
            use_accel,
        )
    })?;
    Ok(())
}

/// Apply the diagonal offset preconditioner.
///
/// Computes `amplitudes_out = amplitudes_in * offset_var` elementwise.
/// `amplitudes_in` and `amplitudes_out` must be different arrays.
#[pyfunction]
#[pyo3(signature = (offset_var, amplitudes_in, amplitudes_out, use_accel=false, accel=None))]
pub fn template_offset_apply_diag_precond(
    py: Python<'_>,
    offset_var: PyReadonlyArray1<f64>,
    amplitudes_in: PyReadonlyArray1<f64>,
    mut amplitudes_out: PyReadwriteArray1<f64>,
    use_accel: bool,
    accel: Option<PyRef<'_, AccelContext>>,
) -> PyResult<()> {
    let variance = offset_var.as_slice()?;
    let amplitudes_in = amplitudes_in.as_slice()?;
    let amplitudes_out = amplitudes_out.as_slice_mut()?;
    let ctx = exec_context(&accel);

    py.allow_threads(|| {
        template_offset::apply_diag_precond(&ctx, variance, amplitudes_in, amplitudes_out, use_accel)
    })?;
    Ok(())
}

// =============================================================================
// AccelContext
// =============================================================================

enum HostSlice<'a> {
    F64(&'a [f64]),
    U8(&'a [u8]),
}

enum HostSliceMut<'a> {
    F64(&'a mut [f64]),
    U8(&'a mut [u8]),
}

fn unsupported_dtype() -> PyErr {
    PyValueError::new_err("only float64 and uint8 arrays can be placed on a device")
}

fn borrow_error(err: numpy::BorrowError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn with_host_slice<R>(
    array: &Bound<'_, PyAny>,
    op: impl FnOnce(HostSlice<'_>) -> Result<R, OffsetError>,
) -> PyResult<R> {
    if let Ok(arr) = array.downcast::<PyArrayDyn<f64>>() {
        let ro = arr.try_readonly().map_err(borrow_error)?;
        return Ok(op(HostSlice::F64(ro.as_slice()?))?);
    }
    if let Ok(arr) = array.downcast::<PyArrayDyn<u8>>() {
        let ro = arr.try_readonly().map_err(borrow_error)?;
        return Ok(op(HostSlice::U8(ro.as_slice()?))?);
    }
    Err(unsupported_dtype())
}

fn with_host_slice_mut<R>(
    array: &Bound<'_, PyAny>,
    op: impl FnOnce(HostSliceMut<'_>) -> Result<R, OffsetError>,
) -> PyResult<R> {
    if let Ok(arr) = array.downcast::<PyArrayDyn<f64>>() {
        let mut rw = arr.try_readwrite().map_err(borrow_error)?;
        return Ok(op(HostSliceMut::F64(rw.as_slice_mut()?))?);
    }
    if let Ok(arr) = array.downcast::<PyArrayDyn<u8>>() {
        let mut rw = arr.try_readwrite().map_err(borrow_error)?;
        return Ok(op(HostSliceMut::U8(rw.as_slice_mut()?))?);
    }
    Err(unsupported_dtype())
}

/// Accelerator device handle passed to the operators through `accel=`.
///
/// A negative `device` selects the host; offload is then never taken.
/// Arrays placed on a device with `create` keep their results there until
/// `update_host` is called.
#[pyclass(name = "AccelContext", frozen)]
pub struct AccelContext {
    inner: DeviceManager,
}

#[pymethods]
impl AccelContext {
    #[new]
    #[pyo3(signature = (device=0))]
    fn new(device: i32) -> Self {
        let inner = if device < 0 {
            DeviceManager::host()
        } else {
            DeviceManager::mirrored(crate::accel::DeviceId(device))
        };
        Self { inner }
    }

    #[getter]
    fn device(&self) -> i32 {
        self.inner.current_device().0
    }

    #[getter]
    fn device_is_host(&self) -> bool {
        self.inner.device_is_host()
    }

    /// Whether operators called with this context will actually offload.
    #[getter]
    fn offload(&self) -> bool {
        OFFLOAD_BUILT && !self.inner.device_is_host()
    }

    /// Copy an array to the device. Returns its device address.
    fn create(&self, array: &Bound<'_, PyAny>) -> PyResult<u64> {
        with_host_slice(array, |host| match host {
            HostSlice::F64(s) => self.inner.create(s),
            HostSlice::U8(s) => self.inner.create(s),
        })
        .map(|ptr| ptr.0)
    }

    fn update_device(&self, array: &Bound<'_, PyAny>) -> PyResult<()> {
        with_host_slice(array, |host| match host {
            HostSlice::F64(s) => self.inner.update_device(s),
            HostSlice::U8(s) => self.inner.update_device(s),
        })
    }

    fn update_host(&self, array: &Bound<'_, PyAny>) -> PyResult<()> {
        with_host_slice_mut(array, |host| match host {
            HostSliceMut::F64(s) => self.inner.update_host(s),
            HostSliceMut::U8(s) => self.inner.update_host(s),
        })
    }

    fn delete(&self, array: &Bound<'_, PyAny>) -> PyResult<()> {
        with_host_slice(array, |host| match host {
            HostSlice::F64(s) => self.inner.delete(s),
            HostSlice::U8(s) => self.inner.delete(s),
        })
    }

    fn present(&self, array: &Bound<'_, PyAny>) -> PyResult<bool> {
        with_host_slice(array, |host| {
            Ok(match host {
                HostSlice::F64(s) => self.inner.present(s),
                HostSlice::U8(s) => self.inner.present(s),
            })
        })
    }

    fn __repr__(&self) -> String {
        format!(
            "AccelContext(device={}, resident={})",
            self.inner.current_device().0,
            self.inner.n_resident()
        )
    }
}

#[pymodule]
fn _offset_template_impl(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_wrapped(wrap_pyfunction!(template_offset_add_to_signal))?;
    m.add_wrapped(wrap_pyfunction!(template_offset_project_signal))?;
    m.add_wrapped(wrap_pyfunction!(template_offset_apply_diag_precond))?;
    m.add_class::<AccelContext>()?;
    m.add("OFFLOAD_BUILT", OFFLOAD_BUILT)?;
    Ok(())
}
