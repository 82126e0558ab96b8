//! Shape-checked views of caller buffers.
//!
//! Every buffer crossing into the operators is checked against an expected
//! shape first. `None` in an expected shape accepts any extent along that axis.

use crate::template_offset::types::OffsetError;
use ndarray::{ArrayView2, ArrayViewMut2};

fn format_expected(expected: &[Option<usize>]) -> String {
    let dims: Vec<String> = expected
        .iter()
        .map(|d| match d {
            Some(n) => n.to_string(),
            None => "any".to_string(),
        })
        .collect();
    format!("[{}]", dims.join(", "))
}

/// Accept `actual` if it has the rank of `expected` and matches every fixed extent.
pub fn expect_shape(
    name: &'static str,
    actual: &[usize],
    expected: &[Option<usize>],
) -> Result<(), OffsetError> {
    let matches = actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(&a, e)| e.map_or(true, |e| e == a));
    if matches {
        Ok(())
    } else {
        Err(OffsetError::ShapeMismatch {
            name,
            expected: format_expected(expected),
            actual: actual.to_vec(),
        })
    }
}

/// Check that `index` selects an existing row.
pub fn expect_row(name: &'static str, index: usize, n_rows: usize) -> Result<(), OffsetError> {
    if index < n_rows {
        Ok(())
    } else {
        Err(OffsetError::RowOutOfRange {
            name,
            index: index as i64,
            n_rows,
        })
    }
}

/// Flat row-major slice of a 2-D view.
pub fn contiguous<'a, T>(
    name: &'static str,
    view: &'a ArrayView2<'_, T>,
) -> Result<&'a [T], OffsetError> {
    view.as_slice().ok_or(OffsetError::NotContiguous { name })
}

/// Flat row-major mutable slice of a 2-D view.
pub fn contiguous_mut<'a, T>(
    name: &'static str,
    view: &'a mut ArrayViewMut2<'_, T>,
) -> Result<&'a mut [T], OffsetError> {
    view.as_slice_mut().ok_or(OffsetError::NotContiguous { name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array2};

    #[test]
    fn test_expect_shape() {
        assert!(expect_shape("amplitudes", &[10], &[None]).is_ok());
        assert!(expect_shape("det_data", &[2, 100], &[None, Some(100)]).is_ok());

        let err = expect_shape("amplitudes_out", &[4], &[Some(5)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "amplitudes_out has shape [4], expected [5]"
        );

        let rank = expect_shape("det_data", &[200], &[None, None]).unwrap_err();
        assert_eq!(
            rank,
            OffsetError::ShapeMismatch {
                name: "det_data",
                expected: "[any, any]".into(),
                actual: vec![200],
            }
        );
    }

    #[test]
    fn test_expect_row() {
        assert!(expect_row("det_data", 1, 2).is_ok());
        assert!(expect_row("det_data", 2, 2).is_err());
    }

    #[test]
    fn test_contiguous() {
        let a = Array2::<f64>::zeros((3, 4));
        let v = a.view();
        assert_eq!(contiguous("det_data", &v).unwrap().len(), 12);

        let t = a.t();
        assert_eq!(
            contiguous("det_data", &t),
            Err(OffsetError::NotContiguous { name: "det_data" })
        );

        let mut b = Array2::<f64>::zeros((4, 6));
        let mut strided = b.slice_mut(s![.., ..;2]);
        assert!(contiguous_mut("det_data", &mut strided).is_err());
    }
}
