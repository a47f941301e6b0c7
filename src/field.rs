//! Time-chunked access to one (time, lat, lon) slab of a gridded variable.
//!
//! The aggregator never holds a whole variable in memory. It asks a [`FieldSource`]
//! for a few time steps at a time, so a field can come from a NetCDF variable (see
//! [`crate::netcdf_io::NcField`]), from an in-memory array, or from a wrapper that
//! fixes up values on the way through such as [`SentinelMasked`].
use std::ops::Range;

use error_stack::ResultExt;
use ndarray::{s, Array3};

use crate::masking::{apply_sentinel_mask, count_non_finite, SENTINEL_THRESHOLD};

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("Requested time steps {start}..{end} but the field only has {n_steps}")]
    OutOfRange { start: usize, end: usize, n_steps: usize },
    #[error("Could not read values of '{0}'")]
    ReadFailed(String),
    #[error("Read {got} values for '{var}', expected {expected}")]
    WrongSize { var: String, got: usize, expected: usize },
}

/// A gridded field that can be read a range of time steps at a time.
pub trait FieldSource {
    /// Number of time steps in the field.
    fn n_steps(&self) -> usize;

    /// Number of (latitude, longitude) points.
    fn grid_shape(&self) -> (usize, usize);

    /// Read time steps `steps` as a (time, lat, lon) array. Missing values must be NaN.
    fn read_steps(&self, steps: Range<usize>) -> error_stack::Result<Array3<f64>, FieldError>;
}

pub(crate) fn check_range(steps: &Range<usize>, n_steps: usize) -> Result<(), FieldError> {
    if steps.start > steps.end || steps.end > n_steps {
        Err(FieldError::OutOfRange { start: steps.start, end: steps.end, n_steps })
    } else {
        Ok(())
    }
}

/// A field already in memory.
#[derive(Debug, Clone)]
pub struct InMemoryField {
    data: Array3<f64>,
}

impl InMemoryField {
    pub fn new(data: Array3<f64>) -> Self {
        Self { data }
    }
}

impl FieldSource for InMemoryField {
    fn n_steps(&self) -> usize {
        self.data.dim().0
    }

    fn grid_shape(&self) -> (usize, usize) {
        let (_, nlat, nlon) = self.data.dim();
        (nlat, nlon)
    }

    fn read_steps(&self, steps: Range<usize>) -> error_stack::Result<Array3<f64>, FieldError> {
        check_range(&steps, self.n_steps())?;
        Ok(self.data.slice(s![steps, .., ..]).to_owned())
    }
}

/// Counts from scanning a field for missing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SentinelScan {
    /// Number of NaN or infinite values seen
    pub n_non_finite: usize,
    /// Number of values at or above the threshold seen
    pub n_sentinel: usize,
}

impl SentinelScan {
    /// Whether a field with these counts should have its sentinels masked.
    pub fn needs_masking(&self) -> bool {
        self.n_non_finite == 0
    }
}

/// Read `field` `chunk` time steps at a time, counting non-finite and sentinel values.
/// Stops at the end of the first chunk containing a non-finite value, since that is
/// enough to know the field flags its missing values properly.
pub fn scan_for_sentinels<F: FieldSource>(field: &F, chunk: usize, threshold: f64) -> error_stack::Result<SentinelScan, FieldError> {
    let chunk = chunk.max(1);
    let n_steps = field.n_steps();
    let mut scan = SentinelScan::default();
    let mut start = 0;
    while start < n_steps {
        let end = (start + chunk).min(n_steps);
        let values = field
            .read_steps(start..end)
            .attach_printable_lazy(|| format!("While scanning time steps {start}..{end} for missing values"))?;
        scan.n_non_finite += count_non_finite(values.iter());
        scan.n_sentinel += values.iter().filter(|&&v| v >= threshold).count();
        if scan.n_non_finite > 0 {
            break;
        }
        start = end;
    }
    Ok(scan)
}

/// Decide whether the sentinel rule applies to a file whose selected slabs are `fields`.
/// The rule looks at the file as a whole: if any slab has a properly flagged (non-finite)
/// value, none of them are masked.
pub fn should_mask_sentinels<F: FieldSource>(fields: &[F], chunk: usize) -> error_stack::Result<bool, FieldError> {
    let mut n_sentinel = 0;
    for field in fields {
        let scan = scan_for_sentinels(field, chunk, SENTINEL_THRESHOLD)?;
        if !scan.needs_masking() {
            return Ok(false);
        }
        n_sentinel += scan.n_sentinel;
    }
    if n_sentinel > 0 {
        log::info!("No flagged missing values, treating {n_sentinel} values >= {SENTINEL_THRESHOLD:e} as missing");
    }
    Ok(true)
}

/// Wraps a field whose missing values may be written as a huge number rather than
/// flagged. When active, every value at or above the threshold is returned as NaN.
///
/// Whether to activate it is decided once for a whole file: see [`should_mask_sentinels`].
#[derive(Debug)]
pub struct SentinelMasked<F: FieldSource> {
    inner: F,
    threshold: f64,
    active: bool,
}

impl<F: FieldSource> SentinelMasked<F> {
    pub fn new(inner: F, active: bool) -> Self {
        Self { inner, threshold: SENTINEL_THRESHOLD, active }
    }
}

impl<F: FieldSource> FieldSource for SentinelMasked<F> {
    fn n_steps(&self) -> usize {
        self.inner.n_steps()
    }

    fn grid_shape(&self) -> (usize, usize) {
        self.inner.grid_shape()
    }

    fn read_steps(&self, steps: Range<usize>) -> error_stack::Result<Array3<f64>, FieldError> {
        let mut values = self.inner.read_steps(steps)?;
        if self.active {
            apply_sentinel_mask(&mut values, self.threshold);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    #[test]
    fn test_in_memory_slicing() {
        let data = Array3::from_shape_fn((5, 2, 3), |(t, i, j)| (t * 100 + i * 10 + j) as f64);
        let field = InMemoryField::new(data);
        assert_eq!(field.n_steps(), 5);
        assert_eq!(field.grid_shape(), (2, 3));

        let chunk = field.read_steps(2..4).unwrap();
        assert_eq!(chunk.dim(), (2, 2, 3));
        assert_eq!(chunk[[0, 1, 2]], 212.0);
        assert_eq!(chunk[[1, 0, 0]], 300.0);

        let e = field.read_steps(4..6).unwrap_err();
        assert!(matches!(e.current_context(), FieldError::OutOfRange { .. }));
    }

    #[test]
    fn test_sentinel_wrapper() {
        let mut data = Array3::from_elem((3, 2, 2), 1.0);
        data[[2, 1, 1]] = 1e20;
        let fields = vec![InMemoryField::new(data.clone())];
        assert!(should_mask_sentinels(&fields, 1).unwrap());
        let field = SentinelMasked::new(fields.into_iter().next().unwrap(), true);
        let values = field.read_steps(0..3).unwrap();
        assert!(values[[2, 1, 1]].is_nan());
        assert_eq!(values[[2, 1, 0]], 1.0);

        // A NaN anywhere in the field (here in the last chunk) disables masking
        data[[2, 0, 0]] = f64::NAN;
        let fields = vec![InMemoryField::new(data)];
        assert!(!should_mask_sentinels(&fields, 2).unwrap());
        let field = SentinelMasked::new(fields.into_iter().next().unwrap(), false);
        let values = field.read_steps(2..3).unwrap();
        assert_eq!(values[[0, 1, 1]], 1e20);
    }

    #[test]
    fn test_sentinel_decision_covers_every_slab() {
        // A flagged value in the second slab leaves the first slab's sentinels alone too
        let first = InMemoryField::new(Array3::from_elem((2, 1, 2), 1e20));
        let mut second = Array3::from_elem((2, 1, 2), 4.0);
        second[[1, 0, 1]] = f64::NAN;
        let fields = vec![first.clone(), InMemoryField::new(second)];
        assert!(!should_mask_sentinels(&fields, 12).unwrap());

        assert!(should_mask_sentinels(&[first.clone(), first], 12).unwrap());
        assert!(should_mask_sentinels::<InMemoryField>(&[], 12).unwrap());
    }

    #[test]
    fn test_scan_stops_at_first_flagged_chunk() {
        let mut data = Array3::from_elem((4, 1, 1), 2e20);
        data[[1, 0, 0]] = f64::NAN;
        let scan = scan_for_sentinels(&InMemoryField::new(data), 2, SENTINEL_THRESHOLD).unwrap();
        assert_eq!(scan, SentinelScan { n_non_finite: 1, n_sentinel: 1 });
        assert!(!scan.needs_masking());
    }
}
