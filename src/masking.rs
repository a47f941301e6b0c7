//! Guard against "no data" encoded as a large magic number.
//!
//! Most model output marks missing values with a proper `_FillValue`, which the
//! reader turns into NaN. Some files instead write a very large number (usually
//! 1e20) without declaring it. The rule applied here: if a file contains no
//! non-finite values at all, every value at or above the sentinel threshold is
//! treated as missing. A file that already has NaNs is assumed to have its missing
//! values flagged properly and is left alone, which also makes masking idempotent.
//!
//! The per-file decision is made in [`crate::field::should_mask_sentinels`].
use ndarray::{ArrayBase, DataMut, Dimension};

/// Values at or above this are "no data" in fields without declared missing values.
pub const SENTINEL_THRESHOLD: f64 = 1e20;

/// Count the non-finite values in a sequence.
pub fn count_non_finite<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> usize {
    values.into_iter().filter(|v| !v.is_finite()).count()
}

/// Replace every value `>= threshold` with NaN, returning how many were replaced.
pub fn apply_sentinel_mask<S, D>(values: &mut ArrayBase<S, D>, threshold: f64) -> usize
where
    S: DataMut<Elem = f64>,
    D: Dimension,
{
    let mut n = 0;
    values.map_inplace(|v| {
        if *v >= threshold {
            *v = f64::NAN;
            n += 1;
        }
    });
    n
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_masks_sentinels() {
        let mut field = array![[1.0, 1e20], [2e20, 3.0]];
        assert_eq!(apply_sentinel_mask(&mut field, SENTINEL_THRESHOLD), 2);
        assert_eq!(field[[0, 0]], 1.0);
        assert!(field[[0, 1]].is_nan());
        assert!(field[[1, 0]].is_nan());
        assert_eq!(field[[1, 1]], 3.0);

        // NaN never compares >= the threshold, so a second pass changes nothing
        assert_eq!(apply_sentinel_mask(&mut field, SENTINEL_THRESHOLD), 0);
        assert_eq!(count_non_finite(field.iter()), 2);
    }

    #[test]
    fn test_field_without_sentinels() {
        let mut field = array![0.0, -1e25, 9.9e19];
        assert_eq!(apply_sentinel_mask(&mut field, SENTINEL_THRESHOLD), 0);
        assert_eq!(field, array![0.0, -1e25, 9.9e19]);
    }

    #[test]
    fn test_count_non_finite() {
        let field = array![f64::NAN, 1.0, f64::INFINITY, 1e20];
        assert_eq!(count_non_finite(field.iter()), 2);
    }
}
