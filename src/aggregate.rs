//! Area-weighted aggregation of a gridded field over regions and time buckets.
use std::ops::Range;

use error_stack::ResultExt;
use ndarray::Array2;
use serde::Deserialize;

use crate::{
    calendar::{BucketKey, Granularity, TimeAxis, YearWindow},
    field::FieldSource,
    regions::RegionGrid,
};

/// Maximum difference (in degrees) between a field's coordinates and its grid's.
pub const COORD_TOLERANCE: f64 = 1e-4;

/// Default number of time steps read at once.
pub const DEFAULT_TIME_CHUNK: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Field does not match grid '{grid}': {reason}")]
    GridMismatch { grid: String, reason: String },
    #[error("Time axis has {axis} steps but the field has {field}")]
    TimeLengthMismatch { axis: usize, field: usize },
    #[error("Error reading the field")]
    ReadFailed,
}

/// What to compute for each region and time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Sum of value × area over all pixels and time steps in the bucket, e.g. total
    /// biomass from a density.
    Sum,
    /// Mean over the bucket's time steps of each pixel, averaged over the region
    /// weighted by pixel area.
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSpec {
    pub granularity: Granularity,
    pub statistic: Statistic,
    /// Multiplied into every output value (e.g. 1e-6 to go from grams to tonnes)
    pub unit_scale: f64,
    /// Only time steps in these years are used
    pub window: Option<YearWindow>,
    /// Maximum number of time steps to read at once
    pub time_chunk: usize,
}

impl AggregationSpec {
    pub fn new(granularity: Granularity, statistic: Statistic) -> Self {
        Self { granularity, statistic, unit_scale: 1.0, window: None, time_chunk: DEFAULT_TIME_CHUNK }
    }

    pub fn with_unit_scale(mut self, unit_scale: f64) -> Self {
        self.unit_scale = unit_scale;
        self
    }

    pub fn with_window(mut self, window: Option<YearWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn with_time_chunk(mut self, time_chunk: usize) -> Self {
        self.time_chunk = time_chunk.max(1);
        self
    }
}

/// Result of an aggregation: one row per time bucket, one column per region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTable {
    pub granularity: Granularity,
    pub buckets: Vec<BucketKey>,
    /// Row labels. For monthly tables this is the first time coordinate in the bucket,
    /// for annual tables the year.
    pub row_labels: Vec<String>,
    pub regions: Vec<String>,
    pub region_codes: Vec<Option<f64>>,
    /// (bucket, region) values, NaN where a region had no valid data in a bucket
    pub values: Array2<f64>,
}

impl RegionTable {
    /// Name of the row index: "time" for monthly tables, "year" for annual ones.
    pub fn index_name(&self) -> &'static str {
        match self.granularity {
            Granularity::Month => "time",
            Granularity::Year => "year",
        }
    }

    pub fn n_rows(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Value for the given bucket and region label, if both exist.
    pub fn get(&self, bucket: BucketKey, region: &str) -> Option<f64> {
        let row = self.buckets.iter().position(|b| *b == bucket)?;
        let col = self.regions.iter().position(|r| r == region)?;
        Some(self.values[[row, col]])
    }
}

/// Check that a field's coordinates are those of `grid`.
pub fn check_coordinates(grid: &RegionGrid, lat: &[f64], lon: &[f64]) -> Result<(), AggregateError> {
    for (axis, field_coords, grid_coords) in [("latitude", lat, grid.lat()), ("longitude", lon, grid.lon())] {
        if field_coords.len() != grid_coords.len() {
            return Err(AggregateError::GridMismatch {
                grid: grid.name().to_string(),
                reason: format!("field has {} {axis} points, grid has {}", field_coords.len(), grid_coords.len()),
            });
        }

        let max_diff = field_coords
            .iter()
            .zip(grid_coords)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        if max_diff > COORD_TOLERANCE || field_coords.iter().any(|c| !c.is_finite()) {
            return Err(AggregateError::GridMismatch {
                grid: grid.name().to_string(),
                reason: format!("{axis} values differ by up to {max_diff}"),
            });
        }
    }
    Ok(())
}

pub struct Aggregator<'g> {
    grid: &'g RegionGrid,
    spec: AggregationSpec,
}

impl<'g> Aggregator<'g> {
    pub fn new(grid: &'g RegionGrid, spec: AggregationSpec) -> Self {
        Self { grid, spec }
    }

    /// Aggregate `field`, whose time coordinates are `axis`.
    pub fn aggregate<F: FieldSource>(&self, field: &F, axis: &TimeAxis) -> error_stack::Result<RegionTable, AggregateError> {
        if field.grid_shape() != self.grid.shape() {
            return Err(AggregateError::GridMismatch {
                grid: self.grid.name().to_string(),
                reason: format!("field is {:?} (lat, lon), grid is {:?}", field.grid_shape(), self.grid.shape()),
            }
            .into());
        }
        if axis.len() != field.n_steps() {
            return Err(AggregateError::TimeLengthMismatch { axis: axis.len(), field: field.n_steps() }.into());
        }

        let buckets = axis.buckets(self.spec.granularity, self.spec.window);
        let n_regions = self.grid.regions().len();
        let mut values = Array2::from_elem((buckets.len(), n_regions), f64::NAN);
        let mut row_labels = Vec::with_capacity(buckets.len());

        for (row, (key, steps)) in buckets.iter().enumerate() {
            let region_values = match self.spec.statistic {
                Statistic::Sum => self.bucket_sum(field, steps),
                Statistic::Mean => self.bucket_mean(field, steps),
            }
            .attach_printable_lazy(|| format!("While aggregating time bucket {key}"))?;

            for (col, v) in region_values.into_iter().enumerate() {
                values[[row, col]] = v * self.spec.unit_scale;
            }

            row_labels.push(match self.spec.granularity {
                // Steps are never empty: a bucket only exists if a step was put in it
                Granularity::Month => steps.first().map(|&i| axis.coords()[i].to_string()).unwrap_or_else(|| key.to_string()),
                Granularity::Year => key.to_string(),
            });
        }

        log::debug!(
            "Aggregated {} time steps into {} buckets over {n_regions} regions of grid '{}'",
            axis.len(),
            buckets.len(),
            self.grid.name()
        );

        Ok(RegionTable {
            granularity: self.spec.granularity,
            buckets: buckets.into_keys().collect(),
            row_labels,
            regions: self.grid.region_labels(),
            region_codes: self.grid.regions().iter().map(|r| r.code).collect(),
            values,
        })
    }

    /// Call `f(pixel_index, value)` for every valid value of every region pixel in the given steps.
    fn for_each_value<F: FieldSource, G: FnMut(usize, f64)>(&self, field: &F, steps: &[usize], mut f: G) -> error_stack::Result<(), AggregateError> {
        let (_, n_lon) = self.grid.shape();
        for run in contiguous_runs(steps, self.spec.time_chunk) {
            let chunk = field.read_steps(run.clone()).change_context(AggregateError::ReadFailed)?;
            for t in 0..run.len() {
                for (p, pixel) in self.grid.pixels().iter().enumerate() {
                    let v = chunk[[t, pixel.flat_index / n_lon, pixel.flat_index % n_lon]];
                    if v.is_finite() {
                        f(p, v);
                    }
                }
            }
        }
        Ok(())
    }

    fn bucket_sum<F: FieldSource>(&self, field: &F, steps: &[usize]) -> error_stack::Result<Vec<f64>, AggregateError> {
        let pixels = self.grid.pixels();
        let n_regions = self.grid.regions().len();
        let mut sums = vec![0.0; n_regions];
        let mut seen = vec![false; n_regions];

        self.for_each_value(field, steps, |p, v| {
            let pixel = &pixels[p];
            sums[pixel.region] += v * pixel.area;
            seen[pixel.region] = true;
        })?;

        Ok(sums.into_iter().zip(seen).map(|(s, seen)| if seen { s } else { f64::NAN }).collect())
    }

    fn bucket_mean<F: FieldSource>(&self, field: &F, steps: &[usize]) -> error_stack::Result<Vec<f64>, AggregateError> {
        let pixels = self.grid.pixels();
        let mut pixel_sums = vec![0.0; pixels.len()];
        let mut pixel_counts = vec![0usize; pixels.len()];

        self.for_each_value(field, steps, |p, v| {
            pixel_sums[p] += v;
            pixel_counts[p] += 1;
        })?;

        let n_regions = self.grid.regions().len();
        let mut weighted = vec![0.0; n_regions];
        let mut seen = vec![false; n_regions];
        for ((pixel, sum), n) in pixels.iter().zip(pixel_sums).zip(pixel_counts) {
            if n > 0 {
                weighted[pixel.region] += sum / n as f64 * pixel.area;
                seen[pixel.region] = true;
            }
        }

        // The denominator is the whole region's area, including pixels without data
        let means = weighted
            .into_iter()
            .zip(seen)
            .zip(self.grid.regions())
            .map(|((w, seen), region)| if seen && region.total_area > 0.0 { w / region.total_area } else { f64::NAN })
            .collect();
        Ok(means)
    }
}

/// Split sorted step indices into ranges of consecutive steps no longer than `max_len`.
pub(crate) fn contiguous_runs(steps: &[usize], max_len: usize) -> Vec<Range<usize>> {
    let max_len = max_len.max(1);
    let mut runs: Vec<Range<usize>> = vec![];
    for &i in steps {
        match runs.last_mut() {
            Some(run) if run.end == i && run.len() < max_len => run.end += 1,
            _ => runs.push(i..i + 1),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::{
        calendar::{from_year_range, normalize_time},
        field::InMemoryField,
        regions::tests::two_by_two_grid,
    };

    fn annual_axis(n: usize) -> TimeAxis {
        from_year_range(2000, 2000 + n as i32 - 1, n).unwrap()
    }

    #[test]
    fn test_two_by_two_sum_and_mean() {
        let grid = two_by_two_grid();
        let field = InMemoryField::new(Array3::ones((1, 2, 2)));
        let axis = annual_axis(1);

        let sums = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Sum))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(sums.regions, vec!["A", "B"]);
        assert_eq!(sums.get(BucketKey::Year(2000), "A"), Some(2.0));
        assert_eq!(sums.get(BucketKey::Year(2000), "B"), Some(4.0));

        let means = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Mean))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(means.get(BucketKey::Year(2000), "A"), Some(1.0));
        assert_eq!(means.get(BucketKey::Year(2000), "B"), Some(1.0));
        assert_eq!(means.row_labels, vec!["2000"]);
        assert_eq!(means.index_name(), "year");
    }

    #[test]
    fn test_all_null_region_is_nan() {
        let grid = two_by_two_grid();
        let mut data = Array3::ones((2, 2, 2));
        data[[0, 1, 0]] = f64::NAN;
        data[[0, 1, 1]] = f64::NAN;
        data[[1, 1, 0]] = f64::NAN;
        data[[1, 1, 1]] = f64::NAN;
        let field = InMemoryField::new(data);
        let axis = annual_axis(2);

        for statistic in [Statistic::Sum, Statistic::Mean] {
            let table = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, statistic))
                .aggregate(&field, &axis)
                .unwrap();
            assert!(table.get(BucketKey::Year(2001), "B").unwrap().is_nan());
            assert!(table.get(BucketKey::Year(2001), "A").unwrap().is_finite());
        }
    }

    #[test]
    fn test_partial_nulls() {
        // One pixel of region B missing: the sum skips it, the mean still divides by the
        // whole region's area
        let grid = two_by_two_grid();
        let mut data = Array3::ones((1, 2, 2));
        data[[0, 1, 1]] = f64::NAN;
        let field = InMemoryField::new(data);
        let axis = annual_axis(1);

        let sums = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Sum))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(sums.get(BucketKey::Year(2000), "B"), Some(2.0));

        let means = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Mean))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(means.get(BucketKey::Year(2000), "B"), Some(0.5));
    }

    #[test]
    fn test_monthly_rows() {
        let grid = two_by_two_grid();
        let field = InMemoryField::new(Array3::from_shape_fn((24, 2, 2), |(t, _, _)| t as f64));
        let axis = from_year_range(2001, 2002, 24).unwrap();

        let spec = AggregationSpec::new(Granularity::Month, Statistic::Sum).with_unit_scale(0.5);
        let table = Aggregator::new(&grid, spec).aggregate(&field, &axis).unwrap();
        assert_eq!(table.n_rows(), 24);
        assert!(table.buckets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(table.row_labels[0], "2001-01-01");
        assert_eq!(table.row_labels[23], "2002-12-01");
        // step 13 is Feb 2002; region A has area 2, so 13 * 2 * 0.5
        assert_eq!(table.get(BucketKey::Month { year: 2002, month: 2 }, "A"), Some(13.0));
    }

    #[test]
    fn test_monthly_labels_use_first_timestamp() {
        let grid = two_by_two_grid();
        let offsets: Vec<f64> = (0..59).map(|d| d as f64).collect();
        let axis = normalize_time(&offsets, "days since 1990-01-15", None).unwrap();
        let field = InMemoryField::new(Array3::ones((59, 2, 2)));
        let table = Aggregator::new(&grid, AggregationSpec::new(Granularity::Month, Statistic::Sum))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(table.row_labels, vec!["1990-01-15", "1990-02-01", "1990-03-01"]);
        // 17 days in January, each day contributes 2 over region A
        assert_eq!(table.values[[0, 0]], 34.0);
    }

    #[test]
    fn test_yearly_rows_from_labels() {
        // Dates before 1677 cannot be timestamps, so the axis is (year, month) labels
        let grid = two_by_two_grid();
        let offsets: Vec<f64> = (0..24).map(|m| m as f64 + 0.5).collect();
        let axis = normalize_time(&offsets, "months since 1601-1-1", None).unwrap();
        assert!(axis.uses_labels());

        let field = InMemoryField::new(Array3::from_shape_fn((24, 2, 2), |(t, _, _)| if t < 12 { 1.0 } else { 3.0 }));
        let table = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Mean))
            .aggregate(&field, &axis)
            .unwrap();
        assert_eq!(table.buckets, vec![BucketKey::Year(1601), BucketKey::Year(1602)]);
        assert_eq!(table.row_labels, vec!["1601", "1602"]);
        assert_eq!(table.get(BucketKey::Year(1601), "A"), Some(1.0));
        assert_eq!(table.get(BucketKey::Year(1602), "B"), Some(3.0));
    }

    #[test]
    fn test_window_and_chunking() {
        let grid = two_by_two_grid();
        let field = InMemoryField::new(Array3::from_shape_fn((36, 2, 2), |(t, i, j)| (t + i + j) as f64));
        let axis = from_year_range(2014, 2016, 36).unwrap();

        let spec = AggregationSpec::new(Granularity::Year, Statistic::Mean)
            .with_window(Some(YearWindow { first: 2015, last: 2016 }));
        let chunked = Aggregator::new(&grid, spec.with_time_chunk(5)).aggregate(&field, &axis).unwrap();
        let unchunked = Aggregator::new(&grid, spec.with_time_chunk(36)).aggregate(&field, &axis).unwrap();
        assert_eq!(chunked.buckets, vec![BucketKey::Year(2015), BucketKey::Year(2016)]);
        assert_eq!(chunked, unchunked);
    }

    #[test]
    fn test_mismatches() {
        let grid = two_by_two_grid();
        let field = InMemoryField::new(Array3::ones((1, 3, 2)));
        let agg = Aggregator::new(&grid, AggregationSpec::new(Granularity::Year, Statistic::Sum));
        let e = agg.aggregate(&field, &annual_axis(1)).unwrap_err();
        assert!(matches!(e.current_context(), AggregateError::GridMismatch { .. }));

        let field = InMemoryField::new(Array3::ones((2, 2, 2)));
        let e = agg.aggregate(&field, &annual_axis(1)).unwrap_err();
        assert!(matches!(e.current_context(), AggregateError::TimeLengthMismatch { .. }));

        assert!(check_coordinates(&grid, &[-0.5, 0.5], &[10.50001, 11.5]).is_ok());
        assert!(check_coordinates(&grid, &[-0.5, 0.5], &[10.0, 11.0]).is_err());
        assert!(check_coordinates(&grid, &[-0.5], &[10.5, 11.5]).is_err());
    }

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(contiguous_runs(&[0, 1, 2, 5, 6, 9], 12), vec![0..3, 5..7, 9..10]);
        assert_eq!(contiguous_runs(&[0, 1, 2, 3, 4], 2), vec![0..2, 2..4, 4..5]);
        assert!(contiguous_runs(&[], 12).is_empty());
    }
}
