//! Area-weight and region-label rasters.
//!
//! A [`RegionGrid`] pairs the per-pixel area of a model grid with the region each
//! pixel belongs to (EEZ, FAO area, reef zone, ...). It is built once per run and
//! shared read-only by every file aggregated on that grid.
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::Array2;

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("Area raster has shape {area:?} but the region labels have shape {labels:?}")]
    ShapeMismatch { area: (usize, usize), labels: (usize, usize) },
    #[error("Grid has {n_lat} latitudes and {n_lon} longitudes but the rasters have shape {shape:?}")]
    CoordinateMismatch { n_lat: usize, n_lon: usize, shape: (usize, usize) },
    #[error("Pixel at index ({0}, {1}) has a negative area")]
    NegativeArea(usize, usize),
    #[error("Grid contains no pixels assigned to a region")]
    NoRegions,
}

/// One region of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Label used for table columns.
    pub label: String,
    /// Numeric code from the mask raster, if the mask was numeric.
    pub code: Option<f64>,
    /// Sum of the area of every pixel in this region, in the raster's area unit (normally m²).
    pub total_area: f64,
}

/// A pixel that belongs to a region and has a known area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionPixel {
    /// Row-major index into a (lat, lon) slab
    pub flat_index: usize,
    /// Index into [`RegionGrid::regions`]
    pub region: usize,
    pub area: f64,
}

#[derive(Debug, Clone)]
pub struct RegionGrid {
    name: String,
    lat: Vec<f64>,
    lon: Vec<f64>,
    regions: Vec<Region>,
    pixels: Vec<RegionPixel>,
}

impl RegionGrid {
    /// Build a grid from an area raster and a numeric region mask. Pixels whose mask
    /// value or area is NaN belong to no region.
    pub fn from_codes(name: &str, lat: Vec<f64>, lon: Vec<f64>, area: Array2<f64>, codes: Array2<f64>) -> Result<Self, RegionError> {
        let labels = codes.mapv(|c| if c.is_finite() { Some((format_code(c), Some(c))) } else { None });
        Self::build(name, lat, lon, area, labels)
    }

    /// Build a grid from an area raster and categorical region names.
    pub fn from_names(name: &str, lat: Vec<f64>, lon: Vec<f64>, area: Array2<f64>, names: Array2<Option<String>>) -> Result<Self, RegionError> {
        let labels = names.mapv(|n| n.map(|s| (s, None)));
        Self::build(name, lat, lon, area, labels)
    }

    fn build(
        name: &str,
        lat: Vec<f64>,
        lon: Vec<f64>,
        area: Array2<f64>,
        labels: Array2<Option<(String, Option<f64>)>>,
    ) -> Result<Self, RegionError> {
        if area.dim() != labels.dim() {
            return Err(RegionError::ShapeMismatch { area: area.dim(), labels: labels.dim() });
        }
        if area.dim() != (lat.len(), lon.len()) {
            return Err(RegionError::CoordinateMismatch { n_lat: lat.len(), n_lon: lon.len(), shape: area.dim() });
        }

        // Regions keep the order in which they first appear in the mask
        let mut totals: IndexMap<String, (Option<f64>, f64)> = IndexMap::new();
        let mut pixels = vec![];
        for (((i, j), &a), label) in area.indexed_iter().zip(labels.iter()) {
            let Some((label, code)) = label else {
                continue;
            };
            if !a.is_finite() {
                continue;
            }
            if a < 0.0 {
                return Err(RegionError::NegativeArea(i, j));
            }

            let entry = totals.entry(label.clone());
            let region = entry.index();
            entry.or_insert((*code, 0.0)).1 += a;
            pixels.push(RegionPixel { flat_index: i * lon.len() + j, region, area: a });
        }

        if totals.is_empty() {
            return Err(RegionError::NoRegions);
        }

        let regions = totals
            .into_iter()
            .map(|(label, (code, total_area))| Region { label, code, total_area })
            .collect_vec();

        log::debug!("Grid '{name}' has {} regions over {} pixels", regions.len(), pixels.len());
        Ok(Self { name: name.to_string(), lat, lon, regions, pixels })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    pub fn lat(&self) -> &[f64] {
        &self.lat
    }

    pub fn lon(&self) -> &[f64] {
        &self.lon
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_labels(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.label.clone()).collect()
    }

    pub fn pixels(&self) -> &[RegionPixel] {
        &self.pixels
    }

    /// Total area per region, in region order.
    pub fn total_areas(&self) -> Vec<f64> {
        self.regions.iter().map(|r| r.total_area).collect()
    }
}

/// Integer codes print without a decimal point so that column names match the mask
/// file (e.g. "8312" rather than "8312.0").
fn format_code(code: f64) -> String {
    if code.fract() == 0.0 && code.abs() < 1e15 {
        format!("{}", code as i64)
    } else {
        format!("{code}")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::array;

    use super::*;

    /// 2x2 grid with areas [1, 1, 2, 2] and regions [A, A, B, B]
    pub(crate) fn two_by_two_grid() -> RegionGrid {
        let area = array![[1.0, 1.0], [2.0, 2.0]];
        let names = array![[Some("A".to_string()), Some("A".to_string())], [Some("B".to_string()), Some("B".to_string())]];
        RegionGrid::from_names("test", vec![-0.5, 0.5], vec![10.5, 11.5], area, names).unwrap()
    }

    #[test]
    fn test_total_area() {
        let grid = two_by_two_grid();
        assert_eq!(grid.region_labels(), vec!["A", "B"]);
        assert_eq!(grid.total_areas(), vec![2.0, 4.0]);
        assert_eq!(grid.pixels().len(), 4);
    }

    #[test]
    fn test_insertion_order_and_gaps() {
        let area = array![[1.0, f64::NAN, 3.0], [4.0, 5.0, 6.0]];
        let codes = array![[20.0, 20.0, 5.0], [f64::NAN, 20.0, 5.0]];
        let grid = RegionGrid::from_codes("codes", vec![0.0, 1.0], vec![0.0, 1.0, 2.0], area, codes).unwrap();
        // 20 appears first, so it comes first even though 5 < 20
        assert_eq!(grid.region_labels(), vec!["20", "5"]);
        assert_eq!(grid.regions()[0].code, Some(20.0));
        assert_eq!(grid.total_areas(), vec![6.0, 9.0]);
        // NaN area and NaN label pixels are excluded
        assert_eq!(grid.pixels().len(), 4);
    }

    #[test]
    fn test_bad_rasters() {
        let e = RegionGrid::from_codes("bad", vec![0.0], vec![0.0, 1.0], array![[1.0, 1.0]], array![[1.0]]);
        assert!(matches!(e, Err(RegionError::ShapeMismatch { .. })));

        let e = RegionGrid::from_codes("bad", vec![0.0], vec![0.0], array![[-1.0]], array![[1.0]]);
        assert!(matches!(e, Err(RegionError::NegativeArea(0, 0))));

        let e = RegionGrid::from_codes("bad", vec![0.0], vec![0.0], array![[1.0]], array![[f64::NAN]]);
        assert!(matches!(e, Err(RegionError::NoRegions)));
    }
}
