//! Reading model output and region masks from netCDF files, and writing aggregated
//! tables back out as netCDF.
use std::{
    collections::HashSet,
    ops::Range,
    path::{Path, PathBuf},
};

use error_stack::ResultExt;
use itertools::Itertools;
use ndarray::{Array2, Array3};
use netcdf::{AttributeValue, Extent, Extents};

use crate::{
    aggregate::RegionTable,
    calendar::{BucketKey, Granularity},
    field::{check_range, FieldError, FieldSource},
    regions::RegionGrid,
    selection::{AxisRole, FieldLayout},
};

#[derive(Debug, thiserror::Error)]
pub enum NcError {
    #[error("Could not open netCDF file {}", .0.display())]
    Open(PathBuf),
    #[error("File is missing the variable '{0}'")]
    MissingVariable(String),
    #[error("Variable '{var}' is missing the '{attr}' attribute")]
    MissingAttribute { var: String, attr: String },
    #[error("Attribute '{attr}' on '{var}' is not a string")]
    AttributeNotString { var: String, attr: String },
    #[error("Could not read values of '{0}'")]
    ReadVariable(String),
    #[error("Variable '{var}' has an unexpected shape: {reason}")]
    UnexpectedShape { var: String, reason: String },
    #[error("Could not build region grid '{0}'")]
    BadGrid(String),
    #[error("Could not create netCDF file {}", .0.display())]
    Create(PathBuf),
    #[error("An error occurred while {0}")]
    Write(String),
}

impl NcError {
    fn write<S: ToString>(ctx: S) -> Self {
        Self::Write(ctx.to_string())
    }
}

/// Interpret a numeric attribute as an `f64`.
fn attr_as_f64(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Double(v) => Some(*v),
        AttributeValue::Float(v) => Some(*v as f64),
        AttributeValue::Int(v) => Some(*v as f64),
        AttributeValue::Uint(v) => Some(*v as f64),
        AttributeValue::Short(v) => Some(*v as f64),
        AttributeValue::Ushort(v) => Some(*v as f64),
        AttributeValue::Schar(v) => Some(*v as f64),
        AttributeValue::Uchar(v) => Some(*v as f64),
        AttributeValue::Longlong(v) => Some(*v as f64),
        AttributeValue::Ulonglong(v) => Some(*v as f64),
        AttributeValue::Doubles(v) => v.first().copied(),
        AttributeValue::Floats(v) => v.first().map(|x| *x as f64),
        _ => None,
    }
}

fn numeric_attr(var: &netcdf::Variable, attr: &str) -> Option<f64> {
    var.attribute_value(attr).and_then(|r| r.ok()).and_then(|v| attr_as_f64(&v))
}

fn string_attr(var: &netcdf::Variable, attr: &str) -> Option<String> {
    match var.attribute_value(attr)?.ok()? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// How stored values map to physical ones.
#[derive(Debug, Clone, PartialEq)]
struct Packing {
    fill_values: Vec<f64>,
    scale_factor: Option<f64>,
    add_offset: Option<f64>,
}

impl Packing {
    fn from_variable(var: &netcdf::Variable) -> Self {
        let fill_values = ["_FillValue", "missing_value"]
            .into_iter()
            .filter_map(|a| numeric_attr(var, a))
            .filter(|v| !v.is_nan())
            .collect();
        Self { fill_values, scale_factor: numeric_attr(var, "scale_factor"), add_offset: numeric_attr(var, "add_offset") }
    }

    fn unpack(&self, values: &mut [f64]) {
        for v in values.iter_mut() {
            if self.fill_values.contains(v) {
                *v = f64::NAN;
                continue;
            }
            if let Some(scale) = self.scale_factor {
                *v *= scale;
            }
            if let Some(offset) = self.add_offset {
                *v += offset;
            }
        }
    }
}

/// A netCDF file opened for reading.
pub struct NcDataset {
    path: PathBuf,
    file: netcdf::File,
}

impl NcDataset {
    pub fn open(path: &Path) -> error_stack::Result<Self, NcError> {
        let file = netcdf::open(path).change_context_lazy(|| NcError::Open(path.to_path_buf()))?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    fn variable(&self, name: &str) -> Result<netcdf::Variable<'_>, NcError> {
        self.file.variable(name).ok_or_else(|| NcError::MissingVariable(name.to_string()))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.file.variable(name).is_some()
    }

    /// Names of the variables holding data, i.e. not coordinates, cell bounds or
    /// scalar metadata variables.
    pub fn data_variables(&self) -> Vec<String> {
        let dim_names: HashSet<String> = self.file.dimensions().map(|d| d.name()).collect();
        let mut auxiliary: HashSet<String> = HashSet::new();
        for var in self.file.variables() {
            for attr in ["bounds", "coordinates"] {
                if let Some(names) = string_attr(&var, attr) {
                    auxiliary.extend(names.split_whitespace().map(|s| s.to_string()));
                }
            }
        }

        self.file
            .variables()
            .filter(|v| !v.dimensions().is_empty())
            .map(|v| v.name())
            .filter(|n| !dim_names.contains(n) && !auxiliary.contains(n) && !n.ends_with("_bnds") && !n.ends_with("_bounds"))
            .collect()
    }

    /// The `(name, length)` dimensions of a variable.
    pub fn dimensions_of(&self, var: &str) -> Result<Vec<(String, usize)>, NcError> {
        let var = self.variable(var)?;
        Ok(var.dimensions().iter().map(|d| (d.name(), d.len())).collect())
    }

    /// Read a whole variable as `f64`, with fill values as NaN and packing undone.
    pub fn read_f64(&self, name: &str) -> error_stack::Result<Vec<f64>, NcError> {
        let var = self.variable(name)?;
        let mut values = var
            .get_values::<f64, _>(Extents::All)
            .change_context_lazy(|| NcError::ReadVariable(name.to_string()))?;
        Packing::from_variable(&var).unpack(&mut values);
        Ok(values)
    }

    /// Values of a coordinate variable, or `None` if the file has no such variable.
    pub fn coordinate(&self, name: &str) -> error_stack::Result<Option<Vec<f64>>, NcError> {
        if !self.has_variable(name) {
            return Ok(None);
        }
        self.read_f64(name).map(Some)
    }

    pub fn string_attribute(&self, var: &str, attr: &str) -> Result<Option<String>, NcError> {
        let var = self.variable(var)?;
        match var.attribute_value(attr) {
            None => Ok(None),
            Some(Ok(AttributeValue::Str(s))) => Ok(Some(s)),
            Some(_) => Err(NcError::AttributeNotString { var: var.name(), attr: attr.to_string() }),
        }
    }

    /// Read the time coordinate named `time_dim`: its raw values, `units` and `calendar`.
    pub fn time_values(&self, time_dim: &str) -> error_stack::Result<(Vec<f64>, String, Option<String>), NcError> {
        let values = self.read_f64(time_dim)?;
        let units = self
            .string_attribute(time_dim, "units")?
            .ok_or_else(|| NcError::MissingAttribute { var: time_dim.to_string(), attr: "units".to_string() })?;
        let calendar = self.string_attribute(time_dim, "calendar")?;
        Ok((values, units, calendar))
    }

    /// Latitude and longitude values of a variable's grid (its last two dimensions). If
    /// a dimension has no coordinate variable, its indices are returned.
    pub fn horizontal_coordinates(&self, var: &str) -> error_stack::Result<(Vec<f64>, Vec<f64>), NcError> {
        let dims = self.dimensions_of(var)?;
        let [.., (lat_name, n_lat), (lon_name, n_lon)] = dims.as_slice() else {
            return Err(NcError::UnexpectedShape { var: var.to_string(), reason: "fewer than two dimensions".to_string() }.into());
        };

        let read_axis = |name: &str, n: usize| -> error_stack::Result<Vec<f64>, NcError> {
            match self.coordinate(name)? {
                Some(values) => Ok(values),
                None => {
                    log::warn!("{} has no coordinate variable for dimension '{name}', using indices", self.path.display());
                    Ok((0..n).map(|i| i as f64).collect())
                }
            }
        };
        Ok((read_axis(lat_name, *n_lat)?, read_axis(lon_name, *n_lon)?))
    }

    /// A chunked reader of one (time, lat, lon) slab of `var`, fixing any level and bin
    /// axes at the given indices.
    pub fn field(&self, var: &str, layout: &FieldLayout, level: usize, bin: usize) -> error_stack::Result<NcField<'_>, NcError> {
        let variable = self.variable(var)?;
        let packing = Packing::from_variable(&variable);
        if let Some((name, n)) = &layout.level {
            if level >= *n {
                return Err(NcError::UnexpectedShape { var: var.to_string(), reason: format!("no level {level} on axis '{name}' of length {n}") }.into());
            }
        }
        if let Some(n) = layout.n_bins {
            if bin >= n {
                return Err(NcError::UnexpectedShape { var: var.to_string(), reason: format!("no bin {bin} on an axis of length {n}") }.into());
            }
        }
        Ok(NcField { name: var.to_string(), variable, layout: layout.clone(), level, bin, packing })
    }

    /// Load a region grid from a mask file holding an area variable and a numeric region
    /// variable on the same (lat, lon) grid. Areas are multiplied by `area_scale` (e.g.
    /// 1e6 to go from km² to m²).
    pub fn load_region_grid(&self, grid_name: &str, area_var: &str, mask_var: &str, area_scale: f64) -> error_stack::Result<RegionGrid, NcError> {
        let (lat, lon) = self.horizontal_coordinates(area_var)?;
        let shape = (lat.len(), lon.len());

        let to_raster = |name: &str| -> error_stack::Result<Array2<f64>, NcError> {
            let values = self.read_f64(name)?;
            Array2::from_shape_vec(shape, values).change_context_lazy(|| NcError::UnexpectedShape {
                var: name.to_string(),
                reason: format!("does not hold a single {} x {} (lat, lon) slab", shape.0, shape.1),
            })
        };

        let area = to_raster(area_var)?.mapv(|a| a * area_scale);
        let codes = to_raster(mask_var)?;
        RegionGrid::from_codes(grid_name, lat, lon, area, codes)
            .change_context_lazy(|| NcError::BadGrid(grid_name.to_string()))
            .attach_printable_lazy(|| format!("Grid file: {}", self.path.display()))
    }
}

/// One (time, lat, lon) slab of a netCDF variable, read lazily.
pub struct NcField<'f> {
    name: String,
    variable: netcdf::Variable<'f>,
    layout: FieldLayout,
    level: usize,
    bin: usize,
    packing: Packing,
}

impl<'f> NcField<'f> {
    fn extents(&self, steps: Range<usize>) -> Extents {
        let extents = self
            .layout
            .roles
            .iter()
            .map(|role| match role {
                AxisRole::Time => Extent::from(steps.clone()),
                AxisRole::Level => Extent::from(self.level..self.level + 1),
                AxisRole::Bin => Extent::from(self.bin..self.bin + 1),
                AxisRole::Singleton => Extent::from(0..1),
                AxisRole::Lat => Extent::from(0..self.layout.n_lat),
                AxisRole::Lon => Extent::from(0..self.layout.n_lon),
            })
            .collect_vec();
        Extents::Extent(extents)
    }
}

impl<'f> FieldSource for NcField<'f> {
    fn n_steps(&self) -> usize {
        self.layout.n_time
    }

    fn grid_shape(&self) -> (usize, usize) {
        (self.layout.n_lat, self.layout.n_lon)
    }

    fn read_steps(&self, steps: Range<usize>) -> error_stack::Result<Array3<f64>, FieldError> {
        check_range(&steps, self.n_steps())?;
        let shape = (steps.len(), self.layout.n_lat, self.layout.n_lon);
        if steps.is_empty() {
            return Ok(Array3::zeros(shape));
        }

        let mut values = self
            .variable
            .get_values::<f64, _>(self.extents(steps.clone()))
            .change_context_lazy(|| FieldError::ReadFailed(self.name.clone()))
            .attach_printable_lazy(|| format!("Time steps {}..{}", steps.start, steps.end))?;
        self.packing.unpack(&mut values);

        let got = values.len();
        Array3::from_shape_vec(shape, values)
            .change_context_lazy(|| FieldError::WrongSize { var: self.name.clone(), got, expected: shape.0 * shape.1 * shape.2 })
    }
}

/// Attributes to copy onto the data variable of an output file.
#[derive(Debug, Clone, Default)]
pub struct TableAttributes {
    pub long_name: Option<String>,
    pub units: Option<String>,
    pub source_file: Option<String>,
}

/// Write a region table as a netCDF file with dimensions (year, mask) for annual tables
/// or (time, mask) for monthly ones.
///
/// The `mask` coordinate holds the numeric region codes when every region has one;
/// otherwise it holds region indices with the labels in its `flag_meanings` attribute.
pub fn write_table_netcdf(path: &Path, var_name: &str, table: &RegionTable, attrs: &TableAttributes) -> error_stack::Result<(), NcError> {
    let mut file = netcdf::create(path).change_context_lazy(|| NcError::Create(path.to_path_buf()))?;
    let index_name = table.index_name();
    let (n_rows, n_regions) = table.values.dim();

    file.add_dimension(index_name, n_rows)
        .change_context_lazy(|| NcError::write(format!("adding the '{index_name}' dimension")))?;
    file.add_dimension("mask", n_regions)
        .change_context_lazy(|| NcError::write("adding the 'mask' dimension"))?;

    // Index coordinate: the year, or year * 100 + month for monthly tables
    let index_values = table
        .buckets
        .iter()
        .map(|b| match b {
            BucketKey::Year(y) => *y,
            BucketKey::Month { year, month } => year * 100 + *month as i32,
        })
        .collect_vec();
    let mut index_var = file
        .add_variable::<i32>(index_name, &[index_name])
        .change_context_lazy(|| NcError::write(format!("adding the '{index_name}' variable")))?;
    index_var
        .put_values(&index_values, Extents::All)
        .change_context_lazy(|| NcError::write(format!("writing the '{index_name}' values")))?;
    let index_desc = match table.granularity {
        Granularity::Year => "calendar year",
        Granularity::Month => "calendar year and month as YYYYMM",
    };
    index_var
        .put_attribute("long_name", index_desc)
        .change_context_lazy(|| NcError::write(format!("adding attributes to '{index_name}'")))?;

    let codes: Option<Vec<f64>> = table.region_codes.iter().copied().collect();
    match codes {
        Some(codes) => {
            let mut mask_var = file
                .add_variable::<f64>("mask", &["mask"])
                .change_context_lazy(|| NcError::write("adding the 'mask' variable"))?;
            mask_var
                .put_values(&codes, Extents::All)
                .change_context_lazy(|| NcError::write("writing the 'mask' values"))?;
        }
        None => {
            let indices = (0..n_regions as i32).collect_vec();
            let mut mask_var = file
                .add_variable::<i32>("mask", &["mask"])
                .change_context_lazy(|| NcError::write("adding the 'mask' variable"))?;
            mask_var
                .put_values(&indices, Extents::All)
                .change_context_lazy(|| NcError::write("writing the 'mask' values"))?;
            mask_var
                .put_attribute("flag_values", indices.clone())
                .change_context_lazy(|| NcError::write("adding attributes to 'mask'"))?;
            let meanings = table.regions.iter().map(|r| r.replace(' ', "_")).join(" ");
            mask_var
                .put_attribute("flag_meanings", meanings.as_str())
                .change_context_lazy(|| NcError::write("adding attributes to 'mask'"))?;
        }
    }

    let flat_values = table.values.iter().copied().collect_vec();
    let mut data_var = file
        .add_variable::<f64>(var_name, &[index_name, "mask"])
        .change_context_lazy(|| NcError::write(format!("adding the '{var_name}' variable")))?;
    data_var
        .put_attribute("_FillValue", f64::NAN)
        .change_context_lazy(|| NcError::write(format!("adding attributes to '{var_name}'")))?;
    for (name, value) in [("long_name", &attrs.long_name), ("units", &attrs.units)] {
        if let Some(value) = value {
            data_var
                .put_attribute(name, value.as_str())
                .change_context_lazy(|| NcError::write(format!("adding attributes to '{var_name}'")))?;
        }
    }
    data_var
        .put_values(&flat_values, Extents::All)
        .change_context_lazy(|| NcError::write(format!("writing the '{var_name}' values")))?;

    if let Some(source) = &attrs.source_file {
        file.add_attribute("source_file", source.as_str())
            .change_context_lazy(|| NcError::write("adding global attributes"))?;
    }
    let history = format!(
        "{} created by {} v{}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    file.add_attribute("history", history.as_str())
        .change_context_lazy(|| NcError::write("adding global attributes"))?;

    log::debug!("Wrote {} x {} table to {}", n_rows, n_regions, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack() {
        let packing = Packing { fill_values: vec![-999.0, 1e20], scale_factor: Some(0.5), add_offset: Some(10.0) };
        let mut values = vec![2.0, -999.0, 1e20, 0.0];
        packing.unpack(&mut values);
        assert_eq!(values[0], 11.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 10.0);
    }

    fn test_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("picts-netcdf-test-{name}-{}.nc", std::process::id()))
    }

    #[test]
    fn test_field_reads_one_level() {
        let path = test_path("level");
        {
            let mut nc = netcdf::create(&path).unwrap();
            nc.add_dimension("time", 3).unwrap();
            nc.add_dimension("olevel", 2).unwrap();
            nc.add_dimension("lat", 2).unwrap();
            nc.add_dimension("lon", 3).unwrap();
            // raw = 100 * t + 10 * level + 3 * lat + lon
            let mut raw = (0..3 * 2 * 2 * 3)
                .map(|k| {
                    let (t, level, i, j) = (k / 12, (k / 6) % 2, (k / 3) % 2, k % 3);
                    (100 * t + 10 * level + 3 * i + j) as f64
                })
                .collect_vec();
            // t = 1, level 1, first pixel
            raw[18] = 1e20;
            let mut var = nc.add_variable::<f64>("thetao", &["time", "olevel", "lat", "lon"]).unwrap();
            var.put_attribute("_FillValue", 1e20).unwrap();
            var.put_attribute("scale_factor", 2.0).unwrap();
            var.put_attribute("add_offset", 1.0).unwrap();
            var.put_values(&raw, Extents::All).unwrap();
        }

        let ds = NcDataset::open(&path).unwrap();
        assert_eq!(ds.data_variables(), vec!["thetao".to_string()]);
        let layout = FieldLayout::from_dims("thetao", &ds.dimensions_of("thetao").unwrap()).unwrap();
        let field = ds.field("thetao", &layout, 1, 0).unwrap();
        assert_eq!(field.n_steps(), 3);
        assert_eq!(field.grid_shape(), (2, 3));

        let chunk = field.read_steps(1..3).unwrap();
        assert_eq!(chunk.dim(), (2, 2, 3));
        assert!(chunk[[0, 0, 0]].is_nan());
        assert_eq!(chunk[[0, 0, 1]], (100.0 + 10.0 + 1.0) * 2.0 + 1.0);
        assert_eq!(chunk[[1, 1, 2]], (200.0 + 10.0 + 3.0 + 2.0) * 2.0 + 1.0);
        assert!(field.read_steps(2..4).is_err());
        assert!(ds.field("thetao", &layout, 2, 0).is_err());

        drop(ds);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_monthly_table_with_named_regions() {
        let path = test_path("table");
        let table = RegionTable {
            granularity: Granularity::Month,
            buckets: vec![BucketKey::Month { year: 2015, month: 1 }, BucketKey::Month { year: 2015, month: 2 }],
            row_labels: vec!["2015-01-16".to_string(), "2015-02-15".to_string()],
            regions: vec!["Fiji".to_string(), "New Caledonia".to_string()],
            region_codes: vec![None, None],
            values: ndarray::array![[1.0, 2.0], [3.0, f64::NAN]],
        };
        let attrs = TableAttributes { long_name: None, units: Some("tonnes".to_string()), source_file: Some("in.nc".to_string()) };
        write_table_netcdf(&path, "tc", &table, &attrs).unwrap();

        let ds = NcDataset::open(&path).unwrap();
        assert_eq!(ds.dimensions_of("tc").unwrap(), vec![("time".to_string(), 2), ("mask".to_string(), 2)]);
        assert_eq!(ds.read_f64("time").unwrap(), vec![201501.0, 201502.0]);
        assert_eq!(ds.read_f64("mask").unwrap(), vec![0.0, 1.0]);
        assert_eq!(ds.string_attribute("mask", "flag_meanings").unwrap().as_deref(), Some("Fiji New_Caledonia"));
        assert_eq!(ds.string_attribute("tc", "units").unwrap().as_deref(), Some("tonnes"));
        let values = ds.read_f64("tc").unwrap();
        assert_eq!(&values[..3], &[1.0, 2.0, 3.0]);
        assert!(values[3].is_nan());

        drop(ds);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_attr_as_f64() {
        assert_eq!(attr_as_f64(&AttributeValue::Float(1e20)), Some(1e20f32 as f64));
        assert_eq!(attr_as_f64(&AttributeValue::Short(-32767)), Some(-32767.0));
        assert_eq!(attr_as_f64(&AttributeValue::Str("x".to_string())), None);
    }
}
