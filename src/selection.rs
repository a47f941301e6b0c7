//! Choosing which variable, level and bin of a file to aggregate.
use std::fmt::Display;

use itertools::Itertools;
use serde::Deserialize;

/// Dimension names recognized as a vertical (depth) axis.
pub const LEVEL_AXIS_NAMES: &[&str] = &["lev", "olevel", "olevel_2"];
/// Dimension name of the size-class axis in ecosystem model output.
pub const BIN_AXIS_NAME: &str = "bins";

const TIME_AXIS_NAMES: &[&str] = &["time", "t"];
const LAT_AXIS_NAMES: &[&str] = &["lat", "latitude", "y"];
const LON_AXIS_NAMES: &[&str] = &["lon", "longitude", "x"];

const DEFAULT_MAX_DEPTH: f64 = 200.0;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No data variable matches '{target}' (file has: {available})")]
    VariableNotFound { target: String, available: String },
    #[error("Variable '{var}' has dimensions ({dims}), expected (time, [level], [bins], lat, lon)")]
    UnexpectedLayout { var: String, dims: String },
    #[error("The vertical axis has no coordinate values, cannot select levels by depth")]
    MissingDepths,
    #[error("No vertical level is within the top {0} m")]
    NoLevelsInRange(f64),
}

pub fn is_level_axis(name: &str) -> bool {
    LEVEL_AXIS_NAMES.contains(&name)
}

pub fn is_bin_axis(name: &str) -> bool {
    name == BIN_AXIS_NAME
}

fn is_one_of(name: &str, aliases: &[&str]) -> bool {
    aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
}

/// Pick the variable to aggregate out of a file's data variables.
///
/// A file with a single data variable always yields it. Otherwise an exact match on
/// `target` wins, followed by the longest data variable name contained in `target`
/// (so "tos" matches a target of "tos_onedeg").
pub fn select_variable<'a, S: AsRef<str>>(data_vars: &'a [S], target: &str) -> Result<&'a str, SelectionError> {
    if let [only] = data_vars {
        return Ok(only.as_ref());
    }

    if let Some(exact) = data_vars.iter().find(|v| v.as_ref() == target) {
        return Ok(exact.as_ref());
    }

    data_vars
        .iter()
        .map(|v| v.as_ref())
        .filter(|v| !v.is_empty() && target.contains(v))
        .max_by_key(|v| v.len())
        .ok_or_else(|| SelectionError::VariableNotFound {
            target: target.to_string(),
            available: data_vars.iter().map(|v| v.as_ref()).join(", "),
        })
}

/// What a dimension of a data variable represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisRole {
    Time,
    Level,
    Bin,
    Lat,
    Lon,
    /// An unrecognized dimension of length 1, read at index 0.
    Singleton,
}

/// The dimension layout of one data variable.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub roles: Vec<AxisRole>,
    pub n_time: usize,
    pub n_lat: usize,
    pub n_lon: usize,
    /// Name and length of the vertical axis, if any
    pub level: Option<(String, usize)>,
    /// Length of the bin axis, if any
    pub n_bins: Option<usize>,
}

impl FieldLayout {
    /// Classify the `(name, length)` dimensions of `var`. Time must come first and
    /// latitude/longitude last.
    pub fn from_dims(var: &str, dims: &[(String, usize)]) -> Result<Self, SelectionError> {
        let err = || SelectionError::UnexpectedLayout {
            var: var.to_string(),
            dims: dims.iter().map(|(n, _)| n.as_str()).join(", "),
        };

        let [(time_name, n_time), middle @ .., (lat_name, n_lat), (lon_name, n_lon)] = dims else {
            return Err(err());
        };
        if !is_one_of(time_name, TIME_AXIS_NAMES) || !is_one_of(lat_name, LAT_AXIS_NAMES) || !is_one_of(lon_name, LON_AXIS_NAMES) {
            return Err(err());
        }

        let mut roles = vec![AxisRole::Time];
        let mut level = None;
        let mut n_bins = None;
        for (name, len) in middle {
            if is_level_axis(name) && level.is_none() {
                level = Some((name.clone(), *len));
                roles.push(AxisRole::Level);
            } else if is_bin_axis(name) && n_bins.is_none() {
                n_bins = Some(*len);
                roles.push(AxisRole::Bin);
            } else if *len == 1 {
                log::debug!("Treating dimension '{name}' of '{var}' as a singleton");
                roles.push(AxisRole::Singleton);
            } else {
                return Err(err());
            }
        }
        roles.push(AxisRole::Lat);
        roles.push(AxisRole::Lon);

        Ok(Self { roles, n_time: *n_time, n_lat: *n_lat, n_lon: *n_lon, level, n_bins })
    }
}

/// How to treat a vertical axis.
///
/// In the configuration, this is given as a table with a `kind` key:
///
/// ```toml
/// [forcing.level_policy]
/// kind = "upper_ocean"
/// max_depth = 200.0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LevelPolicy {
    /// Keep only the first level.
    #[default]
    Surface,
    /// Keep every level at or above `max_depth` meters, each aggregated separately.
    UpperOcean {
        #[serde(default = "default_max_depth")]
        max_depth: f64,
    },
}

fn default_max_depth() -> f64 {
    DEFAULT_MAX_DEPTH
}

/// One vertical level chosen for aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSelection {
    pub index: usize,
    /// Depth of the level in meters, if the file gives one
    pub depth: Option<f64>,
}

impl Display for LevelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.depth {
            Some(d) => write!(f, "{}m", (d * 100.0).round() / 100.0),
            None => write!(f, "lev{}", self.index),
        }
    }
}

impl LevelPolicy {
    /// Choose the levels to aggregate. `depths` are the vertical coordinate values with
    /// their units attribute, if the file has them.
    pub fn select_levels(&self, n_levels: usize, depths: Option<(&[f64], Option<&str>)>) -> Result<Vec<LevelSelection>, SelectionError> {
        let depths_m = depths.map(|(values, units)| {
            let scale = depth_scale(units);
            values.iter().map(|d| d * scale).collect_vec()
        });

        match self {
            LevelPolicy::Surface => Ok(vec![LevelSelection { index: 0, depth: depths_m.and_then(|d| d.first().copied()) }]),
            LevelPolicy::UpperOcean { max_depth } => {
                let depths_m = depths_m.ok_or(SelectionError::MissingDepths)?;
                let levels = depths_m
                    .into_iter()
                    .take(n_levels)
                    .enumerate()
                    .filter(|(_, d)| d.abs() <= *max_depth)
                    .map(|(index, d)| LevelSelection { index, depth: Some(d) })
                    .collect_vec();
                if levels.is_empty() {
                    Err(SelectionError::NoLevelsInRange(*max_depth))
                } else {
                    Ok(levels)
                }
            }
        }
    }
}

/// Factor to convert a depth in `units` to meters.
fn depth_scale(units: Option<&str>) -> f64 {
    match units.map(|u| u.trim().to_ascii_lowercase()).as_deref() {
        Some("cm") | Some("centimeter") | Some("centimeters") | Some("centimetre") | Some("centimetres") => 0.01,
        _ => 1.0,
    }
}

/// Identity of one bin of a size-class axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinId {
    /// The bin coordinate value
    Value(i64),
    /// The position along the axis, used when the coordinate values are missing or
    /// not unique integers
    Index(usize),
}

impl Display for BinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinId::Value(v) => write!(f, "{v}"),
            BinId::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Assign an identity to each of `n_bins` bins given their coordinate values.
///
/// Bins are named by their value only when every value is a whole number and no two
/// are equal. Values such as `[0.5, 1.0]` are unique but would truncate to the same
/// integer, so any non-integer value makes every bin fall back to its position and
/// output names never collide.
pub fn bin_ids(n_bins: usize, values: Option<&[f64]>) -> Vec<BinId> {
    let by_index = || (0..n_bins).map(BinId::Index).collect_vec();
    let Some(values) = values else {
        return by_index();
    };
    if values.len() != n_bins || values.iter().any(|v| !v.is_finite() || v.fract() != 0.0) {
        return by_index();
    }

    let ints = values.iter().map(|&v| v as i64).collect_vec();
    if ints.iter().all_unique() {
        ints.into_iter().map(BinId::Value).collect()
    } else {
        by_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(d: &[(&str, usize)]) -> Vec<(String, usize)> {
        d.iter().map(|(n, l)| (n.to_string(), *l)).collect()
    }

    #[test]
    fn test_select_variable() {
        assert_eq!(select_variable(&["tcb"], "anything").unwrap(), "tcb");
        assert_eq!(select_variable(&["tos", "tos_bnds"], "tos").unwrap(), "tos");
        assert_eq!(select_variable(&["so", "tos"], "tos_onedeg").unwrap(), "tos");
        // "o2" and "o2sat" are both contained, the longer one wins
        assert_eq!(select_variable(&["o2", "o2sat", "ph"], "o2sat_surf").unwrap(), "o2sat");

        let e = select_variable(&["a", "b"], "tcb").unwrap_err();
        assert!(matches!(e, SelectionError::VariableNotFound { .. }));
        let e = select_variable::<&str>(&[], "tcb").unwrap_err();
        assert!(matches!(e, SelectionError::VariableNotFound { .. }));
    }

    #[test]
    fn test_layout() {
        let layout = FieldLayout::from_dims("tcb", &dims(&[("time", 10), ("lat", 180), ("lon", 360)])).unwrap();
        assert_eq!(layout.roles, vec![AxisRole::Time, AxisRole::Lat, AxisRole::Lon]);
        assert_eq!(layout.level, None);

        let layout = FieldLayout::from_dims("thetao", &dims(&[("time", 10), ("olevel", 75), ("lat", 180), ("lon", 360)])).unwrap();
        assert_eq!(layout.level, Some(("olevel".to_string(), 75)));

        let layout = FieldLayout::from_dims("o2", &dims(&[("time", 10), ("lev", 35), ("lat", 180), ("lon", 360)])).unwrap();
        assert_eq!(layout.level, Some(("lev".to_string(), 35)));
        assert_eq!(layout.roles[1], AxisRole::Level);

        let layout = FieldLayout::from_dims("so", &dims(&[("time", 10), ("olevel_2", 35), ("lat", 180), ("lon", 360)])).unwrap();
        assert_eq!(layout.level, Some(("olevel_2".to_string(), 35)));
        assert_eq!(layout.n_bins, None);

        let layout = FieldLayout::from_dims("tcblog10", &dims(&[("time", 10), ("bins", 6), ("lat", 180), ("lon", 360)])).unwrap();
        assert_eq!(layout.n_bins, Some(6));
        assert_eq!(layout.roles[1], AxisRole::Bin);

        let e = FieldLayout::from_dims("x", &dims(&[("lat", 180), ("lon", 360), ("time", 10)]));
        assert!(matches!(e, Err(SelectionError::UnexpectedLayout { .. })));
        let e = FieldLayout::from_dims("x", &dims(&[("time", 10), ("depth_class", 4), ("lat", 180), ("lon", 360)]));
        assert!(matches!(e, Err(SelectionError::UnexpectedLayout { .. })));
    }

    #[test]
    fn test_level_policy() {
        let levels = LevelPolicy::Surface.select_levels(3, None).unwrap();
        assert_eq!(levels, vec![LevelSelection { index: 0, depth: None }]);

        let depths = [500.0, 5000.0, 15000.0, 25000.0];
        let policy = LevelPolicy::UpperOcean { max_depth: 200.0 };
        let levels = policy.select_levels(4, Some((&depths, Some("centimeters")))).unwrap();
        assert_eq!(levels.iter().map(|l| l.index).collect_vec(), vec![0, 1, 2]);
        assert_eq!(levels[2].depth, Some(150.0));
        assert_eq!(levels[2].to_string(), "150m");

        let e = policy.select_levels(1, Some((&[300.0], Some("m"))));
        assert!(matches!(e, Err(SelectionError::NoLevelsInRange(_))));
        assert!(matches!(policy.select_levels(1, None), Err(SelectionError::MissingDepths)));
    }

    #[test]
    fn test_level_policy_toml() {
        let p: LevelPolicy = toml::from_str("kind = \"upper_ocean\"").unwrap();
        assert_eq!(p, LevelPolicy::UpperOcean { max_depth: 200.0 });
        let p: LevelPolicy = toml::from_str("kind = \"surface\"").unwrap();
        assert_eq!(p, LevelPolicy::Surface);
    }

    #[test]
    fn test_bin_ids() {
        assert_eq!(bin_ids(3, Some(&[1.0, 2.0, 3.0])), vec![BinId::Value(1), BinId::Value(2), BinId::Value(3)]);
        assert_eq!(bin_ids(2, Some(&[1.0, 1.0])), vec![BinId::Index(0), BinId::Index(1)]);
        assert_eq!(bin_ids(2, Some(&[0.5, 1.0])), vec![BinId::Index(0), BinId::Index(1)]);
        // unique values that would truncate onto each other
        assert_eq!(bin_ids(3, Some(&[1.2, 1.7, 2.0])), vec![BinId::Index(0), BinId::Index(1), BinId::Index(2)]);
        assert_eq!(bin_ids(2, None), vec![BinId::Index(0), BinId::Index(1)]);
    }
}
