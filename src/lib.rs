use std::path::{PathBuf, Path};

pub mod aggregate;
pub mod calendar;
pub mod config;
pub mod default_files;
pub mod discovery;
pub mod field;
pub mod masking;
pub mod netcdf_io;
pub mod output;
pub mod pipeline;
pub mod regions;
pub mod selection;
pub mod utils;

/// Multiply by this to convert grams to metric tonnes.
pub const GRAMS_TO_TONNES: f64 = 1e-6;

/// Multiply by this to convert square kilometers to square meters.
pub const KM2_TO_M2: f64 = 1e6;

/// If `p` is already an absolute path, return it unchanged. Otherwise, make it relative to
/// the parent directory of `config_file`.
///
/// # Panics
/// Panics if it cannot get the parent directory of `config_file`, which should only happen
/// if a root directory was given instead of a file, so this is considered an internal mistake.
pub(crate) fn path_relative_to_config(config_file: &Path, p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else if let Some(parent_dir) = config_file.parent() {
        parent_dir.join(p)
    } else {
        panic!("Could not get parent from path {}", config_file.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths() {
        let cfg = Path::new("/home/me/picts/picts_config.toml");
        assert_eq!(path_relative_to_config(cfg, PathBuf::from("grids/mask.nc")), PathBuf::from("/home/me/picts/grids/mask.nc"));
        assert_eq!(path_relative_to_config(cfg, PathBuf::from("/data/mask.nc")), PathBuf::from("/data/mask.nc"));
    }
}
