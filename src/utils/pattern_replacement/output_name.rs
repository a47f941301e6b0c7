use std::borrow::Cow;

use crate::{
    discovery::base_name,
    selection::{BinId, LevelSelection},
};

use super::{PatternError, PatternReplacer};

/// Render an output file name (without extension) from a pattern.
///
/// Recognized keys are:
///
/// - `{BASE}`: the source file name up to `global_` (e.g. "boats_gfdl-esm4_nobasd_historical_nat_default_tcb_").
/// - `{STEM}`: the source file name without extension. `{STEM:old=new}` replaces every
///   "old" with "new".
/// - `{VAR}`: the variable aggregated.
/// - `{BIN}`: the bin identity. `{BIN:prefix}` inserts the prefix before it, and the whole
///   placeholder renders as an empty string when there is no bin axis.
/// - `{LEVEL}`: the depth of the level (e.g. "150m"), with the same prefix rule as `{BIN}`.
/// - `{START}` and `{END}`: first and last year in the output.
pub fn render_output_name(pattern: &str, parts: &OutputNameParts) -> Result<String, PatternError> {
    parts.render_pattern(pattern)
}

#[derive(Debug, Clone)]
pub struct OutputNameParts<'a> {
    pub source_file_name: &'a str,
    pub variable: &'a str,
    pub bin: Option<BinId>,
    pub level: Option<LevelSelection>,
    pub start_year: i32,
    pub end_year: i32,
}

fn optional_with_prefix<T: ToString>(value: Option<&T>, prefix: Option<&str>) -> Cow<'static, str> {
    match value {
        Some(v) => format!("{}{}", prefix.unwrap_or(""), v.to_string()).into(),
        None => Cow::Borrowed(""),
    }
}

impl<'a> PatternReplacer for OutputNameParts<'a> {
    fn get_replacement_value(&self, key: &str, fmt: Option<&str>) -> Result<Cow<'_, str>, PatternError> {
        match key {
            "BASE" => Ok(base_name(self.source_file_name).into()),
            "STEM" => {
                let stem = self.source_file_name.strip_suffix(".nc").unwrap_or(self.source_file_name);
                match fmt {
                    None => Ok(stem.into()),
                    Some(f) => {
                        let (old, new) = f.split_once('=').ok_or_else(|| PatternError::BadFormat {
                            key: key.to_string(),
                            fmt: f.to_string(),
                            reason: "expected old=new",
                        })?;
                        if old.is_empty() {
                            return Err(PatternError::BadFormat { key: key.to_string(), fmt: f.to_string(), reason: "text to replace is empty" });
                        }
                        Ok(stem.replace(old, new).into())
                    }
                }
            }
            "VAR" => Ok(self.variable.into()),
            "BIN" => Ok(optional_with_prefix(self.bin.as_ref(), fmt)),
            "LEVEL" => Ok(optional_with_prefix(self.level.as_ref(), fmt)),
            "START" => Ok(self.start_year.to_string().into()),
            "END" => Ok(self.end_year.to_string().into()),
            _ => Err(PatternError::UnknownKey(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(file: &str) -> OutputNameParts<'_> {
        OutputNameParts { source_file_name: file, variable: "tcb", bin: None, level: None, start_year: 1950, end_year: 2014 }
    }

    #[test]
    fn test_base_and_years() {
        let p = parts("boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc");
        let name = render_output_name("{BASE}global_tonnes{BIN:_bin-}_{START}_{END}", &p).unwrap();
        assert_eq!(name, "boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_tonnes_1950_2014");
    }

    #[test]
    fn test_bin() {
        let mut p = parts("dbpm_ipsl-cm6a-lr_nobasd_ssp585_nat_default_tcblog10_global_monthly_2015_2100.nc");
        p.bin = Some(BinId::Value(3));
        let name = render_output_name("{BASE}weighted-mean-yearly{BIN:_bin-}_{START}_{END}", &p).unwrap();
        assert_eq!(name, "dbpm_ipsl-cm6a-lr_nobasd_ssp585_nat_default_tcblog10_weighted-mean-yearly_bin-3_1950_2014");
    }

    #[test]
    fn test_stem_replacement_and_level() {
        let mut p = parts("gfdl-esm4_r1i1p1f1_historical_thetao_60arcmin_global_monthly_1850_2014.nc");
        let pattern = "{STEM:global_monthly=SouthPacific-GBR_weighted-mean-yearly}{LEVEL:_}";
        let name = render_output_name(pattern, &p).unwrap();
        assert_eq!(name, "gfdl-esm4_r1i1p1f1_historical_thetao_60arcmin_SouthPacific-GBR_weighted-mean-yearly_1850_2014");

        p.level = Some(LevelSelection { index: 2, depth: Some(25.0) });
        let name = render_output_name(pattern, &p).unwrap();
        assert!(name.ends_with("_1850_2014_25m"));
    }

    #[test]
    fn test_bad_patterns() {
        let p = parts("x_global_monthly_1950_2014.nc");
        assert!(matches!(render_output_name("{base}", &p), Err(PatternError::UnknownKey(_))));
        assert!(matches!(render_output_name("{STEM:global}", &p), Err(PatternError::BadFormat { .. })));
    }
}
