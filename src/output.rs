//! Writing region tables to disk.
use std::{
    io::Write,
    path::{Path, PathBuf},
};

use error_stack::ResultExt;
use serde::Deserialize;

use crate::{
    aggregate::RegionTable,
    netcdf_io::{write_table_netcdf, TableAttributes},
};

/// Literal written to CSV files for missing values.
pub const CSV_NULL: &str = "NaN";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Could not create output directory {}", .0.display())]
    CreateDir(PathBuf),
    #[error("Could not write {}", .0.display())]
    Write(PathBuf),
}

/// File formats a table can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Netcdf,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Netcdf => "nc",
        }
    }
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        CSV_NULL.to_string()
    } else {
        v.to_string()
    }
}

/// Write `table` as CSV: a header of the index name followed by the region labels,
/// then one row per time bucket.
pub fn write_table_csv<W: Write>(writer: W, table: &RegionTable) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec![table.index_name().to_string()];
    header.extend(table.regions.iter().cloned());
    wtr.write_record(&header)?;

    for (label, row) in table.row_labels.iter().zip(table.values.rows()) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(|&v| format_value(v)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `table` to `out_dir/<stem>.<ext>` for each requested format, creating
/// `out_dir` if needed. Returns the paths written.
pub fn write_table(
    out_dir: &Path,
    stem: &str,
    table: &RegionTable,
    formats: &[OutputFormat],
    var_name: &str,
    attrs: &TableAttributes,
) -> error_stack::Result<Vec<PathBuf>, OutputError> {
    std::fs::create_dir_all(out_dir).change_context_lazy(|| OutputError::CreateDir(out_dir.to_path_buf()))?;

    let mut written = vec![];
    for format in formats {
        let path = out_dir.join(format!("{stem}.{}", format.extension()));
        match format {
            OutputFormat::Csv => {
                let f = std::fs::File::create(&path).change_context_lazy(|| OutputError::Write(path.clone()))?;
                write_table_csv(f, table).change_context_lazy(|| OutputError::Write(path.clone()))?;
            }
            OutputFormat::Netcdf => {
                write_table_netcdf(&path, var_name, table, attrs).change_context_lazy(|| OutputError::Write(path.clone()))?;
            }
        }
        log::info!("Wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::calendar::{BucketKey, Granularity};

    #[test]
    fn test_csv_layout() {
        let table = RegionTable {
            granularity: Granularity::Year,
            buckets: vec![BucketKey::Year(2015), BucketKey::Year(2016)],
            row_labels: vec!["2015".to_string(), "2016".to_string()],
            regions: vec!["8312".to_string(), "GBR".to_string()],
            region_codes: vec![Some(8312.0), None],
            values: array![[1.5, f64::NAN], [2.0, 0.25]],
        };

        let mut buf = vec![];
        write_table_csv(&mut buf, &table).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "year,8312,GBR\n2015,1.5,NaN\n2016,2,0.25\n");
    }
}
