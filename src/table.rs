//! Feature table loading.
//!
//! The pipeline consumes a flat TSV/CSV table produced by an external HRV
//! metric extraction step: one row per participant x database recording,
//! one column per HRV index, plus `Participant`, `Database`, and a
//! recording-length column. The loader is the only place that touches raw
//! text; every later stage works on the numeric matrix.

use crate::error::{Result, StructureError};
use csv::ReaderBuilder;
use log::{debug, warn};
use ndarray::{Array2, ArrayView1};
use std::collections::HashSet;
use std::path::Path;

/// Metadata columns that are never treated as features.
pub const PARTICIPANT_COLUMN: &str = "Participant";
pub const DATABASE_COLUMN: &str = "Database";

/// One observation per row, one named numeric feature per column.
///
/// Invariants: feature names are unique, every feature column is finite,
/// and `participants`/`databases` run parallel to the rows. Stages never
/// mutate a table in place; each produces a fresh, usually smaller one.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub names: Vec<String>,
    /// observations x features
    pub data: Array2<f64>,
    pub participants: Vec<String>,
    pub databases: Vec<String>,
}

impl FeatureTable {
    pub fn n_observations(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.column(index)
    }

    /// New table keeping only the named subset of columns, in table order.
    pub fn retain_columns(&self, keep: &[usize]) -> FeatureTable {
        let names = keep.iter().map(|&i| self.names[i].clone()).collect();
        let data = self.data.select(ndarray::Axis(1), keep);
        FeatureTable {
            names,
            data,
            participants: self.participants.clone(),
            databases: self.databases.clone(),
        }
    }

    /// New table with one column removed by name.
    ///
    /// # Errors
    /// [`StructureError::Schema`] if the column does not exist.
    pub fn drop_column(&self, name: &str) -> Result<FeatureTable> {
        let index = self
            .position(name)
            .ok_or_else(|| StructureError::Schema(format!("column '{name}' not found")))?;
        let keep: Vec<usize> = (0..self.n_features()).filter(|&i| i != index).collect();
        Ok(self.retain_columns(&keep))
    }

    /// Replace the numeric matrix while keeping names and metadata.
    ///
    /// # Errors
    /// [`StructureError::Schema`] if the shape does not match.
    pub fn with_data(&self, data: Array2<f64>) -> Result<FeatureTable> {
        if data.nrows() != self.n_observations() || data.ncols() != self.n_features() {
            return Err(StructureError::Schema(format!(
                "replacement matrix is {}x{}, table is {}x{}",
                data.nrows(),
                data.ncols(),
                self.n_observations(),
                self.n_features()
            )));
        }
        Ok(FeatureTable {
            names: self.names.clone(),
            data,
            participants: self.participants.clone(),
            databases: self.databases.clone(),
        })
    }
}

fn parse_cell(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("nan")
    {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn required_column(headers: &[String], name: &str, path: &Path) -> Result<usize> {
    headers.iter().position(|h| h == name).ok_or_else(|| {
        StructureError::Schema(format!(
            "required column '{name}' not found in {}",
            path.display()
        ))
    })
}

fn delimiter_for(path: &Path, override_delimiter: Option<u8>) -> u8 {
    if let Some(d) = override_delimiter {
        return d;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    }
}

/// Read a feature table from disk.
///
/// `confound` names the recording-length column and must be present and
/// numeric; it is loaded as a regular feature column and stays in the table
/// until the confound adjuster drops it. Policy for malformed content:
/// entirely-missing columns are dropped with a warning, columns with any
/// unparsable non-missing cell are dropped as non-numeric with a warning,
/// and rows still holding a missing value in a retained column are dropped
/// with a warning. Duplicate headers are a schema error, not a repair.
///
/// # Errors
/// [`StructureError::Schema`] on duplicate or absent required columns, or if
/// nothing numeric survives; [`StructureError::Csv`]/[`StructureError::Io`]
/// on read failures.
pub fn load_feature_table(
    path: &Path,
    confound: &str,
    override_delimiter: Option<u8>,
) -> Result<FeatureTable> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(path, override_delimiter))
        .has_headers(true)
        .flexible(false)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|s| s.trim().to_string()).collect();

    let mut seen = HashSet::new();
    for name in &headers {
        if !seen.insert(name.as_str()) {
            return Err(StructureError::Schema(format!(
                "duplicate column name '{name}' in {}",
                path.display()
            )));
        }
    }

    let participant_idx = required_column(&headers, PARTICIPANT_COLUMN, path)?;
    let database_idx = required_column(&headers, DATABASE_COLUMN, path)?;
    required_column(&headers, confound, path)?;

    let mut participants = Vec::new();
    let mut databases = Vec::new();
    let mut cells: Vec<Vec<Option<f64>>> = Vec::new();

    for record in reader.records() {
        let record = record?;
        if record.len() != headers.len() {
            return Err(StructureError::Schema(format!(
                "row {} has {} fields, header has {}",
                cells.len() + 1,
                record.len(),
                headers.len()
            )));
        }
        participants.push(record[participant_idx].to_string());
        databases.push(record[database_idx].to_string());
        cells.push(
            record
                .iter()
                .enumerate()
                .map(|(i, raw)| {
                    if i == participant_idx || i == database_idx {
                        None
                    } else {
                        parse_cell(raw)
                    }
                })
                .collect(),
        );
    }

    if cells.is_empty() {
        return Err(StructureError::Schema(format!(
            "no data rows in {}",
            path.display()
        )));
    }

    // Classify candidate columns: empty and non-numeric ones are dropped
    // before row completeness is judged.
    let mut kept_indices = Vec::new();
    for (col_idx, name) in headers.iter().enumerate() {
        if col_idx == participant_idx || col_idx == database_idx {
            continue;
        }
        let non_missing = cells.iter().filter(|row| row[col_idx].is_some()).count();
        // A column that fails to parse for some rows may be sparsely missing
        // or genuinely non-numeric; the raw text decides which.
        if non_missing < cells.len() {
            let unparsable = count_unparsable(path, override_delimiter, col_idx)?;
            if unparsable > 0 {
                warn!("Dropping non-numeric column '{name}' ({unparsable} unparsable cells).");
                continue;
            }
            if non_missing == 0 {
                warn!("Dropping column '{name}': no non-missing values.");
                continue;
            }
        }
        if name == confound && non_missing < cells.len() {
            debug!("Confound column '{confound}' has missing cells; affected rows will drop.");
        }
        kept_indices.push(col_idx);
    }

    if kept_indices.len() < 2 {
        return Err(StructureError::Schema(format!(
            "table {} has {} usable numeric column(s); need at least 2",
            path.display(),
            kept_indices.len()
        )));
    }
    if !kept_indices.iter().any(|&i| headers[i] == confound) {
        return Err(StructureError::Schema(format!(
            "confound column '{confound}' is not numeric in {}",
            path.display()
        )));
    }

    // Drop rows with any missing value in a retained column.
    let complete: Vec<usize> = (0..cells.len())
        .filter(|&r| kept_indices.iter().all(|&c| cells[r][c].is_some()))
        .collect();
    let dropped_rows = cells.len() - complete.len();
    if dropped_rows > 0 {
        warn!("Dropping {dropped_rows} incomplete row(s) of {}.", cells.len());
    }
    if complete.len() < 3 {
        return Err(StructureError::DegenerateData(format!(
            "only {} complete row(s) in {}; need at least 3",
            complete.len(),
            path.display()
        )));
    }

    let names: Vec<String> = kept_indices.iter().map(|&i| headers[i].clone()).collect();
    let mut data = Array2::<f64>::zeros((complete.len(), kept_indices.len()));
    for (out_r, &r) in complete.iter().enumerate() {
        for (out_c, &c) in kept_indices.iter().enumerate() {
            if let Some(value) = cells[r][c] {
                data[[out_r, out_c]] = value;
            }
        }
    }

    Ok(FeatureTable {
        names,
        data,
        participants: complete.iter().map(|&r| participants[r].clone()).collect(),
        databases: complete.iter().map(|&r| databases[r].clone()).collect(),
    })
}

/// Second pass over the raw file counting cells in a column that are neither
/// missing nor parsable as a number.
fn count_unparsable(path: &Path, override_delimiter: Option<u8>, col_idx: usize) -> Result<usize> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(path, override_delimiter))
        .has_headers(true)
        .from_path(path)?;
    let mut count = 0;
    for record in reader.records() {
        let record = record?;
        if let Some(raw) = record.get(col_idx) {
            let trimmed = raw.trim();
            let missing = trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case("na")
                || trimmed.eq_ignore_ascii_case("nan");
            if !missing && trimmed.parse::<f64>().is_err() {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_table(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        file.write_all(content.as_bytes()).expect("write content");
        file
    }

    #[test]
    fn test_load_basic_table() {
        let file = write_table(
            "Participant,Database,Recording_Length,RMSSD,SDNN\n\
             p1,db1,5.0,30.0,50.0\n\
             p2,db1,5.2,32.0,55.0\n\
             p3,db2,4.8,28.0,48.0\n",
        );
        let table =
            load_feature_table(file.path(), "Recording_Length", None).expect("load table");
        assert_eq!(table.n_observations(), 3);
        assert_eq!(table.names, vec!["Recording_Length", "RMSSD", "SDNN"]);
        assert_eq!(table.participants, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_duplicate_column_is_schema_error() {
        let file = write_table(
            "Participant,Database,Recording_Length,RMSSD,RMSSD\n\
             p1,db1,5.0,30.0,31.0\n\
             p2,db1,5.2,32.0,33.0\n\
             p3,db2,4.8,28.0,29.0\n",
        );
        let err = load_feature_table(file.path(), "Recording_Length", None).unwrap_err();
        assert!(matches!(err, StructureError::Schema(_)));
    }

    #[test]
    fn test_missing_confound_is_schema_error() {
        let file = write_table(
            "Participant,Database,RMSSD,SDNN\n\
             p1,db1,30.0,50.0\n\
             p2,db1,32.0,55.0\n\
             p3,db2,28.0,48.0\n",
        );
        let err = load_feature_table(file.path(), "Recording_Length", None).unwrap_err();
        assert!(matches!(err, StructureError::Schema(_)));
    }

    #[test]
    fn test_empty_column_dropped_and_incomplete_rows_dropped() {
        let file = write_table(
            "Participant,Database,Recording_Length,RMSSD,Empty,SDNN\n\
             p1,db1,5.0,30.0,,50.0\n\
             p2,db1,5.2,,,55.0\n\
             p3,db2,4.8,28.0,,48.0\n\
             p4,db2,4.9,29.0,,49.0\n",
        );
        let table =
            load_feature_table(file.path(), "Recording_Length", None).expect("load table");
        assert!(!table.names.contains(&"Empty".to_string()));
        // p2 had a missing RMSSD and must be gone.
        assert_eq!(table.n_observations(), 3);
        assert!(!table.participants.contains(&"p2".to_string()));
    }

    #[test]
    fn test_non_numeric_column_dropped() {
        let file = write_table(
            "Participant,Database,Recording_Length,RMSSD,Quality\n\
             p1,db1,5.0,30.0,good\n\
             p2,db1,5.2,32.0,bad\n\
             p3,db2,4.8,28.0,good\n",
        );
        let table =
            load_feature_table(file.path(), "Recording_Length", None).expect("load table");
        assert_eq!(table.names, vec!["Recording_Length", "RMSSD"]);
    }

    #[test]
    fn test_tsv_by_extension() {
        let mut file = tempfile::Builder::new()
            .suffix(".tsv")
            .tempfile()
            .expect("create temp file");
        file.write_all(
            b"Participant\tDatabase\tRecording_Length\tRMSSD\tSDNN\n\
              p1\tdb1\t5.0\t30.0\t50.0\n\
              p2\tdb1\t5.2\t32.0\t55.0\n\
              p3\tdb2\t4.8\t28.0\t48.0\n",
        )
        .expect("write content");
        let table =
            load_feature_table(file.path(), "Recording_Length", None).expect("load table");
        assert_eq!(table.n_features(), 3);
    }

    #[test]
    fn test_retain_and_drop_columns() {
        let file = write_table(
            "Participant,Database,Recording_Length,RMSSD,SDNN\n\
             p1,db1,5.0,30.0,50.0\n\
             p2,db1,5.2,32.0,55.0\n\
             p3,db2,4.8,28.0,48.0\n",
        );
        let table =
            load_feature_table(file.path(), "Recording_Length", None).expect("load table");
        let reduced = table.drop_column("Recording_Length").expect("drop");
        assert_eq!(reduced.names, vec!["RMSSD", "SDNN"]);
        assert_eq!(reduced.n_observations(), 3);
        assert!(reduced.drop_column("Recording_Length").is_err());
    }
}
