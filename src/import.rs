//! CSV Import
//!
//! Reads points from CSV with a header row:
//!
//! ```text
//! measurement,time,tag.hostname,usage_user,usage_system
//! cpu,2023-10-19T21:50:00Z,host_0,10.0,3.5
//! ```
//!
//! `time` is required (epoch milliseconds or RFC 3339). `measurement` is
//! optional when a default is configured. `tag.<key>` columns become tags;
//! every other column is a numeric field. Empty cells are skipped.

use crate::storage::{Point, Timestamp};
use chrono::{DateTime, NaiveDateTime};
use std::io::Read;
use std::path::Path;

/// Errors that abort an import as a whole
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid header: {0}")]
    Header(String),
}

/// Result of a CSV import operation
#[derive(Debug, Default)]
pub struct ImportResult {
    pub points: Vec<Point>,
    pub rows_processed: usize,
    pub rows_failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug)]
enum Column {
    Measurement,
    Time,
    Tag(String),
    Field(String),
}

/// CSV point reader with a configurable default measurement
#[derive(Debug, Clone, Default)]
pub struct CsvImporter {
    default_measurement: Option<String>,
}

impl CsvImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measurement for rows without a `measurement` column
    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.default_measurement = Some(measurement.into());
        self
    }

    pub fn import(&self, path: &Path) -> Result<ImportResult, ImportError> {
        let reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        self.read_all(reader)
    }

    pub fn import_str(&self, csv_data: &str) -> Result<ImportResult, ImportError> {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(csv_data.as_bytes());
        self.read_all(reader)
    }

    fn read_all<R: Read>(&self, mut reader: csv::Reader<R>) -> Result<ImportResult, ImportError> {
        let columns = self.columns(reader.headers()?)?;
        let mut result = ImportResult::default();

        for (line_num, record) in reader.records().enumerate() {
            // Header is line 1
            let line = line_num + 2;
            let parsed = record
                .map_err(|e| e.to_string())
                .and_then(|record| self.parse_row(&columns, &record));

            match parsed {
                Ok(point) => {
                    result.points.push(point);
                    result.rows_processed += 1;
                }
                Err(e) => {
                    result.errors.push(format!("Line {}: {}", line, e));
                    result.rows_failed += 1;
                }
            }
        }

        if result.errors.len() > 100 {
            let total = result.errors.len();
            result.errors.truncate(100);
            result.errors.push(format!("... and {} more errors", total - 100));
        }

        Ok(result)
    }

    fn columns(&self, headers: &csv::StringRecord) -> Result<Vec<Column>, ImportError> {
        let columns: Vec<Column> = headers
            .iter()
            .map(|header| {
                let header = header.trim();
                match header {
                    "measurement" => Column::Measurement,
                    "time" => Column::Time,
                    _ => match header.strip_prefix("tag.") {
                        Some(key) => Column::Tag(key.to_string()),
                        None => Column::Field(header.to_string()),
                    },
                }
            })
            .collect();

        if !columns.iter().any(|c| matches!(c, Column::Time)) {
            return Err(ImportError::Header("missing \"time\" column".into()));
        }
        if self.default_measurement.is_none()
            && !columns.iter().any(|c| matches!(c, Column::Measurement))
        {
            return Err(ImportError::Header(
                "missing \"measurement\" column and no default measurement".into(),
            ));
        }
        Ok(columns)
    }

    fn parse_row(&self, columns: &[Column], record: &csv::StringRecord) -> Result<Point, String> {
        let mut measurement = self.default_measurement.clone();
        let mut time = None;
        let mut tags = Vec::new();
        let mut fields = Vec::new();

        for (column, cell) in columns.iter().zip(record.iter()) {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            match column {
                Column::Measurement => measurement = Some(cell.to_string()),
                Column::Time => time = Some(parse_timestamp(cell)?),
                Column::Tag(key) => tags.push((key.clone(), cell.to_string())),
                Column::Field(name) => {
                    let value: f64 = cell
                        .parse()
                        .map_err(|_| format!("field {} is not numeric: {:?}", name, cell))?;
                    fields.push((name.clone(), value));
                }
            }
        }

        let measurement = measurement.ok_or("missing measurement")?;
        let time = time.ok_or("missing time")?;
        if fields.is_empty() {
            return Err("row has no fields".into());
        }

        let mut point = Point::new(measurement, time);
        for (key, value) in tags {
            point = point.tag(key, value);
        }
        for (name, value) in fields {
            point = point.field(name, value);
        }
        point.validate().map_err(|e| e.to_string())?;
        Ok(point)
    }
}

/// Parse epoch milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC)
pub fn parse_timestamp(s: &str) -> Result<Timestamp, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(format!("could not parse timestamp: {:?}", s))
}
