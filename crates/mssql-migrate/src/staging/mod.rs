//! CSV staging directory.
//!
//! `export` writes one `<table>.csv` per source table and `import` loads
//! those files into a target later, so the two halves of a migration can run
//! on different hosts. Every field is quoted. A JSON column that contains
//! the primary delimiter switches the whole file to the fallback delimiter;
//! readers detect the delimiter from the first line.
//!
//! Values are written in their text form and read back as text, so the
//! importer's coercion rules restore booleans, GUIDs and timestamps. NULL
//! and the empty string share the empty field and both import as NULL.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, QuoteStyle, ReaderBuilder, WriterBuilder};
use tracing::{debug, error, info};

use crate::config::CsvConfig;
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::error::Result;

/// Rows inspected when choosing the delimiter.
const DELIMITER_SAMPLE_ROWS: usize = 100;

/// Delimiters recognised when reading a file back.
const KNOWN_DELIMITERS: [u8; 3] = [b',', b'|', b'\t'];

/// Columns and rows read from one staged file.
#[derive(Debug, Clone, Default)]
pub struct StagedTable {
    /// Header names; empty when the file has no header record.
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Reads and writes the per-table CSV files of one directory.
#[derive(Debug, Clone)]
pub struct CsvStage {
    settings: CsvConfig,
}

impl CsvStage {
    pub fn new(settings: CsvConfig) -> Self {
        Self { settings }
    }

    /// The staging directory.
    pub fn dir(&self) -> &Path {
        &self.settings.output_dir
    }

    /// Path of the file holding `table`.
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.settings.output_dir.join(format!("{}.csv", table))
    }

    /// Write `rows` to `<dir>/<table>.csv`, replacing any earlier file.
    ///
    /// `special_columns` are the JSON-like columns; they decide whether the
    /// fallback delimiter is needed.
    pub fn export_table(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        special_columns: &HashSet<String>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(self.dir())?;
        let path = self.table_path(table);
        info!("Exporting {} to {}", table, path.display());

        let delimiter = self.choose_delimiter(columns, rows, special_columns);
        let mut writer = WriterBuilder::new()
            .delimiter(delimiter)
            .quote_style(QuoteStyle::Always)
            .has_headers(false)
            .from_path(&path)?;

        if self.settings.include_headers {
            writer.write_record(columns)?;
        }
        for row in rows {
            writer.write_record(row.iter().map(cell_text))?;
        }
        writer.flush()?;

        info!("{}: wrote {} rows to {}", table, rows.len(), path.display());
        Ok(path)
    }

    /// Read a staged file back as text values.
    ///
    /// Empty fields become NULL. Short records are padded with NULL up to
    /// the header width and extra fields are dropped.
    pub fn read_table(&self, path: &Path) -> Result<StagedTable> {
        let delimiter = detect_file_delimiter(path)?;
        debug!(
            "Detected delimiter {:?} for {}",
            delimiter as char,
            path.display()
        );

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(self.settings.include_headers)
            .flexible(true)
            .from_path(path)?;

        let columns: Vec<String> = if self.settings.include_headers {
            reader
                .headers()?
                .iter()
                .map(|h| h.trim_matches('"').to_string())
                .collect()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let width = if columns.is_empty() {
                record.len()
            } else {
                columns.len()
            };
            let row: Row = (0..width)
                .map(|i| field_value(record.get(i).unwrap_or("")))
                .collect();
            rows.push(row);
        }

        info!("Read {} rows from {}", rows.len(), path.display());
        Ok(StagedTable { columns, rows })
    }

    /// Number of data records in a staged file, header excluded.
    ///
    /// Records are counted by the CSV grammar, so quoted fields spanning
    /// several lines count once.
    pub fn count_records(&self, path: &Path) -> Result<u64> {
        let delimiter = detect_file_delimiter(path)?;
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(self.settings.include_headers)
            .flexible(true)
            .from_path(path)?;

        let mut record = ByteRecord::new();
        let mut count = 0;
        while reader.read_byte_record(&mut record)? {
            count += 1;
        }
        Ok(count)
    }

    /// Whether the file at `path` holds exactly `expected` records.
    pub fn validate_export(&self, expected: u64, path: &Path) -> Result<bool> {
        let actual = self.count_records(path)?;
        if actual == expected {
            info!("Export validation passed: {} rows", actual);
            Ok(true)
        } else {
            error!(
                "Export validation failed for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            );
            Ok(false)
        }
    }

    /// Table names of every `.csv` file in the directory, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let path = entry?.path();
            let is_csv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if !is_csv || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tables.push(stem.to_string());
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Primary delimiter unless a sampled JSON value contains it unquoted.
    fn choose_delimiter(
        &self,
        columns: &[String],
        rows: &[Row],
        special_columns: &HashSet<String>,
    ) -> u8 {
        let primary = self.settings.delimiter;
        let special: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| special_columns.contains(c.as_str()))
            .map(|(i, _)| i)
            .collect();

        let conflict = rows.iter().take(DELIMITER_SAMPLE_ROWS).any(|row| {
            special.iter().any(|&i| {
                row.get(i)
                    .and_then(|v| v.render_text())
                    .is_some_and(|v| v.contains(primary) && !is_wrapped_in_quotes(&v))
            })
        });

        if conflict {
            info!(
                "Primary delimiter {:?} found in JSON data, using fallback {:?}",
                primary, self.settings.fallback_delimiter
            );
            self.settings.fallback_delimiter as u8
        } else {
            primary as u8
        }
    }
}

fn is_wrapped_in_quotes(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('"') && value.ends_with('"')
}

fn cell_text(value: &SqlValue<'_>) -> String {
    value.render_text().unwrap_or_default()
}

fn field_value(field: &str) -> SqlValue<'static> {
    if field.is_empty() {
        SqlValue::Null(SqlNullType::String)
    } else {
        SqlValue::from(field.to_string())
    }
}

fn detect_file_delimiter(path: &Path) -> Result<u8> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;
    Ok(detect_delimiter(&first_line))
}

/// The known delimiter occurring most often outside quotes in `line`.
///
/// Ties and lines without any known delimiter fall back to a comma.
pub fn detect_delimiter(line: &str) -> u8 {
    let comma = count_outside_quotes(line, b',');
    let mut best = (b',', comma);
    for &candidate in &KNOWN_DELIMITERS[1..] {
        let count = count_outside_quotes(line, candidate);
        if count > best.1 {
            best = (candidate, count);
        } else if count == best.1 && count > comma {
            // Two non-comma delimiters tie: neither wins.
            best = (b',', count);
        }
    }
    best.0
}

/// Occurrences of `delimiter` outside double-quoted sections. A doubled
/// quote inside a quoted section is an escaped quote.
pub fn count_outside_quotes(line: &str, delimiter: u8) -> usize {
    let bytes = line.as_bytes();
    let mut count = 0;
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if in_quotes && bytes.get(i + 1) == Some(&b'"') => i += 1,
            b'"' => in_quotes = !in_quotes,
            b if b == delimiter && !in_quotes => count += 1,
            _ => {}
        }
        i += 1;
    }
    count
}
