/// Persisted tabular storage.
///
/// The on-disk format is chosen by file extension: `.xlsx` workbooks hold the
/// table on the sheet named by the sheet label; `.csv` files hold a single
/// header row followed by data rows; SQLite files (`.db`, `.sqlite`,
/// `.sqlite3`) hold one table per sheet label. Writes fully replace prior
/// content and never leave a half-written dataset behind.
use crate::table::Table;
use calamine::Reader;
use rusqlite::Connection;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: std::io::Error },
    Csv { path: PathBuf, source: csv::Error },
    Sqlite { path: PathBuf, source: rusqlite::Error },
    XlsxRead { path: PathBuf, source: calamine::XlsxError },
    XlsxWrite { path: PathBuf, source: rust_xlsxwriter::XlsxError },
    UnsupportedFormat { path: PathBuf },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StoreError::Csv { path, source } => {
                write!(f, "{}: invalid csv: {}", path.display(), source)
            }
            StoreError::Sqlite { path, source } => {
                write!(f, "{}: sqlite error: {}", path.display(), source)
            }
            StoreError::XlsxRead { path, source } => {
                write!(f, "{}: unreadable workbook: {}", path.display(), source)
            }
            StoreError::XlsxWrite { path, source } => {
                write!(f, "{}: workbook write failed: {}", path.display(), source)
            }
            StoreError::UnsupportedFormat { path } => write!(
                f,
                "{}: unsupported dataset format (use .xlsx, .csv, .db, .sqlite or .sqlite3)",
                path.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Csv { source, .. } => Some(source),
            StoreError::Sqlite { source, .. } => Some(source),
            StoreError::XlsxRead { source, .. } => Some(source),
            StoreError::XlsxWrite { source, .. } => Some(source),
            StoreError::UnsupportedFormat { .. } => None,
        }
    }
}

/// Read and write whole tables.
pub trait TableStore {
    /// Read the dataset at `path`, or `None` if there is none yet.
    fn read_table(&self, path: &Path, sheet: &str) -> Result<Option<Table>, StoreError>;

    /// Replace the dataset at `path` with `table`.
    fn write_table(&self, path: &Path, table: &Table, sheet: &str) -> Result<(), StoreError>;
}

/// Dataset file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Xlsx,
    Csv,
    Sqlite,
}

impl StoreFormat {
    /// Format implied by the extension of `path`.
    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("xlsx") => Ok(StoreFormat::Xlsx),
            Some("csv") => Ok(StoreFormat::Csv),
            Some("db" | "sqlite" | "sqlite3") => Ok(StoreFormat::Sqlite),
            _ => Err(StoreError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// Pick the store for a dataset path based on its extension.
pub fn store_for_path(path: &Path) -> Result<Box<dyn TableStore + Send>, StoreError> {
    Ok(match StoreFormat::from_path(path)? {
        StoreFormat::Xlsx => Box::new(XlsxStore),
        StoreFormat::Csv => Box::new(CsvStore),
        StoreFormat::Sqlite => Box::new(SqliteStore),
    })
}

/// Problems with a sheet label as an Excel worksheet name.
pub fn xlsx_sheet_name_problem(sheet: &str) -> Option<String> {
    if sheet.chars().count() > 31 {
        return Some(format!("sheet name {sheet:?} is longer than 31 characters"));
    }
    if let Some(c) = sheet.chars().find(|c| "[]:*?/\\".contains(*c)) {
        return Some(format!("sheet name {sheet:?} contains {c:?}"));
    }
    if sheet.starts_with('\'') || sheet.ends_with('\'') {
        return Some(format!("sheet name {sheet:?} starts or ends with an apostrophe"));
    }
    None
}

/// Excel workbook; the table lives on the sheet named by the sheet label.
///
/// A write produces a workbook holding only that sheet. Cells whose text is
/// the canonical rendering of a number are stored as numbers, everything
/// else as strings, so values read back unchanged.
#[derive(Debug, Default)]
pub struct XlsxStore;

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.clone(),
        calamine::Data::Float(v) => v.to_string(),
        calamine::Data::Int(v) => v.to_string(),
        other => other.to_string(),
    }
}

/// `Some` only when writing the number and reading it back yields `cell`.
fn numeric_cell(cell: &str) -> Option<f64> {
    let value: f64 = cell.parse().ok()?;
    (value.is_finite() && value.to_string() == cell).then_some(value)
}

impl TableStore for XlsxStore {
    fn read_table(&self, path: &Path, sheet: &str) -> Result<Option<Table>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let xlsx_err = |e| StoreError::XlsxRead {
            path: path.to_path_buf(),
            source: e,
        };

        let mut workbook: calamine::Xlsx<_> = calamine::open_workbook(path).map_err(xlsx_err)?;
        if !workbook.sheet_names().iter().any(|name| name == sheet) {
            return Ok(None);
        }
        let range = workbook.worksheet_range(sheet).map_err(xlsx_err)?;

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect::<Vec<String>>());
        let mut table = Table::new(rows.next().unwrap_or_default());
        for row in rows {
            table.push_row(row);
        }
        Ok(Some(table))
    }

    fn write_table(&self, path: &Path, table: &Table, sheet: &str) -> Result<(), StoreError> {
        let io_err = |e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let xlsx_err = |e| StoreError::XlsxWrite {
            path: path.to_path_buf(),
            source: e,
        };

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet).map_err(xlsx_err)?;

        let records = std::iter::once(table.headers()).chain(table.rows().iter().map(Vec::as_slice));
        for (r, record) in records.enumerate() {
            // Out-of-range indexes are rejected by the writer
            let row = u32::try_from(r).unwrap_or(u32::MAX);
            for (c, cell) in record.iter().enumerate() {
                let col = u16::try_from(c).unwrap_or(u16::MAX);
                if cell.is_empty() {
                    continue;
                }
                let written = match numeric_cell(cell) {
                    Some(v) => worksheet.write_number(row, col, v),
                    None => worksheet.write_string(row, col, cell),
                };
                written.map_err(xlsx_err)?;
            }
        }
        let bytes = workbook.save_to_buffer().map_err(xlsx_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path)).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file_mut().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Comma-separated file with a header row. The sheet label is not stored.
#[derive(Debug, Default)]
pub struct CsvStore;

impl TableStore for CsvStore {
    fn read_table(&self, path: &Path, _sheet: &str) -> Result<Option<Table>, StoreError> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let csv_err = |e| StoreError::Csv {
            path: path.to_path_buf(),
            source: e,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut table = Table::new(headers);
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            table.push_row(record.iter().map(str::to_string).collect());
        }
        Ok(Some(table))
    }

    fn write_table(&self, path: &Path, table: &Table, _sheet: &str) -> Result<(), StoreError> {
        let io_err = |e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let csv_err = |e| StoreError::Csv {
            path: path.to_path_buf(),
            source: e,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path)).map_err(io_err)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            writer.write_record(table.headers()).map_err(csv_err)?;
            for row in table.rows() {
                writer.write_record(row).map_err(csv_err)?;
            }
            writer.flush().map_err(io_err)?;
        }
        tmp.as_file_mut().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// SQLite database with one TEXT-column table per sheet label.
#[derive(Debug, Default)]
pub struct SqliteStore;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl TableStore for SqliteStore {
    fn read_table(&self, path: &Path, sheet: &str) -> Result<Option<Table>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let sql_err = |e| StoreError::Sqlite {
            path: path.to_path_buf(),
            source: e,
        };

        let conn = Connection::open(path).map_err(sql_err)?;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [sheet],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if !exists {
            return Ok(None);
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT * FROM {} ORDER BY rowid ASC",
                quote_ident(sheet)
            ))
            .map_err(sql_err)?;
        let headers: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let width = headers.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i).map(Option::unwrap_or_default))
                    .collect::<rusqlite::Result<Vec<String>>>()
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        let mut table = Table::new(headers);
        table.extend_rows(rows);
        Ok(Some(table))
    }

    fn write_table(&self, path: &Path, table: &Table, sheet: &str) -> Result<(), StoreError> {
        let sql_err = |e| StoreError::Sqlite {
            path: path.to_path_buf(),
            source: e,
        };

        let mut conn = Connection::open(path).map_err(sql_err)?;
        let tx = conn.transaction().map_err(sql_err)?;
        let name = quote_ident(sheet);
        let columns: Vec<String> = table
            .headers()
            .iter()
            .map(|h| format!("{} TEXT", quote_ident(h)))
            .collect();

        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} ({});",
            columns.join(", ")
        ))
        .map_err(sql_err)?;
        {
            let placeholders = vec!["?"; table.width()].join(", ");
            let mut insert = tx
                .prepare(&format!("INSERT INTO {name} VALUES ({placeholders})"))
                .map_err(sql_err)?;
            for row in table.rows() {
                insert
                    .execute(rusqlite::params_from_iter(row.iter()))
                    .map_err(sql_err)?;
            }
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
