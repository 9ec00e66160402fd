// 📤 Export - Attendance matrix and defaulters as CSV
// Both files are written in the same pass over the matrix, so the
// defaulters list comes out in the same ascending email order.

use crate::defaulters::is_defaulter;
use crate::error::{AttendanceError, Result};
use crate::matrix::AttendanceMatrix;
use rusqlite::Connection;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Totals for one export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub sessions: usize,
    pub registrants: usize,
    pub defaulters: usize,
}

pub fn attendance_file_path(output_dir: &Path, series_id: &str) -> PathBuf {
    output_dir.join(format!("{}-AttendanceByEmail.csv", series_id))
}

pub fn defaulters_file_path(output_dir: &Path, series_id: &str) -> PathBuf {
    output_dir.join(format!("{}-Defaulters.csv", series_id))
}

/// Stream the matrix of `series_id` into two CSV writers.
pub fn write_attendance<A: Write, D: Write>(
    conn: &Connection,
    series_id: &str,
    window: usize,
    attendance: A,
    defaulters: D,
) -> Result<ExportSummary> {
    let mut matrix = AttendanceMatrix::generate(conn, series_id)?;
    write_matrix(&mut matrix, window, attendance, defaulters)
}

/// Write an already prepared matrix and its defaulters.
pub fn write_matrix<A: Write, D: Write>(
    matrix: &mut AttendanceMatrix<'_>,
    window: usize,
    attendance: A,
    defaulters: D,
) -> Result<ExportSummary> {
    let mut attendance = csv::Writer::from_writer(attendance);
    let mut defaulters = csv::Writer::from_writer(defaulters);

    attendance.write_record(matrix.header())?;
    defaulters.write_record(["Email"])?;

    let mut summary = ExportSummary {
        sessions: matrix.sessions().len(),
        ..ExportSummary::default()
    };

    for row in matrix.rows()? {
        let row = row?;
        if is_defaulter(&row.cells, window) {
            defaulters.write_record([row.email.as_str()])?;
            summary.defaulters += 1;
        }
        attendance.write_record(row.to_record())?;
        summary.registrants += 1;
    }

    attendance.flush()?;
    defaulters.flush()?;

    info!(
        "Registrants: {} | Defaulters: {}",
        summary.registrants, summary.defaulters
    );
    Ok(summary)
}

/// Write `<id>-AttendanceByEmail.csv` and `<id>-Defaulters.csv` under `output_dir`.
pub fn export_attendance(
    conn: &Connection,
    series_id: &str,
    window: usize,
    output_dir: &Path,
) -> Result<ExportSummary> {
    info!(
        "Considering {} consecutive sessions absent as defaulter",
        window
    );

    // Fail on an unknown series before truncating any earlier export
    let mut matrix = AttendanceMatrix::generate(conn, series_id)?;

    std::fs::create_dir_all(output_dir)?;
    let attendance_path = attendance_file_path(output_dir, series_id);
    let defaulters_path = defaulters_file_path(output_dir, series_id);

    info!("Writing attendance to {}", attendance_path.display());
    info!("Writing defaulters to {}", defaulters_path.display());
    write_matrix(
        &mut matrix,
        window,
        File::create(&attendance_path)?,
        File::create(&defaulters_path)?,
    )
}

/// Read a defaulters file back: header skipped, emails trimmed and lower-cased.
pub fn read_defaulters(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(AttendanceError::FileNotFound(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut emails = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(email) = record.get(0).map(|e| e.trim().to_lowercase()) {
            if !email.is_empty() {
                emails.push(email);
            }
        }
    }

    Ok(emails)
}
