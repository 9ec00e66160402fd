// 📊 Attendance Matrix - One row per registrant, one cell per session
//
// Cells are computed at query time, never stored:
//   "Yes" → a Yes mark is on record
//   "NA"  → no Yes, and the registrant registered after the session started
//   "No"  → everything else
//
// Rows stream straight off the ordered SQL query (email, then session time),
// so memory stays bounded by one registrant's row.

use crate::db::{self, AttendanceRow, Mark, SessionRecord};
use crate::error::{AttendanceError, Result};
use crate::parser::HEADER_DATE_FORMAT;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Rows, Statement};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

// ============================================================================
// CELL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceCell {
    Yes,
    No,
    #[serde(rename = "NA")]
    NotApplicable,
}

impl AttendanceCell {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceCell::Yes => "Yes",
            AttendanceCell::No => "No",
            AttendanceCell::NotApplicable => "NA",
        }
    }

    /// Effective value of one (registrant, session) pair
    pub fn compute(
        mark: Option<Mark>,
        registered_at: Option<NaiveDateTime>,
        session_start: NaiveDateTime,
    ) -> Self {
        match (mark, registered_at) {
            (Some(Mark::Yes), _) => AttendanceCell::Yes,
            (_, Some(registered)) if registered > session_start => AttendanceCell::NotApplicable,
            _ => AttendanceCell::No,
        }
    }
}

impl From<&AttendanceRow> for AttendanceCell {
    fn from(row: &AttendanceRow) -> Self {
        AttendanceCell::compute(row.mark, row.registered_at, row.session_start)
    }
}

impl fmt::Display for AttendanceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrantRow {
    pub email: String,
    pub cells: Vec<AttendanceCell>,
}

impl RegistrantRow {
    /// `[email, cell, cell, ...]` as written to CSV
    pub fn to_record(&self) -> Vec<String> {
        std::iter::once(self.email.clone())
            .chain(self.cells.iter().map(|c| c.as_str().to_string()))
            .collect()
    }
}

// ============================================================================
// MATRIX
// ============================================================================

/// Prepared matrix for one series: header now, rows on demand
pub struct AttendanceMatrix<'conn> {
    series_id: String,
    sessions: Vec<SessionRecord>,
    stmt: Statement<'conn>,
}

impl<'conn> AttendanceMatrix<'conn> {
    /// Prepare the matrix for a series.
    ///
    /// A series with no sessions is reported as not found; a series with
    /// sessions but no registrants yields a header and no rows.
    pub fn generate(conn: &'conn Connection, external_id: &str) -> Result<Self> {
        let sessions = db::list_sessions_ordered(conn, external_id)?;
        if sessions.is_empty() {
            error!("Unknown series id: {}", external_id);
            return Err(AttendanceError::SeriesNotFound(external_id.to_string()));
        }

        Ok(AttendanceMatrix {
            series_id: external_id.to_string(),
            sessions,
            stmt: db::prepare_attendance_rows(conn)?,
        })
    }

    pub fn sessions(&self) -> &[SessionRecord] {
        &self.sessions
    }

    /// `["Email", "Jan 10, 2024", ...]`, sessions oldest first
    pub fn header(&self) -> Vec<String> {
        std::iter::once("Email".to_string())
            .chain(
                self.sessions
                    .iter()
                    .map(|s| s.start.format(HEADER_DATE_FORMAT).to_string()),
            )
            .collect()
    }

    /// Registrant rows in ascending email order
    pub fn rows(&mut self) -> Result<MatrixRows<'_>> {
        let rows = self.stmt.query(params![self.series_id])?;
        Ok(MatrixRows {
            rows,
            pending: None,
        })
    }
}

/// Lazy iterator grouping consecutive query rows by email
pub struct MatrixRows<'stmt> {
    rows: Rows<'stmt>,
    pending: Option<AttendanceRow>,
}

impl MatrixRows<'_> {
    fn fetch(&mut self) -> Result<Option<AttendanceRow>> {
        match self.rows.next()? {
            Some(row) => Ok(Some(db::attendance_row(row)?)),
            None => Ok(None),
        }
    }
}

impl Iterator for MatrixRows<'_> {
    type Item = Result<RegistrantRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => match self.fetch() {
                Ok(Some(row)) => row,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            },
        };

        let mut current = RegistrantRow {
            cells: vec![AttendanceCell::from(&first)],
            email: first.email,
        };

        loop {
            match self.fetch() {
                Ok(Some(row)) if row.email == current.email => {
                    current.cells.push(AttendanceCell::from(&row));
                }
                Ok(Some(row)) => {
                    self.pending = Some(row);
                    break;
                }
                Ok(None) => break,
                Err(e) => return Some(Err(e)),
            }
        }

        Some(Ok(current))
    }
}

// ============================================================================
// TESTS
// ============================================================================
