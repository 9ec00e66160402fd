// ❗ Error kinds
// Malformed input, not-found and external-service failures stay distinct
// so the operator can tell "bad file" from "nothing there" from "Zoom said no".

use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// LINE-LEVEL PARSE ERRORS
// ============================================================================

/// Problems found while reading a single line of an attendee report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid email address: '{0}'")]
    InvalidEmail(String),

    #[error("invalid timestamp '{value}' (expected {expected})")]
    InvalidTimestamp { value: String, expected: String },

    #[error("invalid series id '{0}': expected digits with optional '-' separators")]
    InvalidSeriesId(String),

    #[error("unknown attendance value '{0}' (expected Yes or No)")]
    UnknownAttendance(String),

    #[error("attendee header has no '{0}' column")]
    MissingColumn(String),

    #[error("line has no value in column {0}")]
    ShortLine(usize),

    #[error("attendee line appears before the attendee column header")]
    ColumnsNotConfigured,

    #[error("attendee line appears before any topic line")]
    NoSessionDeclared,

    #[error("topic line is missing the series id or start time")]
    IncompleteTopic,

    #[error("CSV error: {0}")]
    Csv(String),
}

// ============================================================================
// TOP-LEVEL ERRORS
// ============================================================================

/// All errors produced by the attendance library.
#[derive(Error, Debug)]
pub enum AttendanceError {
    /// A report could not be imported; nothing from that file was committed.
    #[error("{}:{line}: {source}", file.display())]
    MalformedReport {
        file: PathBuf,
        line: u64,
        #[source]
        source: ParseError,
    },

    /// A store or I/O failure while importing one line of a report; the
    /// file's transaction was rolled back.
    #[error("{}:{line}: {source}", file.display())]
    ImportFailed {
        file: PathBuf,
        line: u64,
        #[source]
        source: Box<AttendanceError>,
    },

    /// The series has no sessions on record (distinct from "no registrants").
    #[error("unknown series id: {0}")]
    SeriesNotFound(String),

    /// A file the caller asked for does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// One batch of a registrant status change was rejected.
    #[error("status change batch {batch} failed for {} registrant(s): {message}", emails.len())]
    ExternalService {
        batch: usize,
        emails: Vec<String>,
        message: String,
    },

    /// The registration service answered with a non-success status.
    #[error("registration service returned HTTP {status}: {body}")]
    ServiceRejected { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AttendanceError {
    pub fn malformed(file: impl Into<PathBuf>, line: u64, source: ParseError) -> Self {
        AttendanceError::MalformedReport {
            file: file.into(),
            line,
            source,
        }
    }

    /// Attach the report position to an error raised while importing.
    /// Errors that already carry a position are returned unchanged.
    pub fn in_file(self, file: impl Into<PathBuf>, line: u64) -> Self {
        match self {
            AttendanceError::MalformedReport { .. } | AttendanceError::ImportFailed { .. } => self,
            other => AttendanceError::ImportFailed {
                file: file.into(),
                line,
                source: Box::new(other),
            },
        }
    }

    /// File and 1-based line of a failed import, if known
    pub fn position(&self) -> Option<(&Path, u64)> {
        match self {
            AttendanceError::MalformedReport { file, line, .. }
            | AttendanceError::ImportFailed { file, line, .. } => Some((file.as_path(), *line)),
            _ => None,
        }
    }

    /// True for the "does not exist" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AttendanceError::SeriesNotFound(_) | AttendanceError::FileNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;
