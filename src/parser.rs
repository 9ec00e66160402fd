// 🏗️ Report Parser - Attendee report line classification
// Zoom attendee reports are one CSV file with several embedded sections.
// This module knows the sections, the field formats and the per-line rules;
// the importer threads the scan state through it line by line.

use crate::db::Mark;
use crate::error::ParseError;
use chrono::{NaiveDate, NaiveDateTime};

// ============================================================================
// FORMATS
// ============================================================================

/// Session start time as written in the topic section ("Jan 10, 2024 07:00 PM")
pub const SESSION_TIME_FORMAT: &str = "%b %d, %Y %I:%M %p";

/// Registration time as written in the attendee section ("Jan 11, 2024 09:15:00")
pub const REGISTRATION_TIME_FORMAT: &str = "%b %d, %Y %H:%M:%S";

/// Normalized, sortable form used as identity in the store
pub const INTERNAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column header date in the exported matrix
pub const HEADER_DATE_FORMAT: &str = "%b %d, %Y";

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// First cell of the attendee column header line
pub const ATTENDEE_HEADER_MARKER: &str = "Attended";
pub const EMAIL_COLUMN: &str = "Email";
pub const REGISTRATION_TIME_COLUMN: &str = "Registration Time";

// ============================================================================
// CORE TYPES
// ============================================================================

/// Section - Which part of the report a line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    ReportPreamble,
    Topic,
    Host,
    Panelist,
    AttendeeDetails,
    OtherAttended,
}

impl Section {
    pub const ALL: [Section; 6] = [
        Section::ReportPreamble,
        Section::Topic,
        Section::Host,
        Section::Panelist,
        Section::AttendeeDetails,
        Section::OtherAttended,
    ];

    /// Prefix of the first cell that opens this section
    pub fn marker(&self) -> &'static str {
        match self {
            Section::ReportPreamble => "Attendee Report",
            Section::Topic => "Topic",
            Section::Host => "Host Details",
            Section::Panelist => "Panelist Details",
            Section::AttendeeDetails => "Attendee Details",
            Section::OtherAttended => "Other Attended",
        }
    }

    /// Section opened by a line whose first cell is `first_cell`, if any
    pub fn detect(first_cell: &str) -> Option<Section> {
        let cell = first_cell.trim();
        Section::ALL
            .into_iter()
            .find(|section| cell.starts_with(section.marker()))
    }
}

/// A timestamp kept in both its source text and its normalized value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTime {
    pub normalized: NaiveDateTime,
    pub original: String,
}

impl ReportTime {
    /// Normalized text form stored in the database
    pub fn internal(&self) -> String {
        self.normalized.format(INTERNAL_TIME_FORMAT).to_string()
    }
}

/// Topic line: one occurrence of a class series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeclaration {
    pub series_id: String,
    pub topic: String,
    pub start: ReportTime,
}

/// Column positions declared by the attendee header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendeeColumns {
    pub email: usize,
    pub registration_time: usize,
}

/// One attendee row, already validated and normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceLine {
    pub attended: Mark,
    pub email: String,
    pub registered_at: Option<ReportTime>,
}

/// Typed event produced for every line of a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLine {
    Ignored,
    SessionDeclared(SessionDeclaration),
    AttendeeColumns(AttendeeColumns),
    Attendance(AttendanceLine),
}

// ============================================================================
// LINE CLASSIFICATION
// ============================================================================

/// Interpret one trimmed line given the section it falls in.
///
/// `columns` is the attendee layout seen so far in this file; attendee
/// rows are rejected until a header has declared it.
pub fn parse_line(
    section: Option<Section>,
    cells: &[String],
    columns: Option<AttendeeColumns>,
) -> Result<ReportLine, ParseError> {
    let Some(section) = section else {
        return Ok(ReportLine::Ignored);
    };
    let first = cells.first().map(String::as_str).unwrap_or("");

    match section {
        Section::ReportPreamble | Section::Host | Section::Panelist | Section::OtherAttended => {
            Ok(ReportLine::Ignored)
        }
        Section::Topic => parse_topic_line(first, cells),
        Section::AttendeeDetails => parse_attendee_line(first, cells, columns),
    }
}

fn parse_topic_line(first: &str, cells: &[String]) -> Result<ReportLine, ParseError> {
    if first.is_empty() || first.starts_with(Section::Topic.marker()) {
        return Ok(ReportLine::Ignored);
    }

    let raw_id = non_empty_cell(cells, 1).ok_or(ParseError::IncompleteTopic)?;
    let raw_start = non_empty_cell(cells, 2).ok_or(ParseError::IncompleteTopic)?;

    Ok(ReportLine::SessionDeclared(SessionDeclaration {
        series_id: sanitize_series_id(raw_id)?,
        topic: first.to_string(),
        start: parse_report_time(raw_start, SESSION_TIME_FORMAT)?,
    }))
}

fn parse_attendee_line(
    first: &str,
    cells: &[String],
    columns: Option<AttendeeColumns>,
) -> Result<ReportLine, ParseError> {
    if first.starts_with(Section::AttendeeDetails.marker()) {
        return Ok(ReportLine::Ignored);
    }
    if first.starts_with(ATTENDEE_HEADER_MARKER) {
        return attendee_columns(cells).map(ReportLine::AttendeeColumns);
    }
    if first.is_empty() {
        return Ok(ReportLine::Ignored);
    }

    let columns = columns.ok_or(ParseError::ColumnsNotConfigured)?;
    let attended = Mark::parse(first)?;

    let raw_email = cells
        .get(columns.email)
        .ok_or(ParseError::ShortLine(columns.email + 1))?;
    let email = sanitize_email(raw_email)?;

    let registered_at = match non_empty_cell(cells, columns.registration_time) {
        Some(raw) => Some(parse_report_time(raw, REGISTRATION_TIME_FORMAT)?),
        None => None,
    };

    Ok(ReportLine::Attendance(AttendanceLine {
        attended,
        email,
        registered_at,
    }))
}

/// Locate the email and registration-time columns in a header line
pub fn attendee_columns(cells: &[String]) -> Result<AttendeeColumns, ParseError> {
    let position = |name: &str| {
        cells
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ParseError::MissingColumn(name.to_string()))
    };

    Ok(AttendeeColumns {
        email: position(EMAIL_COLUMN)?,
        registration_time: position(REGISTRATION_TIME_COLUMN)?,
    })
}

fn non_empty_cell(cells: &[String], index: usize) -> Option<&str> {
    cells
        .get(index)
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

// ============================================================================
// FIELD SANITIZERS
// ============================================================================

/// Lower-case, trim and validate an email address.
///
/// Exactly one '@', non-empty local part, and a domain with at least two
/// non-empty dot-separated labels.
pub fn sanitize_email(raw: &str) -> Result<String, ParseError> {
    let email = raw.trim().to_lowercase();
    let invalid = || ParseError::InvalidEmail(email.clone());

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    if local.is_empty() || domain.is_empty() {
        return Err(invalid());
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }

    Ok(email)
}

/// Strip '-' and spaces from an external series id and require digits.
pub fn sanitize_series_id(raw: &str) -> Result<String, ParseError> {
    let id: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();

    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::InvalidSeriesId(raw.trim().to_string()));
    }

    Ok(id)
}

/// Parse a report timestamp, trying `preferred` first.
///
/// Other accepted shapes: the session format, the registration format,
/// the internal ISO format and a bare ISO date (midnight).
pub fn parse_report_time(raw: &str, preferred: &str) -> Result<ReportTime, ParseError> {
    let value = raw.trim();
    let candidates = [
        preferred,
        SESSION_TIME_FORMAT,
        REGISTRATION_TIME_FORMAT,
        INTERNAL_TIME_FORMAT,
    ];

    let parsed = candidates
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, ISO_DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        });

    match parsed {
        Some(normalized) => Ok(ReportTime {
            normalized,
            original: value.to_string(),
        }),
        None => Err(ParseError::InvalidTimestamp {
            value: value.to_string(),
            expected: preferred.to_string(),
        }),
    }
}

/// Parse a timestamp read back from the store
pub fn parse_internal_time(raw: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(raw, INTERNAL_TIME_FORMAT).map_err(|_| {
        ParseError::InvalidTimestamp {
            value: raw.to_string(),
            expected: INTERNAL_TIME_FORMAT.to_string(),
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================
