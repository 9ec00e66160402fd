// 📥 Report Importer - Stream attendee reports into the store
//
// One file = one SQLite transaction. The scan state (current section,
// attendee column layout, current session) is a plain value threaded
// through the loop; each line either leaves it alone, changes it, or
// queues changes in the reconciler. Any error drops the transaction.

use crate::db::{self, Event};
use crate::error::{AttendanceError, ParseError, Result};
use crate::parser::{parse_line, AttendeeColumns, ReportLine, Section};
use crate::reconciliation::{CommitCounts, MarkDecision, Reconciler, SessionContext};
use csv::{ReaderBuilder, StringRecord, Trim};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// File names look like "<series id> - Attendee Report....csv"
pub const REPORT_FILE_MARKER: &str = " - Attendee Report";

// ============================================================================
// SCAN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScanState {
    section: Option<Section>,
    columns: Option<AttendeeColumns>,
    session: Option<SessionContext>,
}

/// Outcome of importing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub file: PathBuf,
    pub sha256: String,
    pub lines: u64,
    pub series: Vec<String>,
    pub sessions: usize,
    pub attendee_lines: usize,
    pub counts: CommitCounts,
}

/// What to do when one file of a directory fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Abort,
    KeepGoing,
}

/// Outcome of importing every report of a series from a directory
#[derive(Debug, Default)]
pub struct ImportRun {
    pub imported: Vec<ImportSummary>,
    pub failed: Vec<(PathBuf, AttendanceError)>,
}

impl ImportRun {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// SINGLE FILE
// ============================================================================

/// Import one attendee report. Either the whole file is committed or none of it.
pub fn import_report(conn: &mut Connection, path: &Path) -> Result<ImportSummary> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => AttendanceError::FileNotFound(path.to_path_buf()),
        _ => AttendanceError::Io(e),
    })?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes.as_slice());

    let tx = conn.transaction()?;
    let mut reconciler = Reconciler::new();
    let mut state = ScanState::default();
    let mut record = StringRecord::new();
    let mut sessions = Vec::new();
    let mut series: Vec<String> = Vec::new();
    let mut attendee_lines = 0;
    let mut line = 0;

    loop {
        let next_line = reader.position().line();
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                return Err(AttendanceError::malformed(path, next_line, ParseError::Csv(e.to_string())))
            }
        }
        line = record.position().map(|p| p.line()).unwrap_or(next_line);

        let cells: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, c)| if i == 0 { c.trim_start_matches('\u{feff}').trim() } else { c.trim() })
            .map(str::to_string)
            .collect();

        if let Some(section) = cells.first().and_then(|c| Section::detect(c)) {
            if state.section != Some(section) {
                debug!("At line {}: Got section {}", line, section.marker());
            }
            state.section = Some(section);
        }

        let parsed = parse_line(state.section, &cells, state.columns)
            .map_err(|e| AttendanceError::malformed(path, line, e));

        let event = match parsed {
            Ok(event) => event,
            Err(e) => {
                error!("**** Error in file {} at line {}: {:?}", path.display(), line, cells);
                return Err(e);
            }
        };

        match event {
            ReportLine::Ignored => {}
            ReportLine::AttendeeColumns(columns) => {
                state.columns = Some(columns);
            }
            ReportLine::SessionDeclared(decl) => {
                let series_id = db::find_or_create_series(&tx, &decl.series_id, &decl.topic)
                    .map_err(|e| failed_at(path, line, &cells, e))?;
                let session_id = db::find_or_create_session(&tx, series_id, &decl.start)
                    .map_err(|e| failed_at(path, line, &cells, e))?;
                info!(
                    "Session {} of series {} ({})",
                    decl.start.original, decl.series_id, decl.topic
                );
                state.session = Some(SessionContext { series_id, session_id });
                if !sessions.contains(&session_id) {
                    sessions.push(session_id);
                }
                if !series.contains(&decl.series_id) {
                    series.push(decl.series_id);
                }
            }
            ReportLine::Attendance(attendance) => {
                let Some(session) = state.session else {
                    error!("**** Error in file {} at line {}: {:?}", path.display(), line, cells);
                    return Err(AttendanceError::malformed(path, line, ParseError::NoSessionDeclared));
                };
                let decision = reconciler
                    .observe(&tx, session, &attendance)
                    .map_err(|e| failed_at(path, line, &cells, e))?;
                if decision != MarkDecision::Unchanged {
                    debug!("{} → {:?} ({})", attendance.email, decision, attendance.attended.as_str());
                }
                attendee_lines += 1;
            }
        }
    }

    let counts = reconciler
        .finish()
        .apply(&tx)
        .map_err(|e| failed_at(path, line, &[], e))?;
    info!("{} registrant records inserted", counts.registrants_inserted);
    info!("{} registrant records updated", counts.registrants_updated);
    info!("{} attendee records inserted", counts.attendance_inserted);
    info!("{} attendee records updated", counts.attendance_updated);

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.csv")
        .to_string();

    db::insert_event(
        &tx,
        &Event::new(
            "report_imported",
            "report",
            &file_name,
            serde_json::json!({
                "sha256": sha256,
                "series": series,
                "lines": line,
                "attendee_lines": attendee_lines,
                "registrants_inserted": counts.registrants_inserted,
                "registrants_updated": counts.registrants_updated,
                "attendance_inserted": counts.attendance_inserted,
                "attendance_updated": counts.attendance_updated,
            }),
            "report_importer",
        ),
    )
    .map_err(|e| failed_at(path, line, &[], e))?;

    tx.commit().map_err(|e| failed_at(path, line, &[], e.into()))?;

    Ok(ImportSummary {
        file: path.to_path_buf(),
        sha256,
        lines: line,
        series,
        sessions: sessions.len(),
        attendee_lines,
        counts,
    })
}

/// Log a failure with its position and tag the error with file and line
fn failed_at(path: &Path, line: u64, cells: &[String], err: AttendanceError) -> AttendanceError {
    error!("**** Error in file {} at line {}: {:?}", path.display(), line, cells);
    error!("{}", err);
    err.in_file(path, line)
}

// ============================================================================
// DIRECTORY DISCOVERY
// ============================================================================

/// Report files for one series, in file-name order
pub fn find_report_files(dir: &Path, series_id: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(AttendanceError::FileNotFound(dir.to_path_buf()));
    }

    let prefix = format!("{}{}", series_id, REPORT_FILE_MARKER);
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(&prefix))
            .unwrap_or(false);

        if matches && path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// First directory under `base` (by name) whose name contains the series id
pub fn guess_report_dir(base: &Path, series_id: &str) -> Result<Option<PathBuf>> {
    let mut candidates = Vec::new();

    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        let name_matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(series_id))
            .unwrap_or(false);

        if name_matches && path.is_dir() {
            candidates.push(path);
        }
    }

    candidates.sort();
    if let Some(dir) = candidates.first() {
        info!("Found directory '{}'", dir.display());
    }
    Ok(candidates.into_iter().next())
}

/// Import every report of `series_id` found in `dir`, one file at a time.
pub fn import_directory(
    conn: &mut Connection,
    dir: &Path,
    series_id: &str,
    policy: FailurePolicy,
) -> Result<ImportRun> {
    let files = find_report_files(dir, series_id)?;
    if files.is_empty() {
        warn!("No attendee reports for {} in {}", series_id, dir.display());
    }

    let mut run = ImportRun::default();
    for file in files {
        info!("Processing file: {}", file.display());
        match import_report(conn, &file) {
            Ok(summary) => {
                info!("Done");
                run.imported.push(summary);
            }
            Err(e) if policy == FailurePolicy::KeepGoing => {
                error!("Skipping {}: {}", file.display(), e);
                run.failed.push((file, e));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(run)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{find_series, get_events_for_entity, list_attendance_rows, setup_database, store_counts, Mark};
    use tempfile::TempDir;

    const REPORT: &str = "\
Attendee Report,
Report Generated:,\"Jan 11, 2024 08:00 AM\"
Topic,Webinar ID,Actual Start Time,Actual Duration (minutes)
Gita Class,123-456-789,\"Jan 10, 2024 07:00 PM\",90
Host Details,
Attended,User Name,Email,Join Time
Yes,Host,host@example.com,\"Jan 10, 2024 06:55 PM\"
Panelist Details,
Attendee Details,
Attended,User Name (Original Name),Email,Registration Time,Approval Status
Yes,Alice,Alice@Example.com,\"Jan 02, 2024 10:00:00\",approved
No,Bob,bob@example.com,\"Jan 03, 2024 11:30:00\",approved
,,,,
No,Alice,alice@example.com,\"Jan 01, 2024 09:00:00\",approved
Other Attended,
Attended,User Name,Email
Yes,Guest,not-an-email
";

    fn open() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        (dir, conn)
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_import_report_sections() {
        let (dir, mut conn) = open();
        let path = write(&dir, "123456789 - Attendee Report.csv", REPORT);

        let summary = import_report(&mut conn, &path).unwrap();

        assert_eq!(summary.series, vec!["123456789".to_string()]);
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.attendee_lines, 3);
        assert_eq!(summary.counts.registrants_inserted, 2);
        assert_eq!(summary.counts.attendance_inserted, 2);
        assert_eq!(summary.sha256.len(), 64);

        let rows = list_attendance_rows(&conn, "123456789").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].email, "alice@example.com");
        assert_eq!(rows[0].mark, Some(Mark::Yes));
        // earliest registration time from the two alice lines
        assert_eq!(rows[0].registered_at.unwrap().to_string(), "2024-01-01 09:00:00");
        assert_eq!(rows[1].email, "bob@example.com");
        assert_eq!(rows[1].mark, Some(Mark::No));

        let events = get_events_for_entity(&conn, "report", "123456789 - Attendee Report.csv").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["sha256"], summary.sha256);
    }

    #[test]
    fn test_import_twice_is_idempotent() {
        let (dir, mut conn) = open();
        let path = write(&dir, "123456789 - Attendee Report.csv", REPORT);

        import_report(&mut conn, &path).unwrap();
        let first = store_counts(&conn).unwrap();
        let rows_first = list_attendance_rows(&conn, "123456789").unwrap();

        let again = import_report(&mut conn, &path).unwrap();
        assert_eq!(again.counts, CommitCounts::default());
        assert_eq!(store_counts(&conn).unwrap(), first);
        assert_eq!(list_attendance_rows(&conn, "123456789").unwrap(), rows_first);
    }

    #[test]
    fn test_bad_email_aborts_whole_file() {
        let (dir, mut conn) = open();
        let bad = REPORT.replace("bob@example.com", "bob@example");
        let path = write(&dir, "123456789 - Attendee Report.csv", &bad);

        let err = import_report(&mut conn, &path).unwrap_err();
        match &err {
            AttendanceError::MalformedReport { file, line, source } => {
                assert_eq!(file, &path);
                assert_eq!(*line, 12);
                assert_eq!(source, &ParseError::InvalidEmail("bob@example".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }

        // nothing committed, not even the series
        assert_eq!(store_counts(&conn).unwrap(), db::StoreCounts::default());
        assert_eq!(find_series(&conn, "123456789").unwrap(), None);
    }

    #[test]
    fn test_attendee_before_topic_is_rejected() {
        let (dir, mut conn) = open();
        let content = "\
Attendee Details,
Attended,User Name,Email,Registration Time
Yes,Alice,alice@example.com,
";
        let path = write(&dir, "1 - Attendee Report.csv", content);

        let err = import_report(&mut conn, &path).unwrap_err();
        assert!(matches!(
            err,
            AttendanceError::MalformedReport { line: 3, source: ParseError::NoSessionDeclared, .. }
        ));
    }

    #[test]
    fn test_multiple_topics_in_one_file() {
        let (dir, mut conn) = open();
        let content = "\
Topic,Webinar ID,Actual Start Time
Gita Class,111,\"Jan 10, 2024 07:00 PM\"
Attendee Details,
Attended,User Name,Email,Registration Time
Yes,Alice,alice@example.com,
Topic,Webinar ID,Actual Start Time
Gita Class,111,\"Jan 17, 2024 07:00 PM\"
Attendee Details,
Attended,User Name,Email,Registration Time
No,Alice,alice@example.com,
";
        let path = write(&dir, "111 - Attendee Report.csv", content);

        let summary = import_report(&mut conn, &path).unwrap();
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.counts.registrants_inserted, 1);
        assert_eq!(summary.counts.attendance_inserted, 2);

        let marks: Vec<Option<Mark>> = list_attendance_rows(&conn, "111")
            .unwrap()
            .into_iter()
            .map(|r| r.mark)
            .collect();
        assert_eq!(marks, vec![Some(Mark::Yes), Some(Mark::No)]);
    }

    #[test]
    fn test_store_rejection_names_file_and_line() {
        let (dir, mut conn) = open();
        let report = |id: &str| {
            format!(
                "Topic,Webinar ID,Actual Start Time\n\
                 Gita Class,{id},\"Jan 10, 2024 07:00 PM\"\n\
                 Attendee Details,\n\
                 Attended,User Name,Email,Registration Time\n\
                 Yes,Alice,alice@example.com,\n"
            )
        };
        let first = write(&dir, "111 - Attendee Report.csv", &report("111"));
        let second = write(&dir, "222 - Attendee Report.csv", &report("222"));

        import_report(&mut conn, &first).unwrap();
        let before = store_counts(&conn).unwrap();
        let err = import_report(&mut conn, &second).unwrap_err();

        match &err {
            AttendanceError::ImportFailed { file, line, source } => {
                assert_eq!(file, &second);
                assert_eq!(*line, 2);
                assert!(matches!(**source, AttendanceError::Database(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("222 - Attendee Report.csv:2:"));
        assert_eq!(store_counts(&conn).unwrap(), before);
        assert_eq!(find_series(&conn, "222").unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (dir, mut conn) = open();
        let err = import_report(&mut conn, &dir.path().join("nope.csv")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_find_report_files_filters_and_sorts() {
        let (dir, _conn) = open();
        write(&dir, "111 - Attendee Report 2.csv", "");
        write(&dir, "111 - Attendee Report 1.csv", "");
        write(&dir, "222 - Attendee Report 1.csv", "");
        write(&dir, "111 - Registration Report.csv", "");

        let files = find_report_files(dir.path(), "111").unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["111 - Attendee Report 1.csv", "111 - Attendee Report 2.csv"]);
    }

    #[test]
    fn test_guess_report_dir() {
        let (dir, _conn) = open();
        fs::create_dir(dir.path().join("Gita 111 reports")).unwrap();
        fs::create_dir(dir.path().join("other")).unwrap();
        write(&dir, "111.txt", "");

        let found = guess_report_dir(dir.path(), "111").unwrap().unwrap();
        assert!(found.ends_with("Gita 111 reports"));
        assert_eq!(guess_report_dir(dir.path(), "999").unwrap(), None);
    }

    #[test]
    fn test_import_directory_policies() {
        let (dir, mut conn) = open();
        write(&dir, "123456789 - Attendee Report 1.csv", &REPORT.replace("bob@example.com", "bob@"));
        write(&dir, "123456789 - Attendee Report 2.csv", REPORT);

        let err = import_directory(&mut conn, dir.path(), "123456789", FailurePolicy::Abort).unwrap_err();
        assert!(matches!(err, AttendanceError::MalformedReport { .. }));
        assert_eq!(store_counts(&conn).unwrap().attendance, 0);

        let run = import_directory(&mut conn, dir.path(), "123456789", FailurePolicy::KeepGoing).unwrap();
        assert!(!run.is_clean());
        assert_eq!(run.failed.len(), 1);
        assert_eq!(run.imported.len(), 1);
        assert_eq!(store_counts(&conn).unwrap().attendance, 2);
    }
}
