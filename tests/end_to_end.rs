// End-to-end: report files on disk → store → matrix and defaulters files

use class_attendance::{
    attendance_file_path, defaulters_file_path, export_attendance, get_events_for_entity,
    import_directory, read_defaulters, setup_database, store_counts, AttendanceError,
    AttendanceMatrix, FailurePolicy,
};
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const SERIES: &str = "123456789";

fn report(start: &str, attendees: &[(&str, &str, &str)]) -> String {
    let mut text = format!(
        "Attendee Report,\n\
         Report Generated:,\"Jan 30, 2024 08:00 AM\"\n\
         Topic,Webinar ID,Actual Start Time,Actual Duration (minutes)\n\
         Gita Class,123-456-789,\"{start}\",90\n\
         Host Details,\n\
         Attended,User Name,Email,Join Time\n\
         Yes,Host,host@example.com,\"{start}\"\n\
         Panelist Details,\n\
         Attendee Details,\n\
         Attended,User Name (Original Name),Email,Registration Time,Approval Status\n"
    );
    for (attended, email, registered) in attendees {
        text.push_str(&format!("{attended},Someone,{email},\"{registered}\",approved\n"));
    }
    text
}

fn write_reports(dir: &Path) {
    let alice = ("Yes", "alice@example.com", "Dec 20, 2023 09:00:00");
    let bob = ("No", "Bob@Example.com", "Jan 01, 2024 10:00:00");
    let carol_late = ("No", "carol@example.com", "Jan 11, 2024 12:00:00");

    let files = [
        ("Jan 03, 2024 07:00 PM", vec![alice, bob]),
        ("Jan 10, 2024 07:00 PM", vec![alice, bob, carol_late]),
        ("Jan 17, 2024 07:00 PM", vec![alice, bob, carol_late]),
        (
            "Jan 24, 2024 07:00 PM",
            vec![alice, bob, carol_late, ("Yes", "dan@example.com", "Dec 20, 2023 09:00:00")],
        ),
    ];

    for (i, (start, attendees)) in files.iter().enumerate() {
        let name = format!("{SERIES} - Attendee Report {}.csv", i + 1);
        fs::write(dir.join(name), report(start, attendees)).unwrap();
    }
    fs::write(dir.join("notes.txt"), "not a report").unwrap();
}

fn open(dir: &Path) -> Connection {
    let conn = Connection::open(dir.join("attendance.db")).unwrap();
    setup_database(&conn).unwrap();
    conn
}

#[test]
fn test_import_export_round() {
    let work = TempDir::new().unwrap();
    let reports = work.path().join(format!("{SERIES} reports"));
    let output = work.path().join("output");
    fs::create_dir(&reports).unwrap();
    write_reports(&reports);

    let mut conn = open(work.path());
    let run = import_directory(&mut conn, &reports, SERIES, FailurePolicy::Abort).unwrap();
    assert_eq!(run.imported.len(), 4);
    assert!(run.is_clean());

    let summary = export_attendance(&conn, SERIES, 4, &output).unwrap();
    assert_eq!(summary.sessions, 4);
    assert_eq!(summary.registrants, 4);
    assert_eq!(summary.defaulters, 1);

    let matrix = fs::read_to_string(attendance_file_path(&output, SERIES)).unwrap();
    assert_eq!(
        matrix,
        "Email,\"Jan 03, 2024\",\"Jan 10, 2024\",\"Jan 17, 2024\",\"Jan 24, 2024\"\n\
         alice@example.com,Yes,Yes,Yes,Yes\n\
         bob@example.com,No,No,No,No\n\
         carol@example.com,NA,NA,No,No\n\
         dan@example.com,No,No,No,Yes\n"
    );

    let defaulters = read_defaulters(&defaulters_file_path(&output, SERIES)).unwrap();
    assert_eq!(defaulters, vec!["bob@example.com"]);

    // every committed file leaves an audit event
    let events = get_events_for_entity(&conn, "report", &format!("{SERIES} - Attendee Report 1.csv")).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "report_imported");
}

#[test]
fn test_reimport_changes_nothing() {
    let work = TempDir::new().unwrap();
    write_reports(work.path());
    let output = work.path().join("output");

    let mut conn = open(work.path());
    import_directory(&mut conn, work.path(), SERIES, FailurePolicy::Abort).unwrap();
    let before = store_counts(&conn).unwrap();
    export_attendance(&conn, SERIES, 4, &output).unwrap();
    let first = fs::read_to_string(attendance_file_path(&output, SERIES)).unwrap();

    let again = import_directory(&mut conn, work.path(), SERIES, FailurePolicy::Abort).unwrap();
    assert!(again
        .imported
        .iter()
        .all(|s| s.counts.registrants_inserted == 0 && s.counts.attendance_inserted == 0));
    assert_eq!(store_counts(&conn).unwrap(), before);

    export_attendance(&conn, SERIES, 4, &output).unwrap();
    let second = fs::read_to_string(attendance_file_path(&output, SERIES)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_late_registration_is_not_applicable() {
    let work = TempDir::new().unwrap();
    fs::write(
        work.path().join(format!("{SERIES} - Attendee Report.csv")),
        report(
            "Jan 10, 2024 07:00 PM",
            &[("No", "a@b.com", "Jan 11, 2024 09:00:00")],
        ),
    )
    .unwrap();

    let mut conn = open(work.path());
    import_directory(&mut conn, work.path(), SERIES, FailurePolicy::Abort).unwrap();

    let mut matrix = AttendanceMatrix::generate(&conn, SERIES).unwrap();
    let rows: Vec<_> = matrix.rows().unwrap().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].to_record(), vec!["a@b.com", "NA"]);
}

#[test]
fn test_bad_file_rolls_back_and_keep_going_continues() {
    let work = TempDir::new().unwrap();
    write_reports(work.path());
    let bad = work.path().join(format!("{SERIES} - Attendee Report 0.csv"));
    fs::write(
        &bad,
        report("Jan 02, 2024 07:00 PM", &[("Yes", "ok@example.com", "Dec 20, 2023 09:00:00"), ("Maybe", "x@example.com", "Dec 20, 2023 09:00:00")]),
    )
    .unwrap();

    let mut conn = open(work.path());
    let err = import_directory(&mut conn, work.path(), SERIES, FailurePolicy::Abort).unwrap_err();
    match err {
        AttendanceError::MalformedReport { file, line, .. } => {
            assert_eq!(file, bad);
            assert_eq!(line, 12);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store_counts(&conn).unwrap().sessions, 0);

    let run = import_directory(&mut conn, work.path(), SERIES, FailurePolicy::KeepGoing).unwrap();
    assert_eq!(run.imported.len(), 4);
    assert_eq!(run.failed.len(), 1);
    assert_eq!(store_counts(&conn).unwrap().sessions, 4);
}

#[test]
fn test_unknown_series_export_is_not_found() {
    let work = TempDir::new().unwrap();
    let conn = open(work.path());

    let err = export_attendance(&conn, "999", 4, work.path()).unwrap_err();
    assert!(err.is_not_found());
}
