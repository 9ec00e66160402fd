// Class Attendance - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod defaulters;
pub mod error;
pub mod export;
pub mod importer;
pub mod matrix;
pub mod parser;
pub mod reconciliation;
pub mod registration;

// Re-export commonly used types
pub use config::Settings;
pub use db::{
    get_events_for_entity, insert_event, setup_database, store_counts, Event, Mark, SeriesId,
    SessionId, StoreCounts,
};
pub use defaulters::{is_defaulter, DEFAULT_WINDOW};
pub use error::{AttendanceError, ParseError, Result};
pub use export::{
    attendance_file_path, defaulters_file_path, export_attendance, read_defaulters,
    write_attendance, write_matrix, ExportSummary,
};
pub use importer::{
    find_report_files, guess_report_dir, import_directory, import_report, FailurePolicy,
    ImportRun, ImportSummary,
};
pub use matrix::{AttendanceCell, AttendanceMatrix, RegistrantRow};
pub use parser::{sanitize_email, sanitize_series_id, ReportTime, Section};
pub use reconciliation::{CommitCounts, PendingBatch, Reconciler};
pub use registration::{
    apply_status_in_batches, record_status_events, RegistrationService, StatusAction,
    StatusUpdateReport, ZoomRegistrationClient, MAX_REGISTRANTS_PER_CALL,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
