use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use class_attendance::config::LOG_FILE;
use class_attendance::{
    apply_status_in_batches, defaulters_file_path, export_attendance, guess_report_dir,
    import_directory, read_defaulters, record_status_events, sanitize_series_id,
    setup_database, FailurePolicy, Settings, StatusAction, ZoomRegistrationClient,
};

#[derive(Parser, Debug)]
#[command(
    name = "class-attendance",
    version,
    about = "Attendance tracking for recurring webinar classes"
)]
struct Cli {
    /// Settings file (created with defaults if missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import every attendee report of a series, then export
    Import {
        series_id: String,

        /// Directory holding the reports (guessed from the series id otherwise)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Skip files that fail to import instead of stopping
        #[arg(long)]
        keep_going: bool,

        /// Trailing sessions absent before a registrant is a defaulter
        #[arg(long)]
        window: Option<usize>,
    },

    /// Write the attendance matrix and defaulters files from the store
    Export {
        series_id: String,

        #[arg(long)]
        window: Option<usize>,
    },

    /// Change the registration status of every listed defaulter
    RemoveDefaulters {
        series_id: String,

        #[arg(long, value_enum, default_value_t = RemovalAction::Cancel)]
        action: RemovalAction,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,

        /// Bearer token (overrides the settings file)
        #[arg(long, env = "CLASS_ATTENDANCE_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RemovalAction {
    Cancel,
    Deny,
}

impl From<RemovalAction> for StatusAction {
    fn from(action: RemovalAction) -> Self {
        match action {
            RemovalAction::Cancel => StatusAction::Cancel,
            RemovalAction::Deny => StatusAction::Deny,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_create(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;

    // Held until exit so buffered file logs are flushed
    let _log_guard = setup_logging(&cli.log_level, &settings.log_dir())?;

    match cli.command {
        Commands::Import {
            series_id,
            dir,
            keep_going,
            window,
        } => run_import(&settings, &series_id, dir, keep_going, window),
        Commands::Export { series_id, window } => run_export(&settings, &series_id, window),
        Commands::RemoveDefaulters {
            series_id,
            action,
            yes,
            api_token,
        } => run_remove_defaulters(&settings, &series_id, action.into(), yes, api_token),
    }
}

/// stderr at `--log-level` (or RUST_LOG), plus a debug-level file under
/// `log_dir` rotated at midnight.
fn setup_logging(log_level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(stderr_filter);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_dir.join(LOG_FILE).display());
    Ok(guard)
}

fn open_store(settings: &Settings) -> Result<Connection> {
    let db_path = settings.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn window_or_default(settings: &Settings, window: Option<usize>) -> Result<usize> {
    let window = window.unwrap_or(settings.attendance.default_days);
    if window == 0 {
        bail!("--window must be at least 1");
    }
    Ok(window)
}

fn run_import(
    settings: &Settings,
    series_id: &str,
    dir: Option<PathBuf>,
    keep_going: bool,
    window: Option<usize>,
) -> Result<()> {
    let series_id = sanitize_series_id(series_id)?;
    let window = window_or_default(settings, window)?;

    let dir = match dir {
        Some(dir) => dir,
        None => guess_report_dir(Path::new("."), &series_id)?
            .with_context(|| format!("No directory containing '{}' found; pass --dir", series_id))?,
    };

    let mut conn = open_store(settings)?;
    let policy = if keep_going {
        FailurePolicy::KeepGoing
    } else {
        FailurePolicy::Abort
    };

    let run = import_directory(&mut conn, &dir, &series_id, policy)
        .with_context(|| format!("Import from {} stopped", dir.display()))?;
    info!("Imported {} file(s)", run.imported.len());

    let summary = export_attendance(&conn, &series_id, window, &settings.output_dir())?;
    println!(
        "Registrants: {} | Defaulters: {}",
        summary.registrants, summary.defaulters
    );

    if !run.is_clean() {
        for (file, e) in &run.failed {
            eprintln!("failed: {}: {}", file.display(), e);
        }
        bail!("{} file(s) could not be imported", run.failed.len());
    }

    Ok(())
}

fn run_export(settings: &Settings, series_id: &str, window: Option<usize>) -> Result<()> {
    let series_id = sanitize_series_id(series_id)?;
    let window = window_or_default(settings, window)?;
    let conn = open_store(settings)?;

    let summary = export_attendance(&conn, &series_id, window, &settings.output_dir())?;
    println!(
        "Registrants: {} | Defaulters: {}",
        summary.registrants, summary.defaulters
    );
    Ok(())
}

fn run_remove_defaulters(
    settings: &Settings,
    series_id: &str,
    action: StatusAction,
    yes: bool,
    api_token: Option<String>,
) -> Result<()> {
    let series_id = sanitize_series_id(series_id)?;
    let path = defaulters_file_path(&settings.output_dir(), &series_id);
    let emails = read_defaulters(&path)
        .with_context(|| format!("Run `class-attendance export {}` first", series_id))?;

    if emails.is_empty() {
        println!("No defaulters listed in {}", path.display());
        return Ok(());
    }

    let token = api_token.unwrap_or_else(|| settings.registration.api_token.clone());
    if token.trim().is_empty() {
        bail!("No API token: set registration.api_token or CLASS_ATTENDANCE_API_TOKEN");
    }

    if !yes && !confirm(&format!("{} {} registrant(s) of {}?", action, emails.len(), series_id))? {
        warn!("Aborted by user");
        return Ok(());
    }

    let client = ZoomRegistrationClient::new(&settings.registration.api_base_url, &token)?;
    let report = apply_status_in_batches(&client, &series_id, action, &emails);

    let conn = open_store(settings)?;
    record_status_events(&conn, &report, "cli")?;

    for batch in &report.batches {
        match &batch.error {
            None => println!("batch {}: {} ok", batch.index, batch.emails.len()),
            Some(e) => println!("batch {}: {} FAILED: {}", batch.index, batch.emails.len(), e),
        }
    }

    let failures = report.failures();
    if !failures.is_empty() {
        for e in &failures {
            eprintln!("{}", e);
        }
        bail!("{} of {} batch(es) failed", failures.len(), report.batches.len());
    }

    println!("Updated {} registrant(s)", report.updated());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
