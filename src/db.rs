// 🗄️ Record Store - SQLite persistence for series, sessions, registrants, attendance
// Merge rules live in the SQL itself so every upsert applies them atomically:
// - a stored "Yes" is never downgraded to "No"
// - a registration time only ever moves earlier

use crate::error::{ParseError, Result};
use crate::parser::{parse_internal_time, ReportTime};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use serde::{Deserialize, Serialize};

pub type SeriesId = i64;
pub type SessionId = i64;

// ============================================================================
// ATTENDANCE MARK
// ============================================================================

/// Attendance as declared by an export file. "NA" is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    Yes,
    No,
}

impl Mark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::Yes => "Yes",
            Mark::No => "No",
        }
    }

    /// Case-insensitive parse of a report cell
    pub fn parse(value: &str) -> std::result::Result<Mark, ParseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Mark::Yes),
            "no" => Ok(Mark::No),
            _ => Err(ParseError::UnknownAttendance(value.trim().to_string())),
        }
    }

    /// Whether `declared` should replace this stored mark (No → Yes only)
    pub fn is_upgraded_by(&self, declared: Mark) -> bool {
        *self == Mark::No && declared == Mark::Yes
    }
}

impl ToSql for Mark {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Mark {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Mark::parse(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Registrant change queued by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrantUpsert {
    pub series_id: SeriesId,
    pub email: String,
    pub registered_at: Option<ReportTime>,
}

/// Attendance change queued by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceUpsert {
    pub session_id: SessionId,
    pub series_id: SeriesId,
    pub email: String,
    pub attended: Mark,
}

/// One session of a series, as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start: NaiveDateTime,
    pub original_start: String,
}

/// One (registrant, session) pair of a series with whatever mark is on record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRow {
    pub email: String,
    pub session_start: NaiveDateTime,
    pub session_original_start: String,
    pub mark: Option<Mark>,
    pub registered_at: Option<NaiveDateTime>,
}

/// Row counts per table, used for reporting and idempotence checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub series: i64,
    pub sessions: i64,
    pub registrants: i64,
    pub attendance: i64,
}

/// Event for audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS series (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT UNIQUE NOT NULL,
            topic TEXT UNIQUE NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id INTEGER NOT NULL REFERENCES series(id),
            internal_time TEXT NOT NULL,
            original_time TEXT NOT NULL,
            UNIQUE(series_id, internal_time)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrant (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id INTEGER NOT NULL REFERENCES series(id),
            email TEXT NOT NULL,
            internal_registration_time TEXT,
            original_registration_time TEXT,
            UNIQUE(email, series_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES session(id),
            registrant_id INTEGER NOT NULL REFERENCES registrant(id),
            attended TEXT NOT NULL CHECK (attended IN ('Yes', 'No')),
            UNIQUE(session_id, registrant_id)
        )",
        [],
    )?;

    // Events Table (audit trail)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_series_time ON session(series_id, internal_time)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrant_series_email ON registrant(series_id, email)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SERIES & SESSIONS (created on first sighting, immutable after)
// ============================================================================

pub fn find_series(conn: &Connection, external_id: &str) -> Result<Option<SeriesId>> {
    let id = conn
        .query_row(
            "SELECT id FROM series WHERE external_id = ?1",
            params![external_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Look up a series by external id, creating it with `topic` if unseen.
/// The topic of an existing series is never rewritten.
pub fn find_or_create_series(conn: &Connection, external_id: &str, topic: &str) -> Result<SeriesId> {
    if let Some(id) = find_series(conn, external_id)? {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO series (external_id, topic) VALUES (?1, ?2)",
        params![external_id, topic],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_or_create_session(
    conn: &Connection,
    series_id: SeriesId,
    start: &ReportTime,
) -> Result<SessionId> {
    let internal = start.internal();
    let existing = conn
        .query_row(
            "SELECT id FROM session WHERE series_id = ?1 AND internal_time = ?2",
            params![series_id, internal],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO session (series_id, internal_time, original_time) VALUES (?1, ?2, ?3)",
        params![series_id, internal, start.original],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Sessions of a series, oldest first
pub fn list_sessions_ordered(conn: &Connection, external_id: &str) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.internal_time, s.original_time
         FROM series w
         INNER JOIN session s ON s.series_id = w.id
         WHERE w.external_id = ?1
         ORDER BY s.internal_time ASC",
    )?;

    let sessions = stmt
        .query_map(params![external_id], |row| {
            let internal: String = row.get(1)?;
            Ok(SessionRecord {
                id: row.get(0)?,
                start: time_column(1, &internal)?,
                original_start: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(sessions)
}

// ============================================================================
// POINT LOOKUPS (used while reconciling)
// ============================================================================

pub fn find_registrant(conn: &Connection, series_id: SeriesId, email: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM registrant WHERE series_id = ?1 AND email = ?2",
            params![series_id, email],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Registration time currently on record, if any
#[cfg(test)]
pub(crate) fn registration_time(
    conn: &Connection,
    series_id: SeriesId,
    email: &str,
) -> Result<Option<String>> {
    let time = conn
        .query_row(
            "SELECT internal_registration_time FROM registrant WHERE series_id = ?1 AND email = ?2",
            params![series_id, email],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(time.flatten())
}

pub fn find_attendance(
    conn: &Connection,
    session_id: SessionId,
    series_id: SeriesId,
    email: &str,
) -> Result<Option<Mark>> {
    let mark = conn
        .query_row(
            "SELECT a.attended
             FROM attendance a
             INNER JOIN registrant r ON r.id = a.registrant_id
             WHERE a.session_id = ?1 AND r.series_id = ?2 AND r.email = ?3",
            params![session_id, series_id, email],
            |row| row.get(0),
        )
        .optional()?;
    Ok(mark)
}

// ============================================================================
// BULK UPSERTS
// ============================================================================

/// Insert new registrants or refine the registration time of known ones.
/// Returns the number of rows inserted or changed.
pub fn upsert_registrants(conn: &Connection, registrants: &[RegistrantUpsert]) -> Result<usize> {
    if registrants.is_empty() {
        return Ok(0);
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO registrant (
            series_id, email, internal_registration_time, original_registration_time
        ) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(email, series_id) DO UPDATE SET
            internal_registration_time = excluded.internal_registration_time,
            original_registration_time = excluded.original_registration_time
        WHERE excluded.internal_registration_time IS NOT NULL
          AND (registrant.internal_registration_time IS NULL
               OR registrant.internal_registration_time > excluded.internal_registration_time)",
    )?;

    let mut changed = 0;
    for r in registrants {
        changed += stmt.execute(params![
            r.series_id,
            r.email,
            r.registered_at.as_ref().map(ReportTime::internal),
            r.registered_at.as_ref().map(|t| t.original.as_str()),
        ])?;
    }

    Ok(changed)
}

/// Insert attendance marks or upgrade "No" to "Yes".
/// The registrant must already exist. Returns the number of rows inserted or changed.
pub fn upsert_attendance(conn: &Connection, marks: &[AttendanceUpsert]) -> Result<usize> {
    if marks.is_empty() {
        return Ok(0);
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO attendance (session_id, registrant_id, attended)
        SELECT ?1, r.id, ?2 FROM registrant r WHERE r.email = ?3 AND r.series_id = ?4
        ON CONFLICT(session_id, registrant_id) DO UPDATE SET attended = excluded.attended
        WHERE excluded.attended = 'Yes' AND attendance.attended <> 'Yes'",
    )?;

    let mut changed = 0;
    for m in marks {
        changed += stmt.execute(params![m.session_id, m.attended, m.email, m.series_id])?;
    }

    Ok(changed)
}

// ============================================================================
// ORDERED ATTENDANCE QUERY
// ============================================================================

/// Every (registrant, session) pair of one series, ordered by email then
/// session time. Bind the external series id as ?1.
pub const ATTENDANCE_ROWS_SQL: &str = "
    SELECT
        r.email,
        s.internal_time,
        s.original_time,
        a.attended,
        r.internal_registration_time
    FROM series w
    INNER JOIN session s ON s.series_id = w.id
    INNER JOIN registrant r ON r.series_id = w.id
    LEFT OUTER JOIN attendance a ON a.registrant_id = r.id AND a.session_id = s.id
    WHERE w.external_id = ?1
    ORDER BY r.email ASC, s.internal_time ASC";

pub fn prepare_attendance_rows(conn: &Connection) -> Result<Statement<'_>> {
    Ok(conn.prepare(ATTENDANCE_ROWS_SQL)?)
}

/// Map one row of [`ATTENDANCE_ROWS_SQL`]
pub fn attendance_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRow> {
    let session_internal: String = row.get(1)?;
    let registered: Option<String> = row.get(4)?;

    Ok(AttendanceRow {
        email: row.get(0)?,
        session_start: time_column(1, &session_internal)?,
        session_original_start: row.get(2)?,
        mark: row.get(3)?,
        registered_at: registered.map(|t| time_column(4, &t)).transpose()?,
    })
}

/// Collect every attendance row of a series into memory.
/// Large series should stream through the matrix generator instead.
pub fn list_attendance_rows(conn: &Connection, external_id: &str) -> Result<Vec<AttendanceRow>> {
    let mut stmt = prepare_attendance_rows(conn)?;
    let rows = stmt
        .query_map(params![external_id], attendance_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn time_column(index: usize, value: &str) -> rusqlite::Result<NaiveDateTime> {
    parse_internal_time(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

pub fn store_counts(conn: &Connection) -> Result<StoreCounts> {
    let count = |table: &str| -> rusqlite::Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
    };

    Ok(StoreCounts {
        series: count("series")?,
        sessions: count("session")?,
        registrants: count("registrant")?,
        attendance: count("attendance")?,
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}
