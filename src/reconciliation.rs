// ⚖️ Reconciliation Engine - Merge one report into the store
//
// Every attendee line of a file is turned into queued changes held in a
// PendingBatch. Nothing touches the registrant/attendance tables until the
// whole file has parsed; the batch is then applied inside the importer's
// SQLite transaction, so a file lands completely or not at all.
//
// Merge policy:
//   unknown registrant           → insert
//   known registrant + time      → update (store keeps the earliest time)
//   no mark for (session, email) → insert declared mark
//   "No" on record, "Yes" seen   → upgrade to "Yes"
//   anything else                → nothing (re-imports never regress state)

use crate::db::{
    self, AttendanceUpsert, Mark, RegistrantUpsert, SeriesId, SessionId,
};
use crate::error::Result;
use crate::parser::AttendanceLine;
use rusqlite::{Connection, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::debug;

// ============================================================================
// SESSION CONTEXT
// ============================================================================

/// The session declared by the most recent topic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub series_id: SeriesId,
    pub session_id: SessionId,
}

/// What the reconciler decided for one line's attendance mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDecision {
    Insert,
    Upgrade,
    Unchanged,
}

// ============================================================================
// PENDING BATCH (transaction buffer)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatch {
    pub registrant_inserts: Vec<RegistrantUpsert>,
    pub registrant_updates: Vec<RegistrantUpsert>,
    pub attendance_inserts: Vec<AttendanceUpsert>,
    pub attendance_updates: Vec<AttendanceUpsert>,
}

/// Rows actually changed when a batch was applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub registrants_inserted: usize,
    pub registrants_updated: usize,
    pub attendance_inserted: usize,
    pub attendance_updated: usize,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.registrant_inserts.is_empty()
            && self.registrant_updates.is_empty()
            && self.attendance_inserts.is_empty()
            && self.attendance_updates.is_empty()
    }

    /// Apply the batch inside `tx`, registrants first so every mark has
    /// its registrant. The caller commits or drops the transaction.
    pub fn apply(self, tx: &Transaction<'_>) -> Result<CommitCounts> {
        let conn: &Connection = tx;

        debug!("Registrants to insert: {:?}", self.registrant_inserts);
        let registrants_inserted = db::upsert_registrants(conn, &self.registrant_inserts)?;

        debug!("Registrants to update: {:?}", self.registrant_updates);
        let registrants_updated = db::upsert_registrants(conn, &self.registrant_updates)?;

        debug!("Attendance to insert: {:?}", self.attendance_inserts);
        let attendance_inserted = db::upsert_attendance(conn, &self.attendance_inserts)?;

        debug!("Attendance to update: {:?}", self.attendance_updates);
        let attendance_updated = db::upsert_attendance(conn, &self.attendance_updates)?;

        Ok(CommitCounts {
            registrants_inserted,
            registrants_updated,
            attendance_inserted,
            attendance_updated,
        })
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Merge state for one import pass over one file
#[derive(Debug, Default)]
pub struct Reconciler {
    batch: PendingBatch,
    queued_registrants: HashSet<(SeriesId, String)>,
    pending_marks: HashMap<(SessionId, String), Mark>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what one attendee line changes and queue it.
    ///
    /// `conn` is only read; it must see everything committed before this
    /// file (and the series/session rows this file created).
    pub fn observe(
        &mut self,
        conn: &Connection,
        session: SessionContext,
        line: &AttendanceLine,
    ) -> Result<MarkDecision> {
        self.queue_registrant(conn, session.series_id, line)?;

        let key = (session.session_id, line.email.clone());
        let current = match self.pending_marks.get(&key) {
            Some(mark) => Some(*mark),
            None => db::find_attendance(conn, session.session_id, session.series_id, &line.email)?,
        };

        let upsert = AttendanceUpsert {
            session_id: session.session_id,
            series_id: session.series_id,
            email: line.email.clone(),
            attended: line.attended,
        };

        let decision = match current {
            None => {
                self.batch.attendance_inserts.push(upsert);
                MarkDecision::Insert
            }
            Some(stored) if stored.is_upgraded_by(line.attended) => {
                self.batch.attendance_updates.push(upsert);
                MarkDecision::Upgrade
            }
            Some(_) => MarkDecision::Unchanged,
        };

        if decision != MarkDecision::Unchanged {
            self.pending_marks.insert(key, line.attended);
        }

        Ok(decision)
    }

    fn queue_registrant(
        &mut self,
        conn: &Connection,
        series_id: SeriesId,
        line: &AttendanceLine,
    ) -> Result<()> {
        let key = (series_id, line.email.clone());
        let upsert = RegistrantUpsert {
            series_id,
            email: line.email.clone(),
            registered_at: line.registered_at.clone(),
        };

        if !self.queued_registrants.contains(&key)
            && db::find_registrant(conn, series_id, &line.email)?.is_none()
        {
            self.queued_registrants.insert(key);
            self.batch.registrant_inserts.push(upsert);
        } else if line.registered_at.is_some() {
            self.batch.registrant_updates.push(upsert);
        }

        Ok(())
    }

    /// Changes queued so far, without consuming the reconciler
    #[cfg(test)]
    pub(crate) fn pending(&self) -> &PendingBatch {
        &self.batch
    }

    pub fn finish(self) -> PendingBatch {
        self.batch
    }
}

// ============================================================================
// TESTS
// ============================================================================
