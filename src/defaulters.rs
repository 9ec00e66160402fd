// 🚩 Defaulter Detector
// A registrant is a defaulter when the most recent `window` sessions are all
// plain "No": no attendance and no late-registration excuse.

use crate::matrix::AttendanceCell;

/// Trailing window used when the configuration says nothing
pub const DEFAULT_WINDOW: usize = 4;

/// True iff there are at least `window` cells and the last `window` are all "No".
///
/// A zero window never flags anyone.
pub fn is_defaulter(cells: &[AttendanceCell], window: usize) -> bool {
    if window == 0 || cells.len() < window {
        return false;
    }

    cells[cells.len() - window..]
        .iter()
        .all(|cell| *cell == AttendanceCell::No)
}
