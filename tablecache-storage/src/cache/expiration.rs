//! Serial watermarks and change analysis for incremental expiration.
//!
//! Storage stamps every saved row with the next serial of its table. A
//! cache remembers how far it has looked ([`SerialWatermarks`]) and asks
//! storage for every row saved since. Deleted rows never show up in such a
//! scan, so a hole in the returned serial sequence is the only evidence of
//! a deletion; [`analyze_changes`] reports it as a gap.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tablecache_core::{ObjectId, Serial, SerialChange};

/// Sentinel for a `min_table_serial` that was not fetched from storage yet.
pub const UNSET_SERIAL: Serial = -1;

/// Per-cache serial state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialWatermarks {
    /// Highest serial of all currently indexed objects. Reset to 0 by a
    /// full invalidation, otherwise never decreases.
    pub table_serial: Serial,
    /// Serial up to which changes have been accounted for. Anything saved
    /// at or below it cannot make a cached object stale.
    pub min_table_serial: Serial,
    /// Highest table serial ever reported by storage.
    pub max_table_serial: Serial,
    /// Ceiling of a deferred expiration, 0 if none is pending.
    pub expired_table_serial: Serial,
    /// When the watermarks last advanced.
    pub observed_at: DateTime<Utc>,
}

impl Default for SerialWatermarks {
    fn default() -> Self {
        Self {
            table_serial: 0,
            min_table_serial: UNSET_SERIAL,
            max_table_serial: 0,
            expired_table_serial: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }
}

impl SerialWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_min_set(&self) -> bool {
        self.min_table_serial > UNSET_SERIAL
    }

    /// Serial the next changed-serials scan starts after.
    pub fn scan_floor(&self) -> Serial {
        if self.is_min_set() {
            self.min_table_serial
        } else {
            self.table_serial
        }
    }

    /// Record the serial of a newly indexed object.
    pub fn raise_table_serial(&mut self, serial: Serial) {
        if serial > self.table_serial {
            self.table_serial = serial;
        }
        self.raise_max(serial);
    }

    /// Record that changes up to `serial` have been processed.
    pub fn raise_min(&mut self, serial: Serial) {
        if serial > self.min_table_serial {
            self.min_table_serial = serial;
            self.observed_at = Utc::now();
        }
        self.raise_max(serial);
    }

    pub fn raise_max(&mut self, serial: Serial) {
        if serial > self.max_table_serial {
            self.max_table_serial = serial;
        }
    }

    pub fn has_pending_expiration(&self) -> bool {
        self.expired_table_serial > 0
    }

    /// Forget the population-derived serial after a full invalidation.
    /// `min_table_serial` stays: it bounds staleness of future loads too.
    pub fn reset(&mut self) {
        self.table_serial = 0;
        self.expired_table_serial = 0;
    }
}

/// Result of walking a changed-serials scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAnalysis {
    /// At least one serial is missing after `after`: a row was deleted, or
    /// the notification arrived out of order.
    Gap { after: Serial },
    /// Rows that changed with their latest serial, and the highest serial
    /// seen.
    Changed {
        ids: BTreeMap<ObjectId, Serial>,
        highest: Serial,
    },
}

/// Collect changed ids and detect gaps.
///
/// The scan starts right after `floor`, which acts as the predecessor of
/// the first change. A gap is a jump of more than one between consecutive
/// serials, a serial lower than its predecessor, or a `ceiling` above the
/// last serial seen.
pub fn analyze_changes(
    changes: &[SerialChange],
    floor: Serial,
    ceiling: Option<Serial>,
) -> ChangeAnalysis {
    let mut ids = BTreeMap::new();
    let mut last = floor;

    for change in changes {
        if change.serial < last || change.serial - last > 1 {
            return ChangeAnalysis::Gap { after: last };
        }
        ids.insert(change.id, change.serial);
        last = change.serial;
    }

    let highest = last;
    if let Some(ceiling) = ceiling {
        if ceiling > highest {
            return ChangeAnalysis::Gap { after: highest };
        }
    }

    ChangeAnalysis::Changed { ids, highest }
}

/// What an expiration pass did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationOutcome {
    /// Nothing cached was affected.
    Unchanged,
    /// `expired` stale objects were removed from the indexes. `lists_kept` tells
    /// whether the context lists survived (marked for rescan) or were
    /// dropped.
    Expired { expired: usize, lists_kept: bool },
    /// The whole cache was invalidated.
    Invalidated,
    /// No storage handle was available; the scan will run on the next
    /// lookup that has one.
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn changes(pairs: &[(ObjectId, Serial)]) -> Vec<SerialChange> {
        pairs.iter().copied().map(SerialChange::from).collect()
    }

    #[test]
    fn test_watermarks_default() {
        let marks = SerialWatermarks::new();
        assert!(!marks.is_min_set());
        assert_eq!(marks.scan_floor(), 0);
        assert!(!marks.has_pending_expiration());
    }

    #[test]
    fn test_scan_floor_prefers_min() {
        let mut marks = SerialWatermarks::new();
        marks.raise_table_serial(5);
        assert_eq!(marks.scan_floor(), 5);

        marks.raise_min(12);
        marks.raise_table_serial(20);
        assert_eq!(marks.scan_floor(), 12);
        assert_eq!(marks.max_table_serial, 20);
    }

    #[test]
    fn test_reset_keeps_min() {
        let mut marks = SerialWatermarks::new();
        marks.raise_table_serial(9);
        marks.raise_min(7);
        marks.expired_table_serial = 11;
        marks.reset();

        assert_eq!(marks.table_serial, 0);
        assert_eq!(marks.min_table_serial, 7);
        assert!(!marks.has_pending_expiration());
    }

    #[test]
    fn test_no_gap_when_ceiling_matches() {
        let analysis = analyze_changes(&changes(&[(3, 6)]), 5, Some(6));
        assert_eq!(
            analysis,
            ChangeAnalysis::Changed {
                ids: BTreeMap::from([(3, 6)]),
                highest: 6
            }
        );
    }

    #[test]
    fn test_gap_before_ceiling() {
        let analysis = analyze_changes(&changes(&[(3, 6)]), 5, Some(8));
        assert_eq!(analysis, ChangeAnalysis::Gap { after: 6 });
    }

    #[test]
    fn test_gap_between_changes() {
        let analysis = analyze_changes(&changes(&[(1, 6), (2, 7), (3, 9)]), 5, None);
        assert_eq!(analysis, ChangeAnalysis::Gap { after: 7 });
    }

    #[test]
    fn test_out_of_order_is_a_gap() {
        let analysis = analyze_changes(&changes(&[(1, 7), (2, 6)]), 6, None);
        assert_eq!(analysis, ChangeAnalysis::Gap { after: 7 });
    }

    #[test]
    fn test_hole_after_floor_is_a_gap() {
        // serial 6 was spent on a deleted row
        let analysis = analyze_changes(&changes(&[(4, 7)]), 5, None);
        assert_eq!(analysis, ChangeAnalysis::Gap { after: 5 });
    }

    #[test]
    fn test_repeated_id_keeps_latest_serial() {
        let analysis = analyze_changes(&changes(&[(4, 6), (2, 7), (4, 8)]), 5, Some(8));
        assert_eq!(
            analysis,
            ChangeAnalysis::Changed {
                ids: BTreeMap::from([(2, 7), (4, 8)]),
                highest: 8
            }
        );
    }

    #[test]
    fn test_empty_scan_uses_floor() {
        assert_eq!(
            analyze_changes(&[], 10, Some(10)),
            ChangeAnalysis::Changed {
                ids: BTreeMap::new(),
                highest: 10
            }
        );
        assert_eq!(
            analyze_changes(&[], 10, Some(11)),
            ChangeAnalysis::Gap { after: 10 }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A contiguous run of serials never reports a gap.
        #[test]
        fn prop_contiguous_serials_have_no_gap(
            start in 0i64..1_000,
            ids in proptest::collection::vec(1i64..50, 1..20),
        ) {
            let scan: Vec<_> = ids
                .iter()
                .enumerate()
                .map(|(i, &id)| SerialChange::new(id, start + 1 + i as i64))
                .collect();
            let last = scan.last().map(|c| c.serial).unwrap_or(start);

            let analysis = analyze_changes(&scan, start, Some(last));
            let is_changed = matches!(analysis, ChangeAnalysis::Changed { .. });
            prop_assert!(is_changed);
        }

        /// Removing any serial from the middle of a run is detected.
        #[test]
        fn prop_missing_serial_is_a_gap(
            len in 3usize..20,
            hole in 1usize..19,
        ) {
            prop_assume!(hole < len - 1);
            let scan: Vec<_> = (0..len)
                .filter(|&i| i != hole)
                .map(|i| SerialChange::new(i as i64 + 1, i as i64 + 1))
                .collect();

            let analysis = analyze_changes(&scan, 0, None);
            let is_gap = matches!(analysis, ChangeAnalysis::Gap { .. });
            prop_assert!(is_gap);
        }
    }
}
