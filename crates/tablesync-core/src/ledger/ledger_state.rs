//! In-memory ledger materialized from the change-set log.
//!
//! `LedgerState` keeps every version of every row, indexed by rowId and
//! ordered by sequence, so readers can evaluate any past snapshot: "the table
//! as of sequence S" is, for each row, its last version with sequence ≤ S.
//! Invariant: `sequence` equals the number of applied change sets and each
//! change set's dataETag is unique within the generation.
use std::collections::{BTreeMap, HashMap};

use snafu::prelude::*;

use crate::{
    etag::{DataETag, RowETag},
    ledger::{ChangeSet, ChangeSetSummary, CorruptStateSnafu, LedgerError},
    row::Row,
};

/// One committed version of a row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowVersion {
    /// Sequence of the change set that wrote this version.
    pub sequence: u64,
    /// The row as written.
    pub row: Row,
    /// Version it replaced.
    pub previous_row_etag: Option<RowETag>,
}

/// Materialized ledger of one table generation.
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    sequence: u64,
    change_sets: Vec<ChangeSetSummary>,
    by_data_etag: HashMap<DataETag, u64>,
    versions: BTreeMap<String, Vec<RowVersion>>,
}

impl LedgerState {
    /// Latest applied sequence; 0 for an empty generation.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current dataETag; `None` until the first change set.
    pub fn data_etag(&self) -> Option<&DataETag> {
        self.data_etag_at(self.sequence)
    }

    /// dataETag as of `sequence`; `None` for sequence 0.
    pub fn data_etag_at(&self, sequence: u64) -> Option<&DataETag> {
        self.change_set(sequence).map(|cs| &cs.data_etag)
    }

    /// Sequence that produced `data_etag`, if it belongs to this generation.
    pub fn sequence_of(&self, data_etag: &DataETag) -> Option<u64> {
        self.by_data_etag.get(data_etag).copied()
    }

    /// Summary of the change set with `sequence`.
    pub fn change_set(&self, sequence: u64) -> Option<&ChangeSetSummary> {
        let idx = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.change_sets.get(idx)
    }

    /// Summaries of the change sets with sequence in `(after, upto]`.
    pub fn change_sets_between(&self, after: u64, upto: u64) -> &[ChangeSetSummary] {
        let lo = usize::try_from(after).unwrap_or(usize::MAX).min(self.change_sets.len());
        let hi = usize::try_from(upto).unwrap_or(usize::MAX).min(self.change_sets.len());
        if lo >= hi { &[] } else { &self.change_sets[lo..hi] }
    }

    /// Current version of `row_id`, tombstones included.
    pub fn row(&self, row_id: &str) -> Option<&Row> {
        self.versions
            .get(row_id)
            .and_then(|v| v.last())
            .map(|v| &v.row)
    }

    /// Version of `row_id` as of `sequence`.
    pub fn row_at(&self, row_id: &str, sequence: u64) -> Option<&RowVersion> {
        let versions = self.versions.get(row_id)?;
        let idx = versions.partition_point(|v| v.sequence <= sequence);
        idx.checked_sub(1).map(|i| &versions[i])
    }

    /// Version of `row_id` written by the change set with `sequence`.
    pub fn version_written_at(&self, row_id: &str, sequence: u64) -> Option<&RowVersion> {
        let versions = self.versions.get(row_id)?;
        versions
            .binary_search_by_key(&sequence, |v| v.sequence)
            .ok()
            .map(|i| &versions[i])
    }

    /// Every row as of `sequence` (tombstones included), ordered by rowId.
    pub fn rows_at(&self, sequence: u64) -> impl Iterator<Item = &RowVersion> {
        self.versions.values().filter_map(move |versions| {
            let idx = versions.partition_point(|v| v.sequence <= sequence);
            idx.checked_sub(1).map(|i| &versions[i])
        })
    }

    /// Number of rows ever written, tombstones included.
    pub fn row_count(&self) -> usize {
        self.versions.len()
    }

    /// Apply the next change set.
    pub fn apply(&mut self, change_set: &ChangeSet) -> Result<(), LedgerError> {
        ensure!(
            change_set.sequence == self.sequence + 1 && change_set.base_sequence == self.sequence,
            CorruptStateSnafu {
                msg: format!(
                    "change set {} (base {}) does not follow sequence {}",
                    change_set.sequence, change_set.base_sequence, self.sequence
                ),
            }
        );
        ensure!(
            !self.by_data_etag.contains_key(&change_set.data_etag),
            CorruptStateSnafu {
                msg: format!(
                    "dataETag {} of change set {} was already issued",
                    change_set.data_etag, change_set.sequence
                ),
            }
        );

        for entry in &change_set.entries {
            self.versions
                .entry(entry.row.row_id.clone())
                .or_default()
                .push(RowVersion {
                    sequence: change_set.sequence,
                    row: entry.row.clone(),
                    previous_row_etag: entry.previous_row_etag.clone(),
                });
        }
        self.by_data_etag
            .insert(change_set.data_etag.clone(), change_set.sequence);
        self.change_sets.push(change_set.summary());
        self.sequence = change_set.sequence;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::RowRecord,
        row::{RowDraft, RowUpdate},
        schema::{ColumnForest, ColumnSpec},
    };
    use chrono::Utc;

    fn change_set(sequence: u64, rows: &[(&str, &str)]) -> ChangeSet {
        let forest = ColumnForest::build(&[ColumnSpec::new("v", "string")]).unwrap();
        let data_etag = DataETag::generate();
        let entries = rows
            .iter()
            .map(|(id, v)| RowRecord {
                row: RowDraft::from_update(id, &RowUpdate::new(*id).value("v", *v), &forest, None)
                    .unwrap()
                    .stamp(RowETag::generate(), data_etag.clone()),
                previous_row_etag: None,
                user: None,
            })
            .collect();
        ChangeSet {
            sequence,
            base_sequence: sequence - 1,
            data_etag,
            timestamp: Utc::now(),
            entries,
        }
    }

    #[test]
    fn snapshots_see_versions_up_to_their_sequence() {
        let mut state = LedgerState::default();
        state.apply(&change_set(1, &[("a", "1"), ("b", "1")])).unwrap();
        state.apply(&change_set(2, &[("a", "2")])).unwrap();
        state.apply(&change_set(3, &[("c", "1")])).unwrap();

        assert_eq!(state.sequence(), 3);
        assert_eq!(state.row("a").unwrap().value("v"), Some("2"));
        assert_eq!(state.row_at("a", 1).unwrap().row.value("v"), Some("1"));
        assert!(state.row_at("c", 2).is_none());

        let at_two: Vec<&str> = state.rows_at(2).map(|v| v.row.row_id.as_str()).collect();
        assert_eq!(at_two, vec!["a", "b"]);
        assert_eq!(state.rows_at(3).count(), 3);
        assert_eq!(state.row_count(), 3);
    }

    #[test]
    fn data_etags_map_to_sequences() {
        let mut state = LedgerState::default();
        assert!(state.data_etag().is_none());
        let first = change_set(1, &[("a", "1")]);
        let second = change_set(2, &[("a", "2")]);
        state.apply(&first).unwrap();
        state.apply(&second).unwrap();

        assert_eq!(state.data_etag(), Some(&second.data_etag));
        assert_eq!(state.data_etag_at(1), Some(&first.data_etag));
        assert_eq!(state.data_etag_at(0), None);
        assert_eq!(state.sequence_of(&first.data_etag), Some(1));
        assert_eq!(state.sequence_of(&DataETag::new("uuid:unknown")), None);

        let tail: Vec<u64> = state.change_sets_between(1, 2).iter().map(|c| c.sequence).collect();
        assert_eq!(tail, vec![2]);
        assert!(state.change_sets_between(2, 2).is_empty());
        assert_eq!(state.change_sets_between(0, 99).len(), 2);
    }

    #[test]
    fn out_of_order_or_repeated_change_sets_are_corrupt() {
        let mut state = LedgerState::default();
        let err = state.apply(&change_set(2, &[("a", "1")])).unwrap_err();
        assert!(matches!(err, LedgerError::CorruptState { .. }));

        let first = change_set(1, &[("a", "1")]);
        state.apply(&first).unwrap();
        let mut replay = first.clone();
        replay.sequence = 2;
        replay.base_sequence = 1;
        let err = state.apply(&replay).unwrap_err();
        assert!(matches!(err, LedgerError::CorruptState { .. }));
        assert_eq!(state.sequence(), 1);
    }
}
