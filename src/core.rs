//! Pure decision core for the replicated register - no I/O, no async
//!
//! This module contains the record model and the last-write-status
//! inference that the coordinator's read and write paths both hang off.
//! Keeping it free of clocks, randomness and locking means the protocol
//! tests exercise the exact same classification logic as the runtime.

use std::collections::HashMap;

/// Version carried by a record no keeper has ever written.
pub const UNWRITTEN: i64 = -1;

/// Versioned state held by one keeper for one key.
///
/// `unconfirmed_value` is whatever the most recent write attempt put
/// there; `confirmed_value` is the newest value whose write attempt was
/// observed to reach a quorum. A record is generic over the value type -
/// the engine itself only ever stores strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<V> {
    /// Identifier of the register this record belongs to.
    pub key: String,
    /// Last value known to have been durably agreed on a quorum.
    pub confirmed_value: V,
    /// Value written under the current version slot, not yet promoted.
    pub unconfirmed_value: V,
    /// Write-slot counter; [`UNWRITTEN`] until the first write lands.
    pub version: i64,
    /// Unique id of the write attempt that last touched this record.
    pub signature: String,
}

impl<V: Default> Record<V> {
    /// Synthetic record for a key the keeper has never stored.
    #[must_use]
    pub fn absent(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            confirmed_value: V::default(),
            unconfirmed_value: V::default(),
            version: UNWRITTEN,
            signature: String::new(),
        }
    }
}

/// Classification of the most recent write attempt, inferred from one
/// round of collected records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteStatus<V> {
    /// A quorum of keepers carry the same signature at the highest
    /// version: the last write provably committed. Holds a
    /// representative record from that quorum.
    Success(Record<V>),
    /// No signature at the highest version can reach a quorum even if
    /// every silent keeper held the most popular one: the last write
    /// provably failed. Holds any record at the highest version.
    Failure(Record<V>),
    /// The silent keepers could still tip the balance either way.
    Unknown,
}

/// Smallest strict majority of `member_count` peers: `⌈(n+1)/2⌉`.
///
/// Note this is not `⌈n/2⌉ + 1` - the two disagree at odd `n`.
#[must_use]
pub fn smallest_majority(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// Infer the status of the most recent write from the records returned
/// by the reachable keepers of a `cluster_size` cluster.
///
/// Only records at the highest observed version participate: anything
/// below it was provably superseded. Signatures are tallied in input
/// order and the first one to cross the majority threshold wins - at
/// most one signature can reach a quorum at a given version, so input
/// order never changes the classification, only which representative
/// record is returned.
///
/// Returns [`WriteStatus::Unknown`] for an empty round; callers bail on
/// a majority of failed responses before asking for a classification.
pub fn determine_write_status<V: Clone>(
    records: &[Record<V>],
    cluster_size: usize,
) -> WriteStatus<V> {
    let quorum = smallest_majority(cluster_size);

    let Some(highest) = records.iter().map(|r| r.version).max() else {
        return WriteStatus::Unknown;
    };

    let mut signature_counts: HashMap<&str, usize> = HashMap::new();
    let mut biggest_count = 0;
    let mut newest = None;

    for record in records {
        if record.version < highest {
            continue;
        }

        let count = signature_counts
            .entry(record.signature.as_str())
            .or_insert(0);
        *count += 1;
        if *count >= quorum {
            return WriteStatus::Success(record.clone());
        }

        biggest_count = biggest_count.max(*count);
        newest = Some(record);
    }

    let Some(newest) = newest else {
        return WriteStatus::Unknown;
    };

    // Keepers that failed to answer this round. Even if every one of
    // them held the most popular signature at the highest version, the
    // tally below says it still could not reach a quorum.
    let silent = cluster_size - records.len();
    if biggest_count + silent < quorum {
        return WriteStatus::Failure(newest.clone());
    }

    WriteStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: i64, signature: &str) -> Record<String> {
        Record {
            key: "state".to_owned(),
            confirmed_value: "old".to_owned(),
            unconfirmed_value: "new".to_owned(),
            version,
            signature: signature.to_owned(),
        }
    }

    #[test]
    fn majority_of_small_clusters() {
        let expected = [(2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)];
        for (n, majority) in expected {
            assert_eq!(smallest_majority(n), majority, "n = {n}");
        }
    }

    #[test]
    fn majority_matches_closed_form() {
        for n in 2..=100 {
            assert_eq!(smallest_majority(n), (n + 1).div_ceil(2), "n = {n}");
        }
    }

    #[test]
    fn all_synthetic_records_classify_as_success() {
        // A cluster nobody has written to yet: every record carries the
        // empty signature at version -1, which tallies to a quorum and
        // seeds the very first write's promotion branch.
        let records: Vec<Record<String>> = (0..5).map(|_| Record::absent("state")).collect();
        match determine_write_status(&records, 5) {
            WriteStatus::Success(rec) => {
                assert_eq!(rec.version, UNWRITTEN);
                assert_eq!(rec.signature, "");
                assert_eq!(rec.unconfirmed_value, "");
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn quorum_of_matching_signatures_is_success() {
        let records = vec![record(4, "a"), record(4, "a"), record(4, "a"), record(4, "b")];
        match determine_write_status(&records, 5) {
            WriteStatus::Success(rec) => assert_eq!(rec.signature, "a"),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn split_highest_version_with_one_silent_is_unresolved() {
        // Two signatures at version 3 with two votes each and a single
        // silent keeper: if the silent keeper holds "a" it completes a
        // quorum of 3, so neither verdict is safe.
        let records = vec![record(3, "a"), record(3, "a"), record(3, "b"), record(3, "b")];
        assert_eq!(determine_write_status(&records, 5), WriteStatus::Unknown);
    }

    #[test]
    fn two_silent_keepers_leave_split_unresolved() {
        // The two missing keepers could both hold "a", completing its
        // quorum, or not. Refuse to guess.
        let records = vec![record(3, "a"), record(3, "a"), record(3, "b")];
        assert_eq!(determine_write_status(&records, 5), WriteStatus::Unknown);
    }

    #[test]
    fn stale_versions_do_not_vote() {
        // Two records at version 2 are ignored outright; the lone
        // version-3 record plus two silent keepers stays unresolved.
        let records = vec![record(2, "a"), record(2, "a"), record(3, "b")];
        assert_eq!(determine_write_status(&records, 5), WriteStatus::Unknown);
    }

    #[test]
    fn stale_versions_ignored_even_for_failure() {
        // All keepers answered; the lone version-3 write provably
        // failed no matter what the version-2 quorum once agreed on.
        let records = vec![
            record(2, "a"),
            record(2, "a"),
            record(2, "a"),
            record(2, "a"),
            record(3, "b"),
        ];
        match determine_write_status(&records, 5) {
            WriteStatus::Failure(rec) => assert_eq!(rec.signature, "b"),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn full_round_with_lone_dissenter_is_success() {
        let records = vec![
            record(7, "a"),
            record(7, "a"),
            record(7, "a"),
            record(7, "a"),
            record(7, "b"),
        ];
        match determine_write_status(&records, 5) {
            WriteStatus::Success(rec) => assert_eq!(rec.signature, "a"),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn empty_round_is_unknown() {
        let records: Vec<Record<String>> = Vec::new();
        assert_eq!(determine_write_status(&records, 5), WriteStatus::Unknown);
    }

    #[test]
    fn classification_is_deterministic() {
        let records = vec![record(3, "a"), record(3, "a"), record(3, "b"), record(3, "b")];
        let first = determine_write_status(&records, 5);
        for _ in 0..10 {
            assert_eq!(determine_write_status(&records, 5), first);
        }
    }
}
