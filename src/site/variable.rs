// Versioned variable storage.
//
// Each variable keeps a chronological history of committed values plus at
// most one uncommitted tentative value staged by the transaction holding the
// write lock. Read/write transactions read the newest committed entry (or
// their own tentative value); read-only transactions read the entry current
// at their start tick.

use serde::{Deserialize, Serialize};

use crate::common::{Tick, TransactionId, VariableId};

use super::error::DataError;

/// A committed (value, commit_time) pair in a variable's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedValue {
    /// The committed value.
    pub value: i64,
    /// Tick at which the value was committed.
    pub commit_time: Tick,
}

/// An uncommitted value staged under a write lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TentativeValue {
    /// The staged value.
    pub value: i64,
    /// The transaction that staged it.
    pub tid: TransactionId,
}

/// A single variable at a single site.
///
/// # Invariants
///
/// - `history` is nonempty and strictly increasing in `commit_time`; the
///   first entry is the initial value at time 0.
/// - `tentative`, if present, belongs to an in-flight transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    vid: VariableId,
    replicated: bool,
    readable: bool,
    history: Vec<CommittedValue>,
    tentative: Option<TentativeValue>,
}

impl Variable {
    /// Creates a variable with its initial committed value at time 0.
    pub fn new(vid: VariableId, initial: i64, replicated: bool) -> Self {
        Self {
            vid,
            replicated,
            readable: true,
            history: vec![CommittedValue {
                value: initial,
                commit_time: 0,
            }],
            tentative: None,
        }
    }

    pub fn vid(&self) -> &str {
        &self.vid
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// Whether reads and snapshots may consult this variable. False on a
    /// replicated variable between site recovery and the next commit here.
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Marks the variable unreadable until the next commit (site recovery).
    pub fn mark_unreadable(&mut self) {
        self.readable = false;
    }

    /// The most recent committed entry.
    pub fn latest(&self) -> Option<&CommittedValue> {
        self.history.last()
    }

    /// The committed entry with the greatest `commit_time` ≤ `ts`.
    pub fn snapshot(&self, ts: Tick) -> Option<&CommittedValue> {
        self.history.iter().rev().find(|c| c.commit_time <= ts)
    }

    /// The uncommitted staged value, if any.
    pub fn tentative(&self) -> Option<&TentativeValue> {
        self.tentative.as_ref()
    }

    /// Full committed history, oldest first.
    pub fn history(&self) -> &[CommittedValue] {
        &self.history
    }

    /// Stages `value` as the tentative write of `tid`, replacing an earlier
    /// stage by the same transaction.
    pub fn stage(&mut self, tid: &str, value: i64) -> Result<(), DataError> {
        if let Some(existing) = &self.tentative {
            if existing.tid != tid {
                return Err(DataError::ForeignTentative {
                    vid: self.vid.clone(),
                    owner: existing.tid.clone(),
                    writer: tid.to_string(),
                });
            }
        }
        self.tentative = Some(TentativeValue {
            value,
            tid: tid.to_string(),
        });
        Ok(())
    }

    /// Publishes the tentative value into history at commit time `ts` and
    /// restores readability.
    pub fn commit(&mut self, ts: Tick) -> Result<(), DataError> {
        let staged = self.tentative.take().ok_or(DataError::MissingTentative {
            vid: self.vid.clone(),
        })?;
        debug_assert!(self.history.last().map_or(true, |c| c.commit_time < ts));
        self.history.push(CommittedValue {
            value: staged.value,
            commit_time: ts,
        });
        self.readable = true;
        Ok(())
    }

    /// Drops the tentative value (writer aborted or site failed).
    pub fn discard(&mut self) {
        self.tentative = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var() -> Variable {
        Variable::new("x2".to_string(), 20, true)
    }

    #[test]
    fn test_initial_history() {
        let v = var();
        assert_eq!(v.latest(), Some(&CommittedValue { value: 20, commit_time: 0 }));
        assert!(v.is_readable());
        assert!(v.tentative().is_none());
    }

    #[test]
    fn test_stage_commit() {
        let mut v = var();
        v.stage("T1", 25).unwrap();
        assert_eq!(v.tentative().unwrap().value, 25);

        v.commit(7).unwrap();
        assert!(v.tentative().is_none());
        assert_eq!(v.latest(), Some(&CommittedValue { value: 25, commit_time: 7 }));
        assert_eq!(v.history().len(), 2);
    }

    #[test]
    fn test_restage_by_same_transaction() {
        let mut v = var();
        v.stage("T1", 25).unwrap();
        v.stage("T1", 26).unwrap();
        assert_eq!(v.tentative().unwrap().value, 26);
    }

    #[test]
    fn test_stage_over_foreign_tentative_fails() {
        let mut v = var();
        v.stage("T1", 25).unwrap();
        assert!(matches!(
            v.stage("T2", 30),
            Err(DataError::ForeignTentative { .. })
        ));
    }

    #[test]
    fn test_commit_without_tentative_fails() {
        let mut v = var();
        assert!(matches!(v.commit(3), Err(DataError::MissingTentative { .. })));
    }

    #[test]
    fn test_discard() {
        let mut v = var();
        v.stage("T1", 25).unwrap();
        v.discard();
        assert!(v.tentative().is_none());
        assert_eq!(v.latest().unwrap().value, 20);
    }

    #[test]
    fn test_snapshot_picks_greatest_at_or_before() {
        let mut v = var();
        v.stage("T1", 25).unwrap();
        v.commit(5).unwrap();
        v.stage("T2", 30).unwrap();
        v.commit(9).unwrap();

        assert_eq!(v.snapshot(0).unwrap().value, 20);
        assert_eq!(v.snapshot(4).unwrap().value, 20);
        assert_eq!(v.snapshot(5).unwrap().value, 25);
        assert_eq!(v.snapshot(8).unwrap().value, 25);
        assert_eq!(v.snapshot(100).unwrap().value, 30);
    }

    #[test]
    fn test_recovery_readability() {
        let mut v = var();
        v.mark_unreadable();
        assert!(!v.is_readable());

        v.stage("T1", 25).unwrap();
        v.commit(4).unwrap();
        assert!(v.is_readable());
    }
}
