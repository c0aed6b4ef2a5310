// Per-site data management.
//
// A `DataManager` owns one site's variables and their lock managers and
// services the cluster's per-site calls: reads, snapshot reads, write-lock
// acquisition, staging, commit, abort, failure, and recovery. Replication
// follows the available-copies discipline: the transaction manager reads
// from the first up copy and writes to every up copy.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::common::{
    self, SiteId, Tick, TransactionId, VariableId,
};
use crate::SimConfig;

use super::error::DataError;
use super::lock_manager::LockManager;
use super::variable::Variable;

/// One simulated data site.
#[derive(Debug)]
pub struct DataManager {
    sid: SiteId,
    up: bool,
    variable_count: usize,
    variables: BTreeMap<VariableId, Variable>,
    lock_table: BTreeMap<VariableId, LockManager>,
    fail_times: Vec<Tick>,
    recover_times: Vec<Tick>,
}

impl DataManager {
    /// Creates the site and populates it with the variables it hosts:
    /// every replicated variable, plus each unreplicated variable whose home
    /// site this is.
    pub fn new(sid: SiteId, config: &SimConfig) -> Self {
        let mut variables = BTreeMap::new();
        let mut lock_table = BTreeMap::new();
        for n in 1..=config.variable_count {
            let replicated = common::is_replicated(n);
            if !replicated && common::home_site(n, config.site_count) != sid {
                continue;
            }
            let vid = common::variable_id(n);
            variables.insert(
                vid.clone(),
                Variable::new(vid.clone(), common::initial_value(n), replicated),
            );
            lock_table.insert(vid.clone(), LockManager::new(vid));
        }
        info!(site = sid, variables = variables.len(), "site initialised");
        Self {
            sid,
            up: true,
            variable_count: config.variable_count,
            variables,
            lock_table,
            fail_times: Vec::new(),
            recover_times: Vec::new(),
        }
    }

    pub fn sid(&self) -> SiteId {
        self.sid
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn has_variable(&self, vid: &str) -> bool {
        self.variables.contains_key(vid)
    }

    pub fn variable(&self, vid: &str) -> Option<&Variable> {
        self.variables.get(vid)
    }

    pub fn lock_manager(&self, vid: &str) -> Option<&LockManager> {
        self.lock_table.get(vid)
    }

    /// Ticks at which this site failed, oldest first.
    pub fn fail_times(&self) -> &[Tick] {
        &self.fail_times
    }

    /// Ticks at which this site recovered, oldest first.
    pub fn recover_times(&self) -> &[Tick] {
        &self.recover_times
    }

    /// Serves a read-only transaction from committed history as of `ts`.
    ///
    /// Rejects the read if the variable is unreadable here, if no entry is
    /// committed at or before `ts`, or (for replicated variables) if this
    /// site failed between that entry's commit and `ts`; the caller then
    /// tries the next copy.
    pub fn snapshot_read(&self, vid: &str, ts: Tick) -> Option<i64> {
        let variable = self.variables.get(vid)?;
        if !variable.is_readable() {
            return None;
        }
        let committed = variable.snapshot(ts)?;
        if variable.is_replicated()
            && self
                .fail_times
                .iter()
                .any(|&f| committed.commit_time < f && f <= ts)
        {
            return None;
        }
        Some(committed.value)
    }

    /// Serves a read for a read/write transaction under a shared lock.
    ///
    /// Returns the latest committed value, or the transaction's own staged
    /// value when it already holds the write lock. `None` means the read is
    /// blocked (the lock request is queued) or the variable is unreadable.
    pub fn read(&mut self, tid: &str, vid: &str) -> Option<i64> {
        let variable = self.variables.get(vid)?;
        if !variable.is_readable() {
            return None;
        }
        let locks = self.lock_table.get_mut(vid)?;
        if !locks.try_read(tid).is_granted() {
            return None;
        }
        if locks.holds_write(tid) {
            if let Some(staged) = variable.tentative() {
                return Some(staged.value);
            }
        }
        variable.latest().map(|c| c.value)
    }

    /// Acquires the write lock for `tid` on `vid`, or queues the request.
    ///
    /// On success the lock is installed immediately (promoting a sole-reader
    /// grant), so a multi-copy write that is still pending at another site
    /// keeps its locks here.
    pub fn get_write_lock(&mut self, tid: &str, vid: &str) -> crate::Result<bool> {
        let Some(locks) = self.lock_table.get_mut(vid) else {
            return Ok(false);
        };
        if !locks.try_write(tid).is_granted() {
            return Ok(false);
        }
        locks.write_apply(tid)?;
        Ok(true)
    }

    /// Stages `value` under the write lock previously acquired by
    /// `get_write_lock`.
    pub fn write(&mut self, tid: &str, vid: &str, value: i64) -> crate::Result<()> {
        let (Some(locks), Some(variable)) =
            (self.lock_table.get_mut(vid), self.variables.get_mut(vid))
        else {
            return Err(DataError::NotHosted {
                sid: self.sid,
                vid: vid.to_string(),
            }
            .into());
        };
        locks.write_apply(tid)?;
        variable.stage(tid, value)?;
        debug!(site = self.sid, tid, vid, value, "value staged");
        Ok(())
    }

    /// Publishes every tentative value staged by `tid` at commit time `ts`,
    /// then releases its locks and advances the queues.
    pub fn commit(&mut self, tid: &str, ts: Tick) -> crate::Result<()> {
        for variable in self.variables.values_mut() {
            if variable.tentative().map_or(false, |t| t.tid == tid) {
                variable.commit(ts)?;
            }
        }
        self.release_and_advance(tid);
        Ok(())
    }

    /// Discards every tentative value staged by `tid`, releases its locks
    /// and queued requests, and advances the queues.
    pub fn abort(&mut self, tid: &str) {
        for variable in self.variables.values_mut() {
            if variable.tentative().map_or(false, |t| t.tid == tid) {
                variable.discard();
            }
        }
        self.release_and_advance(tid);
    }

    fn release_and_advance(&mut self, tid: &str) {
        for locks in self.lock_table.values_mut() {
            locks.release(tid);
        }
        for locks in self.lock_table.values_mut() {
            locks.advance();
        }
    }

    /// Takes the site down: lock state and tentative values are lost,
    /// committed history survives.
    pub fn fail(&mut self, ts: Tick) {
        self.up = false;
        self.fail_times.push(ts);
        for locks in self.lock_table.values_mut() {
            locks.clear();
        }
        for variable in self.variables.values_mut() {
            variable.discard();
        }
        info!(site = self.sid, tick = ts, "site failed");
    }

    /// Brings the site back up. Replicated variables stay unreadable until
    /// the next commit writes here; unreplicated variables have no fresher
    /// copy elsewhere and remain readable.
    pub fn recover(&mut self, ts: Tick) {
        self.up = true;
        self.recover_times.push(ts);
        for variable in self.variables.values_mut() {
            if variable.is_replicated() {
                variable.mark_unreadable();
            }
        }
        info!(site = self.sid, tick = ts, "site recovered");
    }

    /// This site's contribution to the cluster waits-for graph.
    pub fn local_waits_for(&self) -> Vec<(TransactionId, TransactionId)> {
        self.lock_table
            .values()
            .flat_map(|locks| locks.waits_for_edges())
            .collect()
    }

    /// One dump line: site id, status, and every hosted variable's latest
    /// committed value in numeric order.
    pub fn dump_line(&self) -> String {
        let mut parts = Vec::new();
        for n in 1..=self.variable_count {
            if let Some(variable) = self.variables.get(&common::variable_id(n)) {
                if let Some(latest) = variable.latest() {
                    parts.push(format!("{}: {}", variable.vid(), latest.value));
                }
            }
        }
        let status = if self.up { "" } else { " (down)" };
        format!("site {}{} - {}", self.sid, status, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(sid: SiteId) -> DataManager {
        DataManager::new(sid, &SimConfig::default())
    }

    #[test]
    fn test_hosted_variables() {
        // even sites host the ten replicated variables plus two odd ones
        let s2 = site(2);
        assert_eq!(s2.variable("x1").map(Variable::is_replicated), Some(false));
        assert!(s2.has_variable("x11"));
        assert!(s2.has_variable("x2"));
        assert!(!s2.has_variable("x3"));

        // odd sites host only the replicated variables
        let s1 = site(1);
        assert!(!s1.has_variable("x1"));
        assert!(s1.has_variable("x20"));
    }

    #[test]
    fn test_read_latest_committed() {
        let mut s = site(1);
        assert_eq!(s.read("T1", "x2"), Some(20));
        // the read grant is now held
        assert!(s.lock_manager("x2").unwrap().holders().contains(&"T1".to_string()));
    }

    #[test]
    fn test_read_own_staged_value() {
        let mut s = site(1);
        assert!(s.get_write_lock("T1", "x2").unwrap());
        s.write("T1", "x2", 25).unwrap();
        assert_eq!(s.read("T1", "x2"), Some(25));
        // everyone else blocks
        assert_eq!(s.read("T2", "x2"), None);
    }

    #[test]
    fn test_read_with_write_lock_but_nothing_staged() {
        let mut s = site(1);
        assert!(s.get_write_lock("T1", "x2").unwrap());
        assert_eq!(s.read("T1", "x2"), Some(20));
    }

    #[test]
    fn test_write_lock_conflict_queues() {
        let mut s = site(1);
        assert!(s.get_write_lock("T1", "x2").unwrap());
        assert!(!s.get_write_lock("T2", "x2").unwrap());
        assert_eq!(s.lock_manager("x2").unwrap().queue().len(), 1);
    }

    #[test]
    fn test_commit_publishes_and_releases() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        s.commit("T1", 4).unwrap();

        let variable = s.variable("x2").unwrap();
        assert_eq!(variable.latest().unwrap().value, 25);
        assert_eq!(variable.latest().unwrap().commit_time, 4);
        assert!(s.lock_manager("x2").unwrap().is_free());
    }

    #[test]
    fn test_commit_grants_next_in_queue() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        assert_eq!(s.read("T2", "x2"), None);

        s.commit("T1", 4).unwrap();
        // T2's queued read was granted by advance()
        assert!(s.lock_manager("x2").unwrap().holders().contains(&"T2".to_string()));
        assert_eq!(s.read("T2", "x2"), Some(25));
    }

    #[test]
    fn test_abort_discards_staged_value() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        s.abort("T1");

        assert_eq!(s.variable("x2").unwrap().latest().unwrap().value, 20);
        assert!(s.variable("x2").unwrap().tentative().is_none());
        assert!(s.lock_manager("x2").unwrap().is_free());
    }

    #[test]
    fn test_fail_clears_locks_keeps_history() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        s.fail(3);

        assert!(!s.is_up());
        assert!(s.lock_manager("x2").unwrap().is_free());
        assert!(s.variable("x2").unwrap().tentative().is_none());
        assert_eq!(s.variable("x2").unwrap().latest().unwrap().value, 20);
        assert_eq!(s.fail_times(), [3]);
    }

    #[test]
    fn test_recover_marks_replicated_unreadable() {
        let mut s = site(2);
        s.fail(3);
        s.recover(5);

        assert!(s.is_up());
        assert_eq!(s.recover_times(), [5]);
        assert!(!s.variable("x2").unwrap().is_readable());
        // unreplicated variables keep serving
        assert!(s.variable("x1").unwrap().is_readable());
        assert_eq!(s.read("T1", "x2"), None);
        assert_eq!(s.read("T1", "x1"), Some(10));
    }

    #[test]
    fn test_commit_after_recovery_restores_readability() {
        let mut s = site(2);
        s.fail(3);
        s.recover(5);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        s.commit("T1", 7).unwrap();

        assert!(s.variable("x2").unwrap().is_readable());
        assert_eq!(s.read("T2", "x2"), Some(25));
    }

    #[test]
    fn test_snapshot_read_interval_rule() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        s.write("T1", "x2", 25).unwrap();
        s.commit("T1", 2).unwrap();

        s.fail(4);
        s.recover(5);
        s.get_write_lock("T2", "x2").unwrap();
        s.write("T2", "x2", 30).unwrap();
        s.commit("T2", 6).unwrap();

        // snapshot at tick 3 would use the commit at 2, but the site failed
        // at 4 inside (2, ts] for any ts >= 4
        assert_eq!(s.snapshot_read("x2", 3), Some(25));
        assert_eq!(s.snapshot_read("x2", 4), None);
        assert_eq!(s.snapshot_read("x2", 5), None);
        // the commit at 6 has no later failure, so it serves again
        assert_eq!(s.snapshot_read("x2", 6), Some(30));
    }

    #[test]
    fn test_snapshot_read_unreplicated_ignores_failures() {
        let mut s = site(2);
        s.fail(3);
        s.recover(4);
        assert_eq!(s.snapshot_read("x1", 5), Some(10));
    }

    #[test]
    fn test_local_waits_for() {
        let mut s = site(1);
        s.get_write_lock("T1", "x2").unwrap();
        assert_eq!(s.read("T2", "x2"), None);

        let edges = s.local_waits_for();
        assert_eq!(edges, [("T2".to_string(), "T1".to_string())]);
    }

    #[test]
    fn test_dump_line() {
        let s = site(3);
        let line = s.dump_line();
        assert!(line.starts_with("site 3 - x2: 20,"));
        assert!(line.contains("x20: 200"));

        let mut s = site(3);
        s.fail(1);
        assert!(s.dump_line().starts_with("site 3 (down) - "));
    }
}
