// Cluster transaction management.
//
// The `TransactionManager` is the single root of the simulator: it owns the
// site vector, the transaction table, the pending-operation queue, and the
// logical clock. Each script command runs one tick:
//
// 1. deadlock sweep (abort the youngest participant of any waits-for cycle,
//    then drain, since the abort released locks);
// 2. the command's own effect;
// 3. a drain pass retrying pending operations in FIFO order;
// 4. clock increment.
//
// Reads and writes follow the available-copies discipline: a read is served
// by the first up copy that grants it, a write must take the write lock at
// every up copy before it stages anywhere.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::BufRead;

use tracing::{debug, warn};

use crate::common::{self, Tick, TransactionId};
use crate::parser::{Command, Parser};
use crate::site::DataManager;
use crate::SimConfig;

use super::deadlock::WaitsForGraph;
use super::error::TransactionError;
use super::types::{Operation, Transaction, TransactionKind};

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Deadlock,
    SiteFailure,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Deadlock => write!(f, "deadlock"),
            AbortReason::SiteFailure => write!(f, "site failure"),
        }
    }
}

/// The simulator root: transaction table, operation queue, clock, sites.
#[derive(Debug)]
pub struct TransactionManager {
    config: SimConfig,
    parser: Parser,
    transactions: BTreeMap<TransactionId, Transaction>,
    operations: VecDeque<Operation>,
    tick: Tick,
    sites: Vec<DataManager>,
    trace: Vec<String>,
}

impl TransactionManager {
    /// Builds the cluster described by `config`.
    pub fn new(config: SimConfig) -> Self {
        let sites = (1..=config.site_count)
            .map(|sid| DataManager::new(sid, &config))
            .collect();
        Self {
            config,
            parser: Parser::new(),
            transactions: BTreeMap::new(),
            operations: VecDeque::new(),
            tick: 0,
            sites,
            trace: Vec::new(),
        }
    }

    /// Current tick (the timestamp the next command will run at).
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn sites(&self) -> &[DataManager] {
        &self.sites
    }

    pub fn transaction(&self, tid: &str) -> Option<&Transaction> {
        self.transactions.get(tid)
    }

    /// Number of operations still waiting on locks or sites.
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    /// Protocol trace emitted so far.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Drains the protocol trace for printing.
    pub fn take_trace(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace)
    }

    /// Parses and executes one script line.
    ///
    /// Blank and comment lines are skipped without consuming a tick.
    /// Rejected lines (parse errors, transaction errors) are surfaced in the
    /// trace and the simulator keeps going; only fatal engine errors return
    /// `Err`.
    pub fn process_line(&mut self, line: &str) -> crate::Result<()> {
        let command = match self.parser.parse_line(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(%err, line, "line rejected");
                self.emit(format!("error: {err}"));
                return Ok(());
            }
        };
        match self.process(command) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(%err, "command rejected");
                self.emit(format!("error: {err}"));
                Ok(())
            }
        }
    }

    /// Runs every line of a script.
    pub fn run_script<R: BufRead>(&mut self, reader: R) -> crate::Result<()> {
        for line in reader.lines() {
            self.process_line(&line?)?;
        }
        Ok(())
    }

    /// Executes one command as a full tick.
    pub fn process(&mut self, command: Command) -> crate::Result<()> {
        if self.resolve_deadlock() {
            self.drain_operations()?;
        }
        let outcome = self.apply_command(command);
        if let Err(err) = &outcome {
            if err.is_fatal() {
                return outcome;
            }
        }
        self.drain_operations()?;
        self.tick += 1;
        outcome
    }

    // =========================================================================
    // Tick phases
    // =========================================================================

    /// Aborts the youngest member of a waits-for cycle, if any.
    fn resolve_deadlock(&mut self) -> bool {
        let graph = WaitsForGraph::from_sites(&self.sites);
        if graph.is_empty() {
            return false;
        }
        let Some(victim) = graph.pick_victim(&self.transactions) else {
            return false;
        };
        self.emit(format!(
            "deadlock detected; aborting youngest transaction {victim}"
        ));
        self.abort(&victim, AbortReason::Deadlock);
        true
    }

    fn apply_command(&mut self, command: Command) -> crate::Result<()> {
        match command {
            Command::Begin { tid } => self.begin(tid, TransactionKind::ReadWrite),
            Command::BeginRo { tid } => self.begin(tid, TransactionKind::ReadOnly),
            Command::Read { tid, vid } => self.queue_operation(Operation::Read { tid, vid }),
            Command::Write { tid, vid, value } => {
                self.queue_operation(Operation::Write { tid, vid, value })
            }
            Command::End { tid } => self.end(tid),
            Command::Fail { sid } => self.fail_site(sid),
            Command::Recover { sid } => self.recover_site(sid),
            Command::Dump => {
                self.dump();
                Ok(())
            }
        }
    }

    /// Retries pending operations in admission order. Completed operations
    /// leave the queue; blocked ones keep their position.
    fn drain_operations(&mut self) -> crate::Result<()> {
        let pending: Vec<Operation> = self.operations.drain(..).collect();
        for operation in pending {
            if !self.try_operation(&operation)? {
                debug!(?operation, "operation still pending");
                self.operations.push_back(operation);
            }
        }
        Ok(())
    }

    fn try_operation(&mut self, operation: &Operation) -> crate::Result<bool> {
        match operation {
            Operation::Read { tid, vid } => {
                let Some(txn) = self.transactions.get(tid) else {
                    // owner already ended; nothing left to serve
                    return Ok(true);
                };
                if txn.is_read_only() {
                    let ts = txn.start;
                    Ok(self.try_snapshot_read(tid, vid, ts))
                } else {
                    Ok(self.try_read(tid, vid))
                }
            }
            Operation::Write { tid, vid, value } => {
                if !self.transactions.contains_key(tid) {
                    return Ok(true);
                }
                self.try_write(tid, vid, *value)
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn begin(&mut self, tid: TransactionId, kind: TransactionKind) -> crate::Result<()> {
        if self.transactions.contains_key(&tid) {
            return Err(TransactionError::AlreadyBegun(tid).into());
        }
        let txn = match kind {
            TransactionKind::ReadWrite => {
                self.emit(format!("{tid} begins"));
                Transaction::new(tid.clone(), self.tick)
            }
            TransactionKind::ReadOnly => {
                self.emit(format!("{tid} begins (read-only)"));
                Transaction::new_read_only(tid.clone(), self.tick)
            }
        };
        self.transactions.insert(tid, txn);
        Ok(())
    }

    fn queue_operation(&mut self, operation: Operation) -> crate::Result<()> {
        let txn = self
            .transactions
            .get(operation.tid())
            .ok_or_else(|| TransactionError::NotFound(operation.tid().to_string()))?;
        let vid = match &operation {
            Operation::Read { vid, .. } => vid,
            Operation::Write { vid, .. } => {
                if txn.is_read_only() {
                    return Err(TransactionError::ReadOnly(txn.id.clone()).into());
                }
                vid
            }
        };
        let known = common::variable_index(vid)
            .map_or(false, |n| (1..=self.config.variable_count).contains(&n));
        if !known {
            return Err(TransactionError::UnknownVariable(vid.clone()).into());
        }
        self.operations.push_back(operation);
        Ok(())
    }

    fn end(&mut self, tid: TransactionId) -> crate::Result<()> {
        let txn = self
            .transactions
            .get(&tid)
            .ok_or_else(|| TransactionError::NotFound(tid.clone()))?;
        if txn.must_abort {
            self.abort(&tid, AbortReason::SiteFailure);
            Ok(())
        } else {
            self.commit(&tid)
        }
    }

    fn fail_site(&mut self, sid: usize) -> crate::Result<()> {
        if sid == 0 || sid > self.config.site_count {
            return Err(TransactionError::UnknownSite(sid).into());
        }
        let site = &mut self.sites[sid - 1];
        if !site.is_up() {
            return Err(TransactionError::SiteAlreadyDown(sid).into());
        }
        site.fail(self.tick);
        self.emit(format!("site {sid} fails"));

        // every read/write transaction that touched this site is doomed;
        // snapshot readers never depend on live site state
        for txn in self.transactions.values_mut() {
            if txn.is_read_only() || txn.must_abort || !txn.visited(sid) {
                continue;
            }
            txn.must_abort = true;
            debug!(tid = %txn.id, site = sid, "transaction doomed by site failure");
        }
        Ok(())
    }

    fn recover_site(&mut self, sid: usize) -> crate::Result<()> {
        if sid == 0 || sid > self.config.site_count {
            return Err(TransactionError::UnknownSite(sid).into());
        }
        let site = &mut self.sites[sid - 1];
        if site.is_up() {
            self.emit(format!("site {sid} is already up; no recovery needed"));
            return Ok(());
        }
        site.recover(self.tick);
        self.emit(format!("site {sid} recovers"));
        Ok(())
    }

    fn dump(&mut self) {
        for i in 0..self.sites.len() {
            let line = self.sites[i].dump_line();
            self.emit(line);
        }
    }

    // =========================================================================
    // Operation attempts (available copies)
    // =========================================================================

    /// Locking read: served by the first up copy that grants it.
    fn try_read(&mut self, tid: &str, vid: &str) -> bool {
        for i in 0..self.sites.len() {
            let site = &mut self.sites[i];
            if !site.is_up() || !site.has_variable(vid) {
                continue;
            }
            if let Some(value) = site.read(tid, vid) {
                let sid = site.sid();
                if let Some(txn) = self.transactions.get_mut(tid) {
                    txn.record_visit(sid);
                }
                self.emit(format!("{tid} reads {vid}={value} at site {sid}"));
                return true;
            }
        }
        false
    }

    /// Snapshot read at the transaction's start tick.
    fn try_snapshot_read(&mut self, tid: &str, vid: &str, ts: Tick) -> bool {
        for i in 0..self.sites.len() {
            let site = &self.sites[i];
            if !site.is_up() || !site.has_variable(vid) {
                continue;
            }
            if let Some(value) = site.snapshot_read(vid, ts) {
                let sid = site.sid();
                self.emit(format!("{tid} reads {vid}={value} from snapshot at site {sid}"));
                return true;
            }
        }
        false
    }

    /// All-or-nothing replicated write: every up copy must grant its write
    /// lock before the value stages anywhere. Refusing copies keep the
    /// request queued; granting copies hold their lock across ticks.
    fn try_write(&mut self, tid: &str, vid: &str, value: i64) -> crate::Result<bool> {
        let mut granted = Vec::new();
        let mut blocked = false;
        for site in &mut self.sites {
            if !site.is_up() || !site.has_variable(vid) {
                continue;
            }
            if site.get_write_lock(tid, vid)? {
                granted.push(site.sid());
            } else {
                blocked = true;
            }
        }
        if blocked || granted.is_empty() {
            return Ok(false);
        }

        for &sid in &granted {
            self.sites[sid - 1].write(tid, vid, value)?;
            if let Some(txn) = self.transactions.get_mut(tid) {
                txn.record_visit(sid);
            }
        }
        let sids = granted
            .iter()
            .map(|sid| sid.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.emit(format!("{tid} writes {vid}={value} to sites {sids}"));
        Ok(true)
    }

    // =========================================================================
    // Transaction completion
    // =========================================================================

    fn commit(&mut self, tid: &str) -> crate::Result<()> {
        let ts = self.tick;
        for site in &mut self.sites {
            site.commit(tid, ts)?;
        }
        self.transactions.remove(tid);
        self.operations.retain(|op| op.tid() != tid);
        self.emit(format!("{tid} commits at time {ts}"));
        Ok(())
    }

    fn abort(&mut self, tid: &str, reason: AbortReason) {
        for site in &mut self.sites {
            site.abort(tid);
        }
        self.transactions.remove(tid);
        self.operations.retain(|op| op.tid() != tid);
        self.emit(format!("{tid} aborts [{reason}]"));
    }

    fn emit(&mut self, line: String) {
        self.trace.push(line);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &[&str]) -> TransactionManager {
        let mut tm = TransactionManager::default();
        for line in script {
            tm.process_line(line).unwrap();
        }
        tm
    }

    fn has_line(tm: &TransactionManager, needle: &str) -> bool {
        tm.trace().iter().any(|l| l.contains(needle))
    }

    #[test]
    fn test_begin_and_duplicate_begin() {
        let tm = run(&["begin(T1)", "begin(T1)"]);
        assert!(has_line(&tm, "T1 begins"));
        assert!(has_line(&tm, "error: transaction T1 has already begun"));
    }

    #[test]
    fn test_unknown_transaction_rejected() {
        let tm = run(&["R(T9, x2)"]);
        assert!(has_line(&tm, "error: transaction T9 does not exist"));
        assert_eq!(tm.pending_operations(), 0);
    }

    #[test]
    fn test_read_only_write_rejected() {
        let tm = run(&["beginRO(T1)", "W(T1, x2, 5)"]);
        assert!(has_line(&tm, "error: transaction T1 is read-only"));
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let tm = run(&["begin(T1)", "R(T1, x21)"]);
        assert!(has_line(&tm, "error: variable 'x21' does not exist"));
    }

    #[test]
    fn test_write_reaches_every_up_copy() {
        let tm = run(&["begin(T1)", "W(T1, x2, 25)", "end(T1)"]);
        assert!(has_line(&tm, "T1 writes x2=25 to sites 1, 2, 3, 4, 5, 6, 7, 8, 9, 10"));
        assert!(has_line(&tm, "T1 commits at time 2"));
        for site in tm.sites() {
            assert_eq!(site.variable("x2").unwrap().latest().unwrap().value, 25);
        }
    }

    #[test]
    fn test_write_skips_down_sites() {
        let tm = run(&["fail(3)", "begin(T1)", "W(T1, x2, 25)", "end(T1)"]);
        assert!(has_line(&tm, "T1 writes x2=25 to sites 1, 2, 4, 5, 6, 7, 8, 9, 10"));
        assert_eq!(tm.sites()[2].variable("x2").unwrap().latest().unwrap().value, 20);
    }

    #[test]
    fn test_comment_lines_do_not_tick() {
        let mut tm = TransactionManager::default();
        tm.process_line("// nothing").unwrap();
        tm.process_line("").unwrap();
        assert_eq!(tm.tick(), 0);
        tm.process_line("begin(T1)").unwrap();
        assert_eq!(tm.tick(), 1);
    }

    #[test]
    fn test_fail_on_down_site_rejected() {
        let tm = run(&["fail(1)", "fail(1)"]);
        assert!(has_line(&tm, "error: site 1 is already down"));
    }

    #[test]
    fn test_recover_on_up_site_is_benign() {
        let tm = run(&["recover(2)"]);
        assert!(has_line(&tm, "site 2 is already up; no recovery needed"));
    }

    #[test]
    fn test_dump_lists_all_sites() {
        let tm = run(&["dump"]);
        assert_eq!(tm.trace().len(), 10);
        assert!(tm.trace()[0].starts_with("site 1 - "));
        assert!(tm.trace()[9].starts_with("site 10 - "));
    }

    #[test]
    fn test_pending_read_retries_after_commit() {
        let mut tm = TransactionManager::default();
        for line in [
            "begin(T1)",
            "begin(T2)",
            "W(T1, x1, 101)",
            "R(T2, x1)",
        ] {
            tm.process_line(line).unwrap();
        }
        assert_eq!(tm.pending_operations(), 1);
        tm.process_line("end(T1)").unwrap();
        assert_eq!(tm.pending_operations(), 0);
        assert!(has_line(&tm, "T2 reads x1=101 at site 2"));
    }
}
