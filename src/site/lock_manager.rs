// Per-variable lock management.
//
// Every variable at every site has its own `LockManager`: the currently
// granted lock, the set of transactions sharing a read grant, and a FIFO
// queue of blocked requests. The locks are a logical concurrency-control
// mechanism over interleaved transactions, not thread synchronization;
// nothing here ever blocks the calling thread.
//
// # Promotion
//
// A Read→Write promotion by the same transaction is allowed iff that
// transaction is the sole reader and no other transaction has a Write queued
// ahead. This keeps already-waiting writers from starving.
//
// # Fairness
//
// The queue is strict FIFO, except that `advance()` coalesces a leading
// batch of consecutive Read requests into one shared grant.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{TransactionId, VariableId};

use super::error::LockError;

/// The two lock kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Shared read lock.
    Read,
    /// Exclusive write lock.
    Write,
}

impl LockKind {
    /// Read/Read never conflicts; every other combination does.
    pub fn conflicts_with(self, other: LockKind) -> bool {
        !(self == LockKind::Read && other == LockKind::Read)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => write!(f, "R"),
            LockKind::Write => write!(f, "W"),
        }
    }
}

/// A granted or requested lock. Transactions are referenced by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub kind: LockKind,
    pub tid: TransactionId,
    pub vid: VariableId,
}

impl Lock {
    pub fn read(tid: &str, vid: &str) -> Self {
        Self {
            kind: LockKind::Read,
            tid: tid.to_string(),
            vid: vid.to_string(),
        }
    }

    pub fn write(tid: &str, vid: &str) -> Self {
        Self {
            kind: LockKind::Write,
            tid: tid.to_string(),
            vid: vid.to_string(),
        }
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The request holds the lock (or shares it).
    Granted,
    /// The request was queued; the caller should retry later.
    Blocked,
}

impl LockAttempt {
    pub fn is_granted(self) -> bool {
        matches!(self, LockAttempt::Granted)
    }
}

/// Lock state for a single variable.
///
/// # Invariants
///
/// - If `current` is a Write, `holders` contains exactly the writer.
/// - If `current` is a Read, `holders` is the nonempty reader set.
/// - The queue holds at most one entry per (transaction, kind), and a queued
///   Write subsumes any later Read request from the same transaction.
/// - A transaction holding access never also queues the same kind.
#[derive(Debug, Clone)]
pub struct LockManager {
    vid: VariableId,
    current: Option<Lock>,
    holders: Vec<TransactionId>,
    queue: VecDeque<Lock>,
}

impl LockManager {
    /// Creates an unlocked manager for one variable.
    pub fn new(vid: VariableId) -> Self {
        Self {
            vid,
            current: None,
            holders: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// The currently granted lock, if any.
    pub fn current(&self) -> Option<&Lock> {
        self.current.as_ref()
    }

    /// Transactions holding access: the reader set, or the sole writer.
    pub fn holders(&self) -> &[TransactionId] {
        &self.holders
    }

    /// Blocked requests in FIFO order.
    pub fn queue(&self) -> &VecDeque<Lock> {
        &self.queue
    }

    /// Returns true if nothing is granted.
    pub fn is_free(&self) -> bool {
        self.current.is_none()
    }

    /// Returns true if `tid` holds the write lock.
    pub fn holds_write(&self, tid: &str) -> bool {
        self.current
            .as_ref()
            .map_or(false, |l| l.kind == LockKind::Write && l.tid == tid)
    }

    fn is_sole_reader(&self, tid: &str) -> bool {
        self.holders.len() == 1 && self.holders[0] == tid
    }

    /// Requests a shared read grant for `tid`.
    ///
    /// Granted if the lock is free, if `tid` already has access (shared read
    /// or its own write), or if the read can join the current reader set
    /// without overtaking a queued writer. Otherwise the request is queued.
    pub fn try_read(&mut self, tid: &str) -> LockAttempt {
        match &self.current {
            None => {
                self.current = Some(Lock::read(tid, &self.vid));
                self.holders.push(tid.to_string());
                self.remove_queued(tid, LockKind::Read);
                LockAttempt::Granted
            }
            Some(lock) if lock.kind == LockKind::Read => {
                if self.holders.iter().any(|t| t == tid) {
                    return LockAttempt::Granted;
                }
                // joining readers must not overtake a queued writer
                if self.queue.iter().all(|q| q.kind != LockKind::Write) {
                    self.holders.push(tid.to_string());
                    self.remove_queued(tid, LockKind::Read);
                    LockAttempt::Granted
                } else {
                    self.enqueue(Lock::read(tid, &self.vid));
                    LockAttempt::Blocked
                }
            }
            Some(lock) => {
                if lock.tid == tid {
                    // a held write already covers reads
                    LockAttempt::Granted
                } else {
                    self.enqueue(Lock::read(tid, &self.vid));
                    LockAttempt::Blocked
                }
            }
        }
    }

    /// Requests the exclusive write lock for `tid`.
    ///
    /// Granted if the lock is free, already held as a Write by `tid`, or
    /// promotion-eligible (sole reader, no other transaction's Write queued).
    /// The grant is not installed; callers follow up with `write_apply`.
    /// Otherwise the request is queued.
    pub fn try_write(&mut self, tid: &str) -> LockAttempt {
        let grantable = match &self.current {
            None => true,
            Some(lock) if lock.kind == LockKind::Write => lock.tid == tid,
            Some(_) => {
                self.is_sole_reader(tid)
                    && self
                        .queue
                        .iter()
                        .all(|q| q.kind != LockKind::Write || q.tid == tid)
            }
        };
        if grantable {
            LockAttempt::Granted
        } else {
            self.enqueue(Lock::write(tid, &self.vid));
            LockAttempt::Blocked
        }
    }

    /// Installs the write lock after a successful `try_write`, promoting a
    /// sole-reader grant if needed.
    pub fn write_apply(&mut self, tid: &str) -> Result<(), LockError> {
        match &self.current {
            None => {}
            Some(lock) if lock.kind == LockKind::Write => {
                if lock.tid != tid {
                    return Err(LockError::HeldByOther {
                        vid: self.vid.clone(),
                        holder: lock.tid.clone(),
                        tid: tid.to_string(),
                    });
                }
                self.remove_queued_all(tid);
                return Ok(());
            }
            Some(_) => {
                if !self.is_sole_reader(tid) {
                    return Err(LockError::PromotionConflict {
                        vid: self.vid.clone(),
                        tid: tid.to_string(),
                    });
                }
                debug!(vid = %self.vid, tid, "read lock promoted to write");
            }
        }
        self.current = Some(Lock::write(tid, &self.vid));
        self.holders.clear();
        self.holders.push(tid.to_string());
        // a held write subsumes anything this transaction still has queued
        self.remove_queued_all(tid);
        Ok(())
    }

    /// Releases every grant and queued request of `tid`.
    pub fn release(&mut self, tid: &str) {
        self.holders.retain(|t| t != tid);
        let cleared = match &self.current {
            Some(lock) if lock.kind == LockKind::Write => lock.tid == tid,
            Some(_) => self.holders.is_empty(),
            None => false,
        };
        if cleared {
            self.current = None;
        }
        self.remove_queued_all(tid);
    }

    /// Grants queued requests after a release.
    ///
    /// Pops the queue head as the new grant. A Read head additionally admits
    /// every immediately-following Read as a shared reader, stopping at the
    /// first Write; if that leaves a sole reader whose next queued request is
    /// its own Write, the grant is promoted directly.
    pub fn advance(&mut self) {
        if self.current.is_some() {
            return;
        }
        let Some(head) = self.queue.pop_front() else {
            return;
        };
        debug!(vid = %self.vid, tid = %head.tid, kind = %head.kind, "queued request granted");
        if head.kind == LockKind::Write {
            self.holders.clear();
            self.holders.push(head.tid.clone());
            self.current = Some(head);
            return;
        }

        self.holders.clear();
        self.holders.push(head.tid.clone());
        while self
            .queue
            .front()
            .map_or(false, |next| next.kind == LockKind::Read)
        {
            let next = match self.queue.pop_front() {
                Some(l) => l,
                None => break,
            };
            if !self.holders.iter().any(|t| *t == next.tid) {
                self.holders.push(next.tid);
            }
        }

        // sole reader immediately followed by its own write: promote
        if self.holders.len() == 1 {
            let sole = self.holders[0].clone();
            if self
                .queue
                .front()
                .map_or(false, |next| next.kind == LockKind::Write && next.tid == sole)
            {
                let write = match self.queue.pop_front() {
                    Some(l) => l,
                    None => return,
                };
                self.current = Some(write);
                return;
            }
        }
        self.current = Some(Lock::read(&self.holders[0], &self.vid));
    }

    /// Clears all lock state (site failure).
    pub fn clear(&mut self) {
        self.current = None;
        self.holders.clear();
        self.queue.clear();
    }

    /// Waits-for edges induced by this lock: every queued request waits on
    /// every conflicting holder, and on every conflicting earlier queued
    /// request.
    pub fn waits_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        let mut edges = Vec::new();
        if let Some(current) = &self.current {
            for waiter in &self.queue {
                if !waiter.kind.conflicts_with(current.kind) {
                    continue;
                }
                for holder in &self.holders {
                    if *holder != waiter.tid {
                        edges.push((waiter.tid.clone(), holder.clone()));
                    }
                }
            }
        }
        for (i, earlier) in self.queue.iter().enumerate() {
            for later in self.queue.iter().skip(i + 1) {
                if later.kind.conflicts_with(earlier.kind) && later.tid != earlier.tid {
                    edges.push((later.tid.clone(), earlier.tid.clone()));
                }
            }
        }
        edges
    }

    fn enqueue(&mut self, lock: Lock) {
        let subsumed = self
            .queue
            .iter()
            .any(|q| q.tid == lock.tid && (q.kind == lock.kind || q.kind == LockKind::Write));
        if subsumed {
            return;
        }
        debug!(vid = %self.vid, tid = %lock.tid, kind = %lock.kind, "lock request queued");
        self.queue.push_back(lock);
    }

    fn remove_queued(&mut self, tid: &str, kind: LockKind) {
        self.queue.retain(|q| q.tid != tid || q.kind != kind);
    }

    fn remove_queued_all(&mut self, tid: &str) {
        self.queue.retain(|q| q.tid != tid);
    }
}
