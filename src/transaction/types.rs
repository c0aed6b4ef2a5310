// Core transaction types.
//
// A `Transaction` is pure metadata: the engine references it by id from lock
// state and the waits-for graph, so nothing here owns anything else.

use serde::{Deserialize, Serialize};

use crate::common::{SiteId, Tick, TransactionId, VariableId};

/// The two transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Locking transaction: reads and writes under strict two-phase locking.
    ReadWrite,
    /// Snapshot transaction: reads committed history as of its start tick.
    ReadOnly,
}

/// Transaction metadata.
///
/// # Invariants
///
/// - `start` is the tick of the `begin` command and never changes.
/// - `visited_sites` records every site this transaction read from or wrote
///   to, for the site-failure abort cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Script-level identifier (e.g. `T1`).
    pub id: TransactionId,
    /// Tick at which the transaction began; also the snapshot timestamp for
    /// read-only transactions.
    pub start: Tick,
    /// Locking or snapshot behavior.
    pub kind: TransactionKind,
    /// Set when a visited site fails; the transaction aborts at `end`.
    pub must_abort: bool,
    /// Sites this transaction has touched, in first-visit order.
    pub visited_sites: Vec<SiteId>,
}

impl Transaction {
    /// Creates a read/write transaction starting at `start`.
    pub fn new(id: TransactionId, start: Tick) -> Self {
        Self {
            id,
            start,
            kind: TransactionKind::ReadWrite,
            must_abort: false,
            visited_sites: Vec::new(),
        }
    }

    /// Creates a read-only transaction starting at `start`.
    pub fn new_read_only(id: TransactionId, start: Tick) -> Self {
        Self {
            kind: TransactionKind::ReadOnly,
            ..Self::new(id, start)
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == TransactionKind::ReadOnly
    }

    /// Records a site access once.
    pub fn record_visit(&mut self, sid: SiteId) {
        if !self.visited_sites.contains(&sid) {
            self.visited_sites.push(sid);
        }
    }

    pub fn visited(&self, sid: SiteId) -> bool {
        self.visited_sites.contains(&sid)
    }
}

/// A pending read or write, retried in FIFO order until it completes or its
/// transaction aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read {
        tid: TransactionId,
        vid: VariableId,
    },
    Write {
        tid: TransactionId,
        vid: VariableId,
        value: i64,
    },
}

impl Operation {
    /// The issuing transaction.
    pub fn tid(&self) -> &str {
        match self {
            Operation::Read { tid, .. } | Operation::Write { tid, .. } => tid,
        }
    }
}
