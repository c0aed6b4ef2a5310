//! Site-level error types.
//!
//! These errors signal broken engine invariants, not user mistakes: a
//! promotion attempted by a non-sole reader, a tentative value owned by the
//! wrong transaction. They are fatal: the driver terminates rather than
//! continue on corrupted lock state.

use thiserror::Error;

use crate::common::{SiteId, TransactionId, VariableId};

/// Lock-table precondition violations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Write installation attempted while another transaction holds the lock.
    #[error("write lock on '{vid}' is held by {holder}, not {tid}")]
    HeldByOther {
        vid: VariableId,
        holder: TransactionId,
        tid: TransactionId,
    },

    /// Read→Write promotion attempted without being the sole reader.
    #[error("cannot promote read lock on '{vid}': transaction {tid} is not the sole reader")]
    PromotionConflict { vid: VariableId, tid: TransactionId },
}

/// Variable-storage precondition violations.
#[derive(Debug, Error)]
pub enum DataError {
    /// Commit reached a variable with no tentative value to publish.
    #[error("no tentative value on '{vid}' to commit")]
    MissingTentative { vid: VariableId },

    /// Staging over an uncommitted value owned by a different transaction.
    #[error("tentative value on '{vid}' belongs to {owner}; {writer} cannot replace it")]
    ForeignTentative {
        vid: VariableId,
        owner: TransactionId,
        writer: TransactionId,
    },

    /// A per-site call addressed a variable the site does not host.
    #[error("variable '{vid}' is not hosted at site {sid}")]
    NotHosted { sid: SiteId, vid: VariableId },
}
