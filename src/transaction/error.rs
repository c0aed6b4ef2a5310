//! Transaction-specific error types.
//!
//! These are user-facing rejections: a command that names a transaction,
//! site, or variable in a state that cannot accept it. They are reported and
//! the command is dropped; the simulator keeps running.

use thiserror::Error;

use crate::common::{SiteId, TransactionId, VariableId};

/// Result type alias for transaction operations.
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Rejections raised while admitting or executing commands.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// `begin`/`beginRO` on an id that is already in flight.
    #[error("transaction {0} has already begun")]
    AlreadyBegun(TransactionId),

    /// A command referenced a transaction that was never begun (or already
    /// ended).
    #[error("transaction {0} does not exist")]
    NotFound(TransactionId),

    /// A write issued by a read-only transaction.
    #[error("transaction {0} is read-only; writes are not permitted")]
    ReadOnly(TransactionId),

    /// `fail` on a site that is already down.
    #[error("site {0} is already down")]
    SiteAlreadyDown(SiteId),

    /// A site id outside the configured cluster.
    #[error("site {0} does not exist")]
    UnknownSite(SiteId),

    /// A variable id no site hosts; the operation could never complete.
    #[error("variable '{0}' does not exist")]
    UnknownVariable(VariableId),
}
