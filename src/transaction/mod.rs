// Transaction Management Module
//
// The cluster-wide half of the engine:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | `Transaction`, `TransactionKind`, pending `Operation` |
// | [`error`] | User-facing command rejections |
// | [`manager`] | Tick loop, command handlers, available-copies routing |
// | [`deadlock`] | Waits-for graph union and youngest-victim selection |

pub mod deadlock;
pub mod error;
pub mod manager;
pub mod types;

pub use deadlock::WaitsForGraph;
pub use error::{TransactionError, TransactionResult};
pub use manager::TransactionManager;
pub use types::{Operation, Transaction, TransactionKind};
