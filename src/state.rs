//! Shared mutable state of the facilitator core.
//!
//! Every record the ledger and dispute book own lives behind one async
//! mutex. Operations lock, mutate, and release without suspending; the only
//! long-running work (the on-chain transfer) happens outside the lock with
//! a batch snapshot.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::dispute::DisputeBook;
use crate::ledger::AuthorizationLedger;

/// The lock-protected core: authorization ledger plus dispute book.
#[derive(Debug, Default)]
pub struct FacilitatorState {
    pub ledger: AuthorizationLedger,
    pub disputes: DisputeBook,
}

/// Handle to the shared core, cloned into the HTTP layer, the settlement
/// engine, and monitoring.
pub type SharedState = Arc<Mutex<FacilitatorState>>;

impl FacilitatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }
}
