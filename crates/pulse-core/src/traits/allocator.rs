//! Credit ledger.

use crate::error::Result;
use crate::types::{AllocationMethod, UserId};

/// Applies credit amounts to user balances.
pub trait Allocator: Send + Sync {
    fn apply(&self, user_id: UserId, amount: f64, method: AllocationMethod) -> Result<()>;

    fn balance(&self, user_id: UserId) -> Result<f64>;
}
