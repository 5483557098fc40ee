//! Cancellable operation contract.

/// A cancellable token returned to callers for one logical request.
///
/// `cancel` is idempotent and safe to call after completion; a cancelled
/// operation delivers no further callbacks to its subscriber.
pub trait CancellableOperation: Send + Sync {
    /// Tears down this request. The underlying work may continue when
    /// other subscribers share it.
    fn cancel(&self);

    /// Returns true once `cancel` has been called.
    fn is_cancelled(&self) -> bool;
}
