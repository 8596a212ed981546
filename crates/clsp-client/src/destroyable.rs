//! C3 — Destroyable: the single-shot destruction contract every stateful
//! component implements.

use async_trait::async_trait;
use clsp_task::DestroyGuard;

use crate::error::ClspError;

#[async_trait]
pub trait Destroyable {
    /// Idempotent, asynchronous teardown. The second and later calls resolve
    /// immediately without re-running teardown (spec.md L1).
    async fn destroy(&self) -> Result<(), ClspError>;

    fn is_destroyed(&self) -> bool;
}

/// Returns `AlreadyDestroyed` if `guard` has begun destruction; otherwise
/// runs `op`. Every mutating method on a `Destroyable` component should be
/// wrapped with this at entry (spec.md I4 / §7).
pub async fn guard_mutation<T, F, Fut>(guard: &DestroyGuard, op: F) -> Result<T, ClspError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClspError>>,
{
    if guard.is_started() {
        return Err(ClspError::AlreadyDestroyed);
    }
    op().await
}
