//! Helpers for calling synchronous storage from async code.
//!
//! SQLite calls block, so phases running on the tokio workers hand them to
//! the blocking pool instead of stalling sibling phases in the same level.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run `f` on the blocking pool. A panic inside `f` becomes [`Error::TaskJoin`].
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
