use std::future::Future;
use std::time::Duration;

use crate::{DapError, Result};

/// Bounds `future` by `after`. Elapsed deadlines surface as
/// `DapError::Timeout` naming `operation`.
pub async fn with_deadline<T, F>(after: Duration, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result,
        Err(_) => Err(DapError::timeout(operation, after)),
    }
}
