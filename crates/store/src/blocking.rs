// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::StorageError;

/// Runs a blocking store call on the blocking thread pool, bounded by a
/// deadline and a cancellation token.
///
/// Returns [`StorageError::Timeout`] or [`StorageError::Cancelled`] when the
/// caller stops waiting. The call itself keeps running to completion in the
/// background; a batch it writes is still applied whole or not at all.
pub fn run_blocking<T, E, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    f: F,
) -> impl Future<Output = Result<T, E>> + Send + 'static
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StorageError> + Send + 'static,
{
    let cancel = cancel.clone();
    async move {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled.into());
        }
        let task = tokio::task::spawn_blocking(f);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled.into()),
            res = tokio::time::timeout(timeout, task) => match res {
                Err(_) => Err(StorageError::Timeout(timeout).into()),
                Ok(Err(join)) => Err(StorageError::Unavailable(format!("blocking call failed: {join}")).into()),
                Ok(Ok(result)) => result,
            },
        }
    }
}
