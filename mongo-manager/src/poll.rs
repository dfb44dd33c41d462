// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Constant-interval polling for conditions with no direct wait mechanism

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of one attempt to check a condition (see [`wait_for_condition()`])
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition()`]
#[derive(Debug, Error)]
pub enum Error<E> {
    /// operation timed out before succeeding or failing permanently
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition: {0}")]
    PermanentError(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed
///
/// Used where we've started a server process or issued a cluster command and
/// have no way to wait directly for its effect: pid files appearing, members
/// reaching a replica-set state, processes exiting after a signal.  `poll_max`
/// bounds when we stop checking `cond`, not how long `cond` itself may take.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_wait_for_condition_succeeds_after_retries() {
        let attempts = AtomicU32::new(0);
        let result = wait_for_condition::<u32, Infallible, _, _>(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 3 { Err(CondCheckError::NotYet) } else { Ok(n) }
            },
            &Duration::from_millis(1),
            &Duration::from_secs(10),
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_condition_times_out() {
        let result = wait_for_condition::<(), Infallible, _, _>(
            || async { Err(CondCheckError::NotYet) },
            &Duration::from_millis(1),
            &Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_wait_for_condition_permanent_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let result = wait_for_condition::<(), Boom, _, _>(
            || async { Err(CondCheckError::Failed(Boom)) },
            &Duration::from_millis(1),
            &Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(Error::PermanentError(Boom))));
    }
}
