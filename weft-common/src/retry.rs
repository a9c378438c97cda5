// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Number of retries after the first attempt for availability failures.
pub const AVAILABILITY_MAX_RETRIES: usize = 4;

/// Whether an operation failure is worth retrying.
///
/// `Retryable` covers availability problems: refused connections, timeouts,
/// transient 5xx. `Permanent` covers 4xx, schema and validation failures,
/// where retrying can only reproduce the same outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

pub trait ClassifyError {
    fn error_class(&self) -> ErrorClass;
}

/// Runs `operation`, retrying availability failures with 2s/4s/8s/16s waits.
///
/// Permanent failures are returned immediately. After `AVAILABILITY_MAX_RETRIES`
/// retries the last error is returned.
pub async fn with_availability_retry<T, E, F, Fut>(
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: ClassifyError + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    for attempt in 0..=AVAILABILITY_MAX_RETRIES {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.error_class() == ErrorClass::Permanent => {
                error!(operation = operation_name, %error, "permanent-error");
                return Err(error);
            }
            Err(error) if attempt < AVAILABILITY_MAX_RETRIES => {
                let wait = Duration::from_secs(2 * (1 << attempt));
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs(),
                    %error,
                    "operation-unavailable-retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(error) => {
                error!(
                    operation = operation_name,
                    retries = AVAILABILITY_MAX_RETRIES,
                    %error,
                    "operation-unavailable-giving-up"
                );
                return Err(error);
            }
        }
    }
    unreachable!("retry loop always returns");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct TestError {
        message: String,
        class: ErrorClass,
    }

    impl ClassifyError for TestError {
        fn error_class(&self) -> ErrorClass {
            self.class
        }
    }

    fn retryable(message: &str) -> TestError {
        TestError {
            message: message.to_string(),
            class: ErrorClass::Retryable,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_are_retried_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<u32, TestError> =
            with_availability_retry("bulk_upsert", move || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(retryable("connection refused"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_fail_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<(), TestError> =
            with_availability_retry("bulk_upsert", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TestError {
                        message: "400 bad request".to_string(),
                        class: ErrorClass::Permanent,
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<(), TestError> =
            with_availability_retry("bulk_delete", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(retryable("503 service unavailable"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), AVAILABILITY_MAX_RETRIES + 1);
    }
}
