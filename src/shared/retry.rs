// Copyright 2025 JiangLong.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded exponential backoff shared by the store, FSM and agent runner

use crate::shared::error::{OpsError, Result};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_times: usize,
    #[serde(with = "crate::shared::duration")]
    pub min_delay: Duration,
    #[serde(with = "crate::shared::duration")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_times: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_times(mut self, max_times: usize) -> Self {
        self.max_times = max_times;
        self
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_times: 0,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
            .with_jitter()
    }

    /// Retries `op` while it returns an error accepted by `when`.
    pub async fn run_when<F, Fut, T, W>(&self, span: &Span, what: &str, op: F, when: W) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        W: FnMut(&OpsError) -> bool,
    {
        op.retry(&self.backoff())
            .when(when)
            .notify(|err: &OpsError, delay: Duration| {
                warn!(parent: span, error = %err, ?delay, "retrying {}", what);
            })
            .await
    }

    /// Retries `op` on errors classified as retryable.
    pub async fn run<F, Fut, T>(&self, span: &Span, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_when(span, what, op, |e| e.is_retryable()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_times: usize) -> RetryPolicy {
        RetryPolicy {
            max_times,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result = fast_policy(3)
            .run(&Span::none(), "flaky write", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OpsError::backend("unavailable"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = fast_policy(5)
            .run(&Span::none(), "denied", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(OpsError::AccessDenied("bad token".into()))
            })
            .await;
        assert!(matches!(result, Err(OpsError::AccessDenied(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_bound() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = fast_policy(2)
            .run(&Span::none(), "down", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(OpsError::backend("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
