//! Scriptable in-process backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clinic_core::query::{QueryRequest, QueryResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::backend::{AgentBackend, BackendError};

/// Backend answering with a fixed text after an optional delay.
pub(crate) struct MockBackend {
    answer: String,
    delay: Duration,
    fail: Mutex<bool>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub(crate) fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_owned(),
            delay: Duration::ZERO,
            fail: Mutex::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn query(&self, _request: &QueryRequest, cancel: &CancellationToken) -> Result<QueryResult, BackendError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        if *self.fail.lock() {
            return Err(BackendError::Status {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(QueryResult::text(self.answer.clone()))
    }

    async fn health(&self) -> Result<(), BackendError> {
        if *self.fail.lock() {
            Err(BackendError::Status {
                status: 503,
                message: "unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}
