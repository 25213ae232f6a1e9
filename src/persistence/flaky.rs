//! Store wrapper whose reads fail on demand

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{MemoryStore, Store, Subscription};
use crate::error::StoreError;

/// Delegates to a `MemoryStore`. Once armed, lets `skip` reads through and
/// then fails the next `fail` reads with `Unavailable`.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    skip: AtomicUsize,
    fail: AtomicUsize,
    failed: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, skip: usize, fail: usize) {
        self.skip.store(skip, Ordering::SeqCst);
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn failed_reads(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn pending_failures(&self) -> usize {
        self.fail.load(Ordering::SeqCst)
    }

    fn next_read_fails(&self) -> bool {
        let decrement = |n: usize| n.checked_sub(1);
        if self
            .skip
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok()
        {
            return false;
        }
        self.fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok()
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if self.next_read_fails() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!("read of {} refused", path)));
        }
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError> {
        self.inner.update(path, partial).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.inner.delete(path).await
    }

    async fn stream(&self, path: &str) -> Result<Subscription, StoreError> {
        self.inner.stream(path).await
    }
}
