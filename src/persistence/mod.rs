//! Persistence Module
//!
//! An abstract hierarchical key-path store (`get`/`set`/`update`/`delete`/
//! `stream` over `/`-separated paths holding JSON values) plus the typed
//! portfolio repository built on top of it.

mod file;
#[cfg(test)]
pub(crate) mod flaky;
mod memory;
mod repository;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use repository::PortfolioRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StoreError;

/// Store paths for portfolio records
pub mod paths {
    pub const PORTFOLIOS: &str = "portfolios";
    pub const USERS: &str = "users";

    pub fn portfolio(portfolio_id: &str) -> String {
        format!("{}/{}", PORTFOLIOS, portfolio_id)
    }

    pub fn holdings(portfolio_id: &str) -> String {
        format!("{}/{}/holdings", PORTFOLIOS, portfolio_id)
    }

    pub fn transactions(portfolio_id: &str) -> String {
        format!("{}/{}/transactions", PORTFOLIOS, portfolio_id)
    }

    pub fn performance_history(portfolio_id: &str) -> String {
        format!("{}/{}/performance_history", PORTFOLIOS, portfolio_id)
    }

    pub fn stock_history_root(portfolio_id: &str) -> String {
        format!("{}/{}/stock_history", PORTFOLIOS, portfolio_id)
    }

    pub fn stock_history(portfolio_id: &str, symbol: &str) -> String {
        format!("{}/{}/stock_history/{}", PORTFOLIOS, portfolio_id, symbol)
    }

    pub fn user_portfolios(user_id: &str) -> String {
        format!("{}/{}/portfolios", USERS, user_id)
    }
}

/// Split a store path into its non-empty segments.
pub(crate) fn segments(path: &str) -> Result<Vec<String>, StoreError> {
    let mut out = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment.contains(['#', '$', '[', ']']) {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: format!("segment '{}' contains a reserved character", segment),
            });
        }
        out.push(segment.to_string());
    }
    Ok(out)
}

/// What a mutation did to the node at `StoreEvent::path`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Put,
    Patch,
    Delete,
}

/// Change notification delivered to stream subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    /// Normalized path of the written node
    pub path: String,
    pub kind: ChangeKind,
    /// Value written (`Put`), partial merged (`Patch`), nothing for `Delete`
    pub data: Option<Value>,
}

impl StoreEvent {
    pub fn put(path: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Put,
            data,
        }
    }

    pub fn patch(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Patch,
            data: Some(data),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Delete,
            data: None,
        }
    }

    /// True when the write at `self.path` can change the subtree at `watched`
    /// (one path is a segment prefix of the other).
    pub fn touches(&self, watched: &[String]) -> bool {
        let changed: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        changed
            .iter()
            .zip(watched.iter())
            .all(|(a, b)| *a == b.as_str())
    }

    /// True when the written node lies strictly below `path`
    pub fn is_below(&self, path: &str) -> bool {
        let prefix = path.trim_matches('/');
        self.path
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }
}

type Closer = Box<dyn FnOnce() -> Result<(), StoreError> + Send + Sync>;

/// Owner-side handle of a stream registration. Closing is idempotent; an
/// unclosed handle is closed on drop.
pub struct SubscriptionHandle {
    path: String,
    closer: Option<Closer>,
}

impl SubscriptionHandle {
    pub fn new<F>(path: impl Into<String>, closer: F) -> Self
    where
        F: FnOnce() -> Result<(), StoreError> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            closer: Some(Box::new(closer)),
        }
    }

    /// Handle whose close aborts the forwarding task
    pub fn aborting(path: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self::new(path, move || {
            task.abort();
            Ok(())
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        match self.closer.take() {
            Some(closer) => closer(),
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer();
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live stream registration: the update receiver plus its handle
#[derive(Debug)]
pub struct Subscription {
    pub updates: mpsc::Receiver<StoreEvent>,
    pub handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(updates: mpsc::Receiver<StoreEvent>, handle: SubscriptionHandle) -> Self {
        Self { updates, handle }
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<StoreEvent>, SubscriptionHandle) {
        (self.updates, self.handle)
    }
}

/// Hierarchical key-path store
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &'static str;

    /// Value at `path`, `None` when absent
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the node at `path`; a null value deletes it
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge the top-level keys of `partial` (an object) into the node at
    /// `path`. Keys may themselves be relative paths; null values delete.
    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Stream changes affecting the subtree at `path`. The current value is
    /// delivered first.
    async fn stream(&self, path: &str) -> Result<Subscription, StoreError>;
}
