//! In-memory JSON tree store

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use super::{segments, Store, StoreEvent, Subscription, SubscriptionHandle};
use crate::error::StoreError;

const EVENT_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 64;

fn pointer(segs: &[String]) -> String {
    segs.iter()
        .map(|s| format!("/{}", s.replace('~', "~0")))
        .collect()
}

fn apply_set(root: &mut Value, segs: &[String], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        *root = if value.is_object() {
            value
        } else {
            Value::Object(Map::new())
        };
        return;
    };

    if value.is_null() {
        apply_delete(root, segs);
        return;
    }

    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = &mut node[seg.as_str()];
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node[last.as_str()] = value;
}

fn apply_delete(root: &mut Value, segs: &[String]) {
    let Some((last, parents)) = segs.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    if let Some(Value::Object(map)) = root.pointer_mut(&pointer(parents)) {
        map.remove(last);
    }
}

/// Store holding the whole tree in memory. Change events fan out on a
/// broadcast channel; each stream filters them to its subtree.
pub struct MemoryStore {
    tree: RwLock<Value>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tree(Value::Object(Map::new()))
    }

    pub fn with_tree(tree: Value) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tree = if tree.is_object() {
            tree
        } else {
            Value::Object(Map::new())
        };
        Self {
            tree: RwLock::new(tree),
            events,
        }
    }

    /// Deep copy of the full tree
    pub async fn snapshot(&self) -> Value {
        self.tree.read().await.clone()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = segments(path)?;
        let tree = self.tree.read().await;
        Ok(tree
            .pointer(&pointer(&segs))
            .filter(|v| !v.is_null())
            .cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = segments(path)?;
        let event = if value.is_null() {
            StoreEvent::delete(segs.join("/"))
        } else {
            StoreEvent::put(segs.join("/"), Some(value.clone()))
        };
        apply_set(&mut *self.tree.write().await, &segs, value);
        self.publish(event);
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError> {
        let segs = segments(path)?;
        let Value::Object(fields) = partial else {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "update requires an object".to_string(),
            });
        };

        let mut children = Vec::with_capacity(fields.len());
        for (key, value) in &fields {
            let mut child = segs.clone();
            child.extend(segments(key)?);
            children.push((child, value.clone()));
        }

        {
            let mut tree = self.tree.write().await;
            for (child, value) in children {
                apply_set(&mut tree, &child, value);
            }
        }
        self.publish(StoreEvent::patch(segs.join("/"), Value::Object(fields)));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let segs = segments(path)?;
        apply_delete(&mut *self.tree.write().await, &segs);
        self.publish(StoreEvent::delete(segs.join("/")));
        Ok(())
    }

    async fn stream(&self, path: &str) -> Result<Subscription, StoreError> {
        let watched = segments(path)?;
        let normalized = watched.join("/");

        // Subscribe before reading so no write falls between snapshot and feed
        let mut events = self.events.subscribe();
        let initial = self.get(&normalized).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let stream_path = normalized.clone();
        let task = tokio::spawn(async move {
            if tx
                .send(StoreEvent::put(stream_path.clone(), initial))
                .await
                .is_err()
            {
                return;
            }
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.touches(&watched) && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(path = %stream_path, skipped, "⚠️ [STORE] Stream lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(path = %stream_path, "[STORE] Stream forwarder finished");
        });

        Ok(Subscription::new(
            rx,
            SubscriptionHandle::aborting(normalized, task),
        ))
    }
}
