//! Root node of the parameter store.
//!
//! The root owns the authoritative copy of every tag. A mutation is
//! committed locally under the tag's lock, stamped with a fresh epoch, and
//! handed to the root's direct children in the routing tree; each child
//! forwards it to its own subtree.
//!
//! ```text
//!  push(tag) ──► lock(tag) ──► commit ──► epoch ──► dispatch ──► unlock
//!                                                      │
//!                                  wait = true ────────┴──► join subtree
//! ```

use super::config::StoreConfig;
use super::lock_table::LockTable;
use super::meta::{new_id, next_count, Overrides, ParamMeta};
use super::routing::RouteTree;
use super::transport::{failed_endpoints, Broadcast, PendingCall, Transport};
use crate::core::context::NodeContext;
use crate::core::version::EpochCounter;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Clone)]
struct ParamEntry {
    meta: ParamMeta,
    bytes: Arc<Vec<u8>>,
}

/// Authoritative store fanning mutations out to replicas.
pub struct ParamRoot {
    ctx: NodeContext,
    config: StoreConfig,
    route: RouteTree,
    transport: Arc<dyn Transport>,
    params: RwLock<HashMap<String, ParamEntry>>,
    locks: LockTable,
    epochs: EpochCounter,
}

impl ParamRoot {
    /// Build the routing tree over `replica_ids` and configure every replica.
    pub fn new(
        ctx: NodeContext,
        config: StoreConfig,
        replica_ids: Vec<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let route = RouteTree::new(replica_ids, config.fan_out)?;
        for id in route.ids() {
            let children = route.children(id).unwrap_or_default();
            transport.configure(id, children.into_iter().map(String::from).collect())?;
        }
        log::info!(
            "parameter root {} over {} replicas (fan-out {}, depth {})",
            ctx.node_id(),
            route.len(),
            route.fan_out(),
            route.depth()
        );
        Ok(Self {
            ctx,
            config,
            route,
            transport,
            params: RwLock::new(HashMap::new()),
            locks: LockTable::new(),
            epochs: EpochCounter::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn route(&self) -> &RouteTree {
        &self.route
    }

    /// Store a new value for `tag` and propagate it; returns the value's id.
    ///
    /// The id is a fresh uuid and the count the previous count + 1 (1 for a
    /// new tag) unless `overrides` say otherwise. With `wait`, returns only
    /// once every replica has it. A propagation failure is reported as
    /// [`Error::PropagationIncomplete`]; the root keeps the new value.
    pub fn push(&self, tag: &str, bytes: Vec<u8>, info: Value, wait: bool, overrides: Overrides) -> Result<String> {
        let lock = self.locks.entry(tag);
        let (id, calls) = {
            let _guard = lock.lock();
            let previous = self.params.read().get(tag).map(|e| e.meta.clone());
            let meta = ParamMeta::next(previous.as_ref(), info, &overrides);
            let id = meta.id.clone();
            let count = meta.count;
            let msg = Broadcast::Update {
                tag: tag.to_string(),
                meta: meta.clone(),
                bytes: bytes.clone(),
                epoch: self.epochs.next(),
            };
            self.params.write().insert(
                tag.to_string(),
                ParamEntry {
                    meta,
                    bytes: Arc::new(bytes),
                },
            );
            log::debug!("push '{}' count {} epoch {}", tag, count, msg.epoch());
            (id, self.dispatch(Arc::new(msg), wait))
        };
        self.finish(tag, calls, wait)?;
        Ok(id)
    }

    /// Copy `old` to `new` and propagate it; returns the new tag's id.
    ///
    /// The id is fresh as with [`push`](Self::push). Time and info are taken
    /// from `old` unless given. The count continues `new`'s own sequence (1 if
    /// `new` is absent) unless overridden.
    pub fn duplicate(
        &self,
        old: &str,
        new: &str,
        info: Option<Value>,
        overrides: Overrides,
        wait: bool,
    ) -> Result<String> {
        let source = self
            .params
            .read()
            .get(old)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tag '{}'", old)))?;
        let lock = self.locks.entry(new);
        let (id, calls) = {
            let _guard = lock.lock();
            let previous = self.params.read().get(new).map(|e| e.meta.clone());
            let meta = ParamMeta {
                id: overrides.id.unwrap_or_else(new_id),
                info: info.unwrap_or(source.meta.info),
                time: overrides.time.unwrap_or(source.meta.time),
                count: overrides.count.unwrap_or_else(|| next_count(previous.as_ref())),
            };
            let id = meta.id.clone();
            let msg = Broadcast::Update {
                tag: new.to_string(),
                meta: meta.clone(),
                bytes: source.bytes.as_ref().clone(),
                epoch: self.epochs.next(),
            };
            self.params.write().insert(
                new.to_string(),
                ParamEntry {
                    meta,
                    bytes: source.bytes,
                },
            );
            log::debug!("duplicate '{}' -> '{}' epoch {}", old, new, msg.epoch());
            (id, self.dispatch(Arc::new(msg), wait))
        };
        self.finish(new, calls, wait)?;
        Ok(id)
    }

    /// Remove `tag` everywhere. An absent tag is [`Error::NotFound`].
    pub fn delete(&self, tag: &str, wait: bool) -> Result<()> {
        let lock = self.locks.entry(tag);
        let calls = {
            let _guard = lock.lock();
            if self.params.write().remove(tag).is_none() {
                return Err(Error::NotFound(format!("tag '{}'", tag)));
            }
            let msg = Broadcast::Delete {
                tag: tag.to_string(),
                epoch: self.epochs.next(),
            };
            log::debug!("delete '{}' epoch {}", tag, msg.epoch());
            self.dispatch(Arc::new(msg), wait)
        };
        self.finish(tag, calls, wait)
    }

    fn dispatch(&self, msg: Arc<Broadcast>, wait: bool) -> Vec<PendingCall> {
        self.route
            .root_children()
            .into_iter()
            .map(|child| self.transport.call_async(child, Arc::clone(&msg), wait))
            .collect()
    }

    fn finish(&self, tag: &str, calls: Vec<PendingCall>, wait: bool) -> Result<()> {
        if !wait {
            return Ok(());
        }
        let failed = failed_endpoints(calls);
        if failed.is_empty() {
            Ok(())
        } else {
            log::warn!("propagation of '{}' incomplete, failed: {:?}", tag, failed);
            Err(Error::PropagationIncomplete { failed })
        }
    }

    /// Stored tags, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.params.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.params.read().contains_key(tag)
    }

    /// Info of every tag.
    pub fn tags_info(&self) -> BTreeMap<String, Value> {
        self.params
            .read()
            .iter()
            .map(|(tag, e)| (tag.clone(), e.meta.info.clone()))
            .collect()
    }

    pub fn meta(&self, tag: &str) -> Result<ParamMeta> {
        self.params
            .read()
            .get(tag)
            .map(|e| e.meta.clone())
            .ok_or_else(|| Error::NotFound(format!("tag '{}'", tag)))
    }

    /// Authoritative bytes and metadata of `tag`.
    pub fn get(&self, tag: &str) -> Result<(Vec<u8>, ParamMeta)> {
        self.params
            .read()
            .get(tag)
            .map(|e| (e.bytes.as_ref().clone(), e.meta.clone()))
            .ok_or_else(|| Error::NotFound(format!("tag '{}'", tag)))
    }

    /// Every tag with its metadata and shared bytes, sorted by tag.
    pub(crate) fn entries(&self) -> Vec<(String, ParamMeta, Arc<Vec<u8>>)> {
        let mut entries: Vec<_> = self
            .params
            .read()
            .iter()
            .map(|(tag, e)| (tag.clone(), e.meta.clone(), Arc::clone(&e.bytes)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::transport::InProcessTransport;
    use serde_json::json;

    fn lone_root() -> (tempfile::TempDir, ParamRoot) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::with_segment_dir("root", dir.path()).unwrap();
        let root = ParamRoot::new(
            ctx,
            StoreConfig::new(dir.path().join("models")),
            Vec::new(),
            Arc::new(InProcessTransport::new()),
        )
        .unwrap();
        (dir, root)
    }

    #[test]
    fn test_push_counts_and_ids() {
        let (_dir, root) = lone_root();
        let first = root.push("p", vec![1], json!({"step": 1}), true, Overrides::new()).unwrap();
        let second = root.push("p", vec![2], json!({"step": 2}), true, Overrides::new()).unwrap();
        assert_ne!(first, second);

        let meta = root.meta("p").unwrap();
        assert_eq!(meta.count, 2);
        assert_eq!(meta.id, second);
        assert_eq!(root.get("p").unwrap().0, vec![2]);
    }

    #[test]
    fn test_push_overrides() {
        let (_dir, root) = lone_root();
        let id = root
            .push("p", vec![], Value::Null, false, Overrides::new().with_id("v1").with_count(9).with_time(3.0))
            .unwrap();
        assert_eq!(id, "v1");
        let meta = root.meta("p").unwrap();
        assert_eq!((meta.count, meta.time), (9, 3.0));
        root.push("p", vec![], Value::Null, false, Overrides::new()).unwrap();
        assert_eq!(root.meta("p").unwrap().count, 10);
    }

    #[test]
    fn test_duplicate_assigns_fresh_id() {
        let (_dir, root) = lone_root();
        root.push("a", vec![1, 2], json!("a-info"), true, Overrides::new()).unwrap();
        let source = root.meta("a").unwrap();

        let dup = root.duplicate("a", "b", None, Overrides::new(), true).unwrap();
        assert_ne!(dup, source.id);
        let meta = root.meta("b").unwrap();
        assert_eq!(meta.id, dup);
        assert_eq!(meta.info, json!("a-info"));
        assert_eq!(meta.time, source.time);
        assert_eq!(meta.count, 1);
        assert_eq!(root.get("b").unwrap().0, vec![1, 2]);

        let again = root.duplicate("a", "b", Some(json!("b-info")), Overrides::new(), true).unwrap();
        assert_ne!(again, dup);
        let meta = root.meta("b").unwrap();
        assert_eq!(meta.count, 2);
        assert_eq!(meta.info, json!("b-info"));
        assert_eq!(root.meta("a").unwrap().id, source.id);
    }

    #[test]
    fn test_duplicate_missing_source() {
        let (_dir, root) = lone_root();
        assert!(matches!(
            root.duplicate("x", "y", None, Overrides::new(), true),
            Err(Error::NotFound(_))
        ));
        assert!(!root.contains("y"));
    }

    #[test]
    fn test_delete_and_listing() {
        let (_dir, root) = lone_root();
        root.push("b", vec![], json!(2), true, Overrides::new()).unwrap();
        root.push("a", vec![], json!(1), true, Overrides::new()).unwrap();
        assert_eq!(root.list(), vec!["a", "b"]);
        assert_eq!(root.tags_info().get("a"), Some(&json!(1)));

        root.delete("a", true).unwrap();
        assert_eq!(root.list(), vec!["b"]);
        assert!(matches!(root.get("a"), Err(Error::NotFound(_))));

        // A second delete, or one of a tag never pushed, is reported.
        assert!(matches!(root.delete("a", true), Err(Error::NotFound(_))));
        assert!(matches!(root.delete("never", false), Err(Error::NotFound(_))));
        assert_eq!(root.list(), vec!["b"]);
    }

    #[test]
    fn test_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = NodeContext::with_segment_dir("root", dir.path()).unwrap();
        let result = ParamRoot::new(
            ctx,
            StoreConfig::default().with_fan_out(0),
            Vec::new(),
            Arc::new(InProcessTransport::new()),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
