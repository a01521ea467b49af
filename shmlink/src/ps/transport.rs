//! RPC seam between the root and its replicas.
//!
//! The store never talks to a replica directly. Every mutation travels as a
//! [`Broadcast`] through a [`Transport`], so the in-process transport used
//! here can be swapped for one that serializes messages over the network.
//!
//! ```text
//!   ParamRoot ──call_async──► replica 0 ──call_async──► replica 4
//!       │                        │
//!       │                        └──────call_async──► replica 8
//!       └─────call_async──► replica 1 ...
//!
//! each call_async returns a PendingCall (one-shot crossbeam channel)
//! ```

use super::meta::ParamMeta;
use super::replica::ReplicaNode;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Mutation fanned out from the root down the routing tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Broadcast {
    /// Store a new value for `tag`.
    Update {
        tag: String,
        meta: ParamMeta,
        bytes: Vec<u8>,
        epoch: u64,
    },
    /// Drop `tag` and release its ring slots.
    Delete { tag: String, epoch: u64 },
}

impl Broadcast {
    pub fn tag(&self) -> &str {
        match self {
            Broadcast::Update { tag, .. } | Broadcast::Delete { tag, .. } => tag,
        }
    }

    /// Root-assigned ordering stamp.
    pub fn epoch(&self) -> u64 {
        match self {
            Broadcast::Update { epoch, .. } | Broadcast::Delete { epoch, .. } => *epoch,
        }
    }
}

/// Result of an asynchronous call, delivered once.
pub struct PendingCall {
    endpoint: String,
    rx: Receiver<Result<()>>,
}

impl PendingCall {
    /// A pending call and the sender that completes it.
    pub fn channel(endpoint: impl Into<String>) -> (Sender<Result<()>>, Self) {
        let (tx, rx) = bounded(1);
        (
            tx,
            Self {
                endpoint: endpoint.into(),
                rx,
            },
        )
    }

    /// An already completed call.
    pub fn ready(endpoint: impl Into<String>, result: Result<()>) -> Self {
        let (tx, call) = Self::channel(endpoint);
        let _ = tx.send(result);
        call
    }

    /// Replica the call was addressed to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the result has arrived.
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Block until the call completes.
    ///
    /// A call whose worker vanished without answering counts as a failure of
    /// its endpoint.
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::PropagationIncomplete {
                failed: vec![self.endpoint],
            }),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Err(Error::PropagationIncomplete {
                failed: vec![self.endpoint],
            }),
        }
    }
}

/// Wait for every call and return the replicas that failed.
///
/// A failing replica that reports its own failed subtree contributes that
/// list; any other error is charged to the endpoint itself.
pub fn failed_endpoints(calls: Vec<PendingCall>) -> Vec<String> {
    let mut failed = Vec::new();
    for call in calls {
        let endpoint = call.endpoint.clone();
        match call.wait() {
            Ok(()) => {}
            Err(Error::PropagationIncomplete { failed: nodes }) => failed.extend(nodes),
            Err(e) => {
                log::warn!("broadcast to {} failed: {}", endpoint, e);
                failed.push(endpoint);
            }
        }
    }
    failed
}

/// Delivery of broadcasts and routing to replicas.
pub trait Transport: Send + Sync {
    /// Tell `endpoint` which replicas it forwards to.
    fn configure(&self, endpoint: &str, children: Vec<String>) -> Result<()>;

    /// Deliver `msg` and return once `endpoint` has handled it.
    fn call(&self, endpoint: &str, msg: Arc<Broadcast>, wait: bool) -> Result<()>;

    /// Deliver `msg` without blocking the caller.
    fn call_async(&self, endpoint: &str, msg: Arc<Broadcast>, wait: bool) -> PendingCall;
}

/// Transport routing calls to replicas living in this process.
///
/// Holds weak references: a replica dropped by its owner becomes
/// unreachable, which is how tests simulate a dead node.
#[derive(Default)]
pub struct InProcessTransport {
    replicas: RwLock<HashMap<String, Weak<ReplicaNode>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `replica` reachable under its node id.
    pub fn register(&self, replica: &Arc<ReplicaNode>) {
        self.replicas
            .write()
            .insert(replica.node_id().to_string(), Arc::downgrade(replica));
    }

    /// Make a replica unreachable. Returns whether it was registered.
    pub fn deregister(&self, node_id: &str) -> bool {
        self.replicas.write().remove(node_id).is_some()
    }

    /// Registered node ids.
    pub fn endpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.replicas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lookup(&self, endpoint: &str) -> Result<Arc<ReplicaNode>> {
        self.replicas
            .read()
            .get(endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::NotFound(format!("replica '{}'", endpoint)))
    }
}

impl Transport for InProcessTransport {
    fn configure(&self, endpoint: &str, children: Vec<String>) -> Result<()> {
        self.lookup(endpoint)?.set_children(children);
        Ok(())
    }

    fn call(&self, endpoint: &str, msg: Arc<Broadcast>, wait: bool) -> Result<()> {
        self.lookup(endpoint)?.handle(msg, wait)
    }

    fn call_async(&self, endpoint: &str, msg: Arc<Broadcast>, wait: bool) -> PendingCall {
        let node = match self.lookup(endpoint) {
            Ok(node) => node,
            Err(e) => return PendingCall::ready(endpoint, Err(e)),
        };
        let (tx, pending) = PendingCall::channel(endpoint);
        let spawned = thread::Builder::new()
            .name(format!("ps-call-{}", endpoint))
            .spawn(move || {
                let _ = tx.send(node.handle(msg, wait));
            });
        match spawned {
            Ok(_) => pending,
            Err(e) => PendingCall::ready(endpoint, Err(e.into())),
        }
    }
}
