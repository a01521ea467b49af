//! A whole parameter store wired together in one process.

use super::client::ParamClient;
use super::config::StoreConfig;
use super::replica::ReplicaNode;
use super::root::ParamRoot;
use super::transport::{InProcessTransport, Transport};
use crate::core::context::NodeContext;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Root, replicas and transport sharing one segment store.
///
/// Replicas get child contexts of `ctx` named by their ids.
pub struct LocalCluster {
    transport: Arc<InProcessTransport>,
    replicas: BTreeMap<String, Arc<ReplicaNode>>,
    root: ParamRoot,
}

impl LocalCluster {
    pub fn new<S: AsRef<str>>(ctx: NodeContext, replica_ids: &[S], config: StoreConfig) -> Result<Self> {
        let transport = Arc::new(InProcessTransport::new());
        let shared: Arc<dyn Transport> = transport.clone();

        let mut replicas = BTreeMap::new();
        for id in replica_ids.iter().map(AsRef::as_ref) {
            let node = Arc::new(ReplicaNode::new(ctx.child(id), config.clone(), Arc::clone(&shared))?);
            transport.register(&node);
            replicas.insert(id.to_string(), node);
        }
        let ids = replica_ids.iter().map(|id| id.as_ref().to_string()).collect();
        let root = ParamRoot::new(ctx, config, ids, shared)?;
        Ok(Self {
            transport,
            replicas,
            root,
        })
    }

    pub fn root(&self) -> &ParamRoot {
        &self.root
    }

    pub fn replica(&self, id: &str) -> Result<&Arc<ReplicaNode>> {
        self.replicas
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("replica '{}'", id)))
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Arc<ReplicaNode>> {
        self.replicas.values()
    }

    /// Client reading from replica `id`.
    pub fn client(&self, id: &str) -> Result<ParamClient> {
        let replica = Arc::clone(self.replica(id)?);
        let store = Arc::clone(replica.segments());
        Ok(ParamClient::new(replica, store))
    }

    pub fn transport(&self) -> &Arc<InProcessTransport> {
        &self.transport
    }

    /// Take replica `id` out of the cluster; it stops receiving broadcasts.
    pub fn remove_replica(&mut self, id: &str) -> Option<Arc<ReplicaNode>> {
        self.transport.deregister(id);
        self.replicas.remove(id)
    }
}
