//! Replicated, versioned parameter store.
//!
//! - [`ParamRoot`]: authoritative copy of every tag, assigns ids, counts and
//!   epochs, fans mutations out
//! - [`ReplicaNode`]: ring of shared segments per tag, serves pulls
//! - [`RouteTree`]: K-ary broadcast tree over the replicas
//! - [`Transport`]: seam the broadcasts travel through
//! - [`ParamClient`]: maps a replica's segments and copies values out
//!
//! ```text
//!  learner ──push──► ParamRoot ──Broadcast──► replica ──► replica ...
//!                                               │
//!                     actor ◄──ParamClient──────┘ (shared segment)
//! ```

pub mod client;
pub mod config;
pub mod local;
pub mod lock_table;
pub mod meta;
pub mod persistence;
pub mod replica;
pub mod root;
pub mod routing;
pub mod transport;

pub use client::ParamClient;
pub use config::StoreConfig;
pub use local::LocalCluster;
pub use lock_table::LockTable;
pub use meta::{Overrides, ParamMeta};
pub use persistence::snapshot_dir;
pub use replica::{PullRef, ReplicaNode, MAX_TOMBSTONES};
pub use root::ParamRoot;
pub use routing::RouteTree;
pub use transport::{Broadcast, InProcessTransport, PendingCall, Transport};
