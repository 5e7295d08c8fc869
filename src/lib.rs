//! replicactl - Replication topology manager for multi-master directory clusters
//!
//! Administers the replication layer of a cluster of directory servers: the
//! agreements that link masters, the replica update vectors (RUVs) they keep
//! about each other, and the DNA identifier ranges each master hands out.
//!
//! # Architecture
//!
//! Every operation works through a [`directory::Directory`] session opened by a
//! [`directory::Connector`]. Nodes are visited one at a time; sessions are
//! opened per sub-operation and unbound on every exit path.
//!
//! # Features
//!
//! - List masters, winsync peers and their agreements
//! - Connect and disconnect masters, including winsync agreements
//! - Remove a master without orphaning its neighbours or losing its DNA range
//! - Find and clean dangling RUVs left behind by removed masters
//! - Show and set DNA ranges with overlap checks across the deployment

pub mod agreement;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod prompt;
pub mod range;
pub mod ruv;
pub mod state;
pub mod topology;

pub use config::ReplicaCtlConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agreement::{Agreement, AgreementKind};
    pub use crate::cluster::{ClusterContext, PeerOutcome, WaitOutcome};
    pub use crate::config::ReplicaCtlConfig;
    pub use crate::directory::{Connector, Directory, Dn, Entry, Layout, LdapConnector, MemoryCluster};
    pub use crate::error::{Error, Result};
    pub use crate::range::{IdRange, RangeKind};
    pub use crate::state::{MastersRegistry, Peer, PeerKind};
}
