//! State Module
//!
//! Read-only views of the deployment state shared by every node.

mod membership;

pub use membership::{
    domain_level, move_renewal_master, read_peers, read_winsync_peers, Master, MastersRegistry, Peer,
    PeerKind, ServiceRole, CA_RENEWAL_MASTER, DNSSEC_KEY_MASTER,
};
