//! Topology Editor
//!
//! Multi-node operations on the replication graph. Each operation opens its
//! own sessions, visits nodes one at a time and unbinds every session before
//! returning.

pub mod link;
pub mod node;
pub mod orphan;
pub mod services;

pub use link::{add_link, disconnect, remove_link, LinkCreated, LinkRemoval, LinkRequest, SavedRange, WinsyncOptions};
pub use node::{remove_node, NodeRemoval, RemovalReport, RidCleanup};
pub use orphan::{check_last_link, ReplicationGraph};
pub use services::{ensure_last_services, ServiceCheck};

use chrono::Utc;

use crate::agreement::{self, Agreement, AgreementKind};
use crate::cluster::{ClusterContext, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Entry, Layout, Modification};
use crate::error::{Error, Result};
use crate::ruv::task::{wait_for_task, TaskResult};
use crate::state::{self, Peer, PeerKind};

/// Refuse `what` when the deployment manages its topology itself
pub async fn ensure_unmanaged(dir: &mut dyn Directory, layout: &Layout, what: &'static str) -> Result<()> {
    if state::domain_level(dir, layout).await? >= 1 {
        return Err(Error::ManagedTopology(what));
    }
    Ok(())
}

/// Result of `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// Masters and winsync peers
    Peers(Vec<Peer>),
    /// Agreements held by one peer (by the synchronising master for winsync)
    Agreements { host: String, agreements: Vec<Agreement> },
    /// The requested peer is not in the public server list
    UnknownPeer(String),
}

/// List the servers, or the agreements of one of them
pub async fn list(ctx: &ClusterContext, host: &str, replica: Option<&str>) -> Result<Listing> {
    ctx.ensure_resolvable(host).await?;
    if let Some(replica) = replica {
        ctx.ensure_resolvable(replica).await?;
    }

    let mut dir = ctx.open(host).await?;
    let peers = state::read_peers(dir.as_mut(), ctx.layout()).await;
    dir.unbind().await;
    let peers = peers?;

    let Some(replica) = replica else {
        return Ok(Listing::Peers(peers));
    };
    let Some(peer) = peers.iter().find(|p| p.name.eq_ignore_ascii_case(replica)) else {
        return Ok(Listing::UnknownPeer(replica.to_string()));
    };

    let agreements = match &peer.kind {
        PeerKind::Winsync { via } => {
            let mut dir = ctx.open(via).await?;
            let found = agreement::get(dir.as_mut(), ctx.layout(), &peer.name).await;
            dir.unbind().await;
            found?.into_iter().filter(|a| a.kind.is_winsync()).collect()
        }
        PeerKind::Master => {
            let mut dir = ctx.open(&peer.name).await?;
            let found = agreement::find_in(dir.as_mut(), ctx.layout(), Suffix::Domain).await;
            dir.unbind().await;
            found?
        }
    };
    Ok(Listing::Agreements {
        host: peer.name.clone(),
        agreements,
    })
}

/// What `re-initialize` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reinitialization {
    pub kind: AgreementKind,
    pub init: WaitOutcome<()>,
    /// memberOf fixup run because the agreement skips memberOf on total updates
    pub memberof: Option<WaitOutcome<TaskResult>>,
}

/// Start a memberOf fixup task over the whole domain and wait for it
pub async fn run_memberof_fixup(ctx: &ClusterContext, dir: &mut dyn Directory) -> Result<WaitOutcome<TaskResult>> {
    let name = format!("memberof_fixup_{}", Utc::now().format("%Y%m%d%H%M%S"));
    let dn = ctx.layout().memberof_task(&name);
    let task = Entry::new(dn.clone())
        .with("objectClass", ["top", "extensibleObject"])
        .with("cn", [name.as_str()])
        .with("basedn", [ctx.layout().basedn().as_str()])
        .with("filter", ["(objectclass=*)"])
        .with("ttl", ["10"]);
    dir.add_entry(task).await?;
    tracing::info!("Started memberOf fixup task {} on {}", name, dir.host());
    wait_for_task(ctx, dir, &dn).await
}

/// Re-run the total update of `this` from `from`
pub async fn reinitialize(ctx: &ClusterContext, this: &str, from: &str) -> Result<Reinitialization> {
    ctx.ensure_resolvable(this).await?;
    ctx.ensure_resolvable(from).await?;

    let mut dir = ctx.open(this).await?;
    let result = reinitialize_on(ctx, dir.as_mut(), from).await;
    dir.unbind().await;
    result
}

async fn reinitialize_on(ctx: &ClusterContext, dir: &mut dyn Directory, from: &str) -> Result<Reinitialization> {
    let layout = ctx.layout();
    let local = agreement::require(dir, layout, from).await?;

    if local.kind.is_winsync() {
        // Winsync has no remote half; the local agreement pushes
        agreement::initialize(dir, &local.dn).await?;
        let init = agreement::wait_for_init(ctx, dir, &local.dn).await?;
        return Ok(Reinitialization {
            kind: local.kind,
            init,
            memberof: None,
        });
    }

    let this = dir.host().to_string();
    let mut remote = ctx.open(from).await?;
    let pushed = async {
        let incoming = agreement::require(remote.as_mut(), layout, &this).await?;
        agreement::enable(dir, layout, from).await?;
        agreement::enable(remote.as_mut(), layout, &this).await?;
        agreement::force_sync(remote.as_mut(), layout, &this).await?;
        agreement::initialize(remote.as_mut(), &incoming.dn).await?;
        let init = agreement::wait_for_init(ctx, remote.as_mut(), &incoming.dn).await?;
        Ok::<_, Error>((incoming, init))
    }
    .await;
    remote.unbind().await;
    let (incoming, init) = pushed?;

    let memberof = if incoming.has_total_attr_list {
        None
    } else {
        Some(run_memberof_fixup(ctx, dir).await?)
    };
    Ok(Reinitialization {
        kind: AgreementKind::Ipa,
        init,
        memberof,
    })
}

async fn set_ignore_time_skew(dir: &mut dyn Directory, layout: &Layout, ignore: bool) -> Result<()> {
    let value = if ignore { "on" } else { "off" };
    dir.modify(&layout.config(), vec![Modification::replace("nsslapd-ignore-time-skew", value)])
        .await?;
    tracing::debug!("nsslapd-ignore-time-skew on {}: {}", dir.host(), value);
    Ok(())
}

/// What `force-sync` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedSync {
    pub kind: AgreementKind,
    /// `None` for winsync, which is not waited on
    pub init: Option<WaitOutcome<()>>,
}

/// Make `from` push its pending changes to `this` now
pub async fn force_sync(ctx: &ClusterContext, this: &str, from: &str) -> Result<ForcedSync> {
    ctx.ensure_resolvable(this).await?;
    ctx.ensure_resolvable(from).await?;

    let mut dir = ctx.open(this).await?;
    let result = force_sync_on(ctx, dir.as_mut(), from).await;
    dir.unbind().await;
    result
}

async fn force_sync_on(ctx: &ClusterContext, dir: &mut dyn Directory, from: &str) -> Result<ForcedSync> {
    let layout = ctx.layout();
    let local = agreement::require(dir, layout, from).await?;
    if local.kind.is_winsync() {
        agreement::force_sync(dir, layout, from).await?;
        return Ok(ForcedSync {
            kind: local.kind,
            init: None,
        });
    }

    let this = dir.host().to_string();
    set_ignore_time_skew(dir, layout, true).await?;
    let pushed = async {
        let mut remote = ctx.open(from).await?;
        let result = async {
            let incoming = agreement::force_sync(remote.as_mut(), layout, &this).await?;
            agreement::wait_for_init(ctx, remote.as_mut(), &incoming.dn).await
        }
        .await;
        remote.unbind().await;
        result
    }
    .await;
    let restored = set_ignore_time_skew(dir, layout, false).await;
    let init = pushed?;
    restored?;

    Ok(ForcedSync {
        kind: AgreementKind::Ipa,
        init: Some(init),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing;
    use crate::directory::{ClusterBuilder, MemoryCluster, WriteOp};

    const BASE: &str = "dc=example,dc=com";

    async fn pair() -> MemoryCluster {
        ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .link("a.example.com", "b.example.com")
            .winsync("a.example.com", "ad.example.net", "cn=Users,dc=example,dc=net")
            .build()
            .await
    }

    #[tokio::test]
    async fn test_list() {
        let cluster = pair().await;
        let (ctx, _) = testing::context(&cluster, true);

        let Listing::Peers(peers) = list(&ctx, "a.example.com", None).await.unwrap() else {
            panic!("expected peers");
        };
        assert_eq!(peers.len(), 3);
        assert_eq!(peers[2].kind.to_string(), "winsync");

        let Listing::Agreements { agreements, .. } =
            list(&ctx, "a.example.com", Some("b.example.com")).await.unwrap()
        else {
            panic!("expected agreements");
        };
        assert_eq!(agreements.len(), 1);
        assert!(agreements[0].points_to("a.example.com"));

        let Listing::Agreements { agreements, .. } =
            list(&ctx, "b.example.com", Some("ad.example.net")).await.unwrap()
        else {
            panic!("expected agreements");
        };
        assert_eq!(agreements.len(), 1);
        assert!(agreements[0].kind.is_winsync());

        assert_eq!(
            list(&ctx, "a.example.com", Some("x.example.com")).await.unwrap(),
            Listing::UnknownPeer("x.example.com".into())
        );
    }

    #[tokio::test]
    async fn test_reinitialize() {
        let cluster = pair().await;
        let (ctx, _) = testing::context(&cluster, true);

        let done = reinitialize(&ctx, "a.example.com", "b.example.com").await.unwrap();
        assert_eq!(done.kind, AgreementKind::Ipa);
        assert_eq!(done.init, WaitOutcome::Finished(()));
        assert_eq!(done.memberof, None);

        // An agreement that skips memberOf on total updates needs a fixup
        let incoming = ctx.layout().agreement(Suffix::Domain, "a.example.com");
        let mut entry = cluster.entry("b.example.com", &incoming).await.unwrap();
        entry.remove("nsDS5ReplicatedAttributeListTotal");
        cluster.put_entry("b.example.com", entry).await;

        let done = reinitialize(&ctx, "a.example.com", "b.example.com").await.unwrap();
        assert!(matches!(done.memberof, Some(WaitOutcome::Finished(ref r)) if r.succeeded()));

        let done = reinitialize(&ctx, "a.example.com", "ad.example.net").await.unwrap();
        assert!(done.kind.is_winsync());
    }

    #[tokio::test]
    async fn test_reinitialize_without_agreement() {
        let cluster = pair().await;
        let (ctx, _) = testing::context(&cluster, true);
        let err = reinitialize(&ctx, "b.example.com", "ad.example.net").await.unwrap_err();
        assert!(matches!(err, Error::NoAgreement { .. }));
    }

    #[tokio::test]
    async fn test_force_sync_restores_time_skew() {
        let cluster = pair().await;
        let (ctx, _) = testing::context(&cluster, true);
        let config = ctx.layout().config();

        let synced = force_sync(&ctx, "a.example.com", "b.example.com").await.unwrap();
        assert_eq!(synced.init, Some(WaitOutcome::Finished(())));
        let entry = cluster.entry("a.example.com", &config).await.unwrap();
        assert_eq!(entry.first("nsslapd-ignore-time-skew"), Some("off"));

        let toggles = cluster
            .writes()
            .await
            .into_iter()
            .filter(|w| w.op == WriteOp::Modify && w.dn == config)
            .count();
        assert_eq!(toggles, 2);

        // Restored even when the remote is down
        cluster.set_offline("b.example.com", true).await;
        assert!(force_sync(&ctx, "a.example.com", "b.example.com").await.is_err());
        let entry = cluster.entry("a.example.com", &config).await.unwrap();
        assert_eq!(entry.first("nsslapd-ignore-time-skew"), Some("off"));

        let synced = force_sync(&ctx, "a.example.com", "ad.example.net").await.unwrap();
        assert_eq!(synced.init, None);
    }
}
