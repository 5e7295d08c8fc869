//! Node removal
//!
//! Deleting a master runs, in order: the orphan check, the service
//! continuity check, removal of every link towards it, CLEANALLRUV for its
//! replica ids and finally removal of its registry and DNS entries. Steps
//! after the checks keep going when one peer fails; failures are reported.

use serde::Serialize;

use crate::agreement::{self, AgreementKind};
use crate::cluster::{ClusterContext, PeerOutcome, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Dn, Filter, Layout, Modification, Scope};
use crate::error::{Error, Result};
use crate::ruv::{self, task::TaskResult};
use crate::state::MastersRegistry;

use super::link::{remove_link_with, LinkRemoval};
use super::orphan::check_last_link;
use super::services::{ensure_last_services, ServiceCheck};
use super::ensure_unmanaged;

/// CLEANALLRUV run for one replica id of the removed node
#[derive(Debug)]
pub struct RidCleanup {
    pub suffix: Suffix,
    pub rid: u16,
    pub result: Result<WaitOutcome<TaskResult>>,
}

/// Everything a node removal did
#[derive(Debug)]
pub struct RemovalReport {
    pub host: String,
    pub kind: AgreementKind,
    /// Peers whose link towards the node was removed
    pub peers: Vec<String>,
    /// The node was unreachable and removed anyway
    pub forced: bool,
    /// `None` when the checks were skipped
    pub services: Option<ServiceCheck>,
    pub links: Vec<PeerOutcome<LinkRemoval>>,
    pub cleaned: Vec<RidCleanup>,
    pub cleanup_error: Option<String>,
    pub dns_error: Option<String>,
}

/// Result of `del`
#[derive(Debug)]
pub enum NodeRemoval {
    /// A ghost master without agreements had its entries removed
    Cleaned { host: String },
    Removed(RemovalReport),
}

/// What [`replica_cleanup`] deleted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub master_entries: usize,
    pub dna_entries: usize,
    pub bind_dns: usize,
}

/// Remove the entries a master leaves behind in the shared tree and on the
/// local replica configuration. Missing entries are skipped.
pub async fn replica_cleanup(dir: &mut dyn Directory, layout: &Layout, host: &str) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary::default();

    let master = layout.master(host);
    match dir.search(&master, Scope::Subtree, None).await {
        Ok(entries) => {
            summary.master_entries = entries.len();
            dir.delete_subtree(&master).await?;
        }
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    if let Ok(config) = dir.get_entry(&layout.dna_config()).await {
        if let Some(shared) = config.first("dnaSharedCfgDN") {
            let filter = Filter::eq("dnaHostname", host);
            let entries = dir
                .search_or_empty(&Dn::new(shared), Scope::OneLevel, Some(&filter))
                .await?;
            for entry in entries {
                dir.delete_entry(&entry.dn).await?;
                summary.dna_entries += 1;
            }
        }
    }

    match dir.delete_subtree(&layout.replica_info(host)).await {
        Ok(()) | Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let principal = layout.ldap_principal(host);
    for suffix in Suffix::all() {
        let replica = layout.replica(suffix);
        let entry = match dir.get_entry(&replica).await {
            Ok(entry) => entry,
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        let stale: Vec<String> = entry
            .values("nsDS5ReplicaBindDN")
            .iter()
            .filter(|v| Dn::new(v.as_str()) == principal)
            .cloned()
            .collect();
        for value in stale {
            dir.modify(&replica, vec![Modification::delete_value("nsDS5ReplicaBindDN", value)])
                .await?;
            summary.bind_dns += 1;
        }
    }
    tracing::info!("Removed replica entries of {} from {}: {:?}", host, dir.host(), summary);
    Ok(summary)
}

/// Drop a master's SRV targets and host records from every DNS zone.
/// Returns the number of values and entries removed.
pub async fn cleanup_dns(dir: &mut dyn Directory, layout: &Layout, host: &str) -> Result<usize> {
    let zones = dir
        .search_or_empty(&layout.dns(), Scope::OneLevel, Some(&Filter::object_class("idnsZone")))
        .await?;
    let target = host.trim_end_matches('.').to_lowercase();
    let mut removed = 0;

    for zone in zones {
        let records = dir
            .search_or_empty(&zone.dn, Scope::OneLevel, Some(&Filter::present("sRVRecord")))
            .await?;
        for record in records {
            for value in record.values("sRVRecord") {
                let points_here = value
                    .split_whitespace()
                    .last()
                    .map(|t| t.trim_end_matches('.').eq_ignore_ascii_case(&target))
                    .unwrap_or(false);
                if points_here {
                    dir.modify(&record.dn, vec![Modification::delete_value("sRVRecord", value.as_str())])
                        .await?;
                    removed += 1;
                }
            }
        }

        let Some(name) = zone.first("idnsName") else { continue };
        let suffix = format!(".{}", name.trim_end_matches('.').to_lowercase());
        if let Some(label) = target.strip_suffix(&suffix) {
            match dir.delete_entry(&zone.dn.child("idnsname", label)).await {
                Ok(()) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    tracing::debug!("Removed {} DNS records of {}", removed, host);
    Ok(removed)
}

/// Replica ids `host` owns in the update vectors seen by `dir`
async fn rids_of(dir: &mut dyn Directory, layout: &Layout, host: &str) -> Result<Vec<(Suffix, u16)>> {
    let mut rids = Vec::new();
    if let Some(rid) = ruv::rid_for_host(dir, layout, host).await? {
        rids.push((Suffix::Domain, rid));
    }
    match ruv::collect(dir, layout, Suffix::Ca).await {
        Ok(elements) => {
            if let Some(element) = elements.iter().find(|e| e.host().eq_ignore_ascii_case(host)) {
                rids.push((Suffix::Ca, element.rid));
            }
        }
        Err(Error::NoRuvsFound) => {}
        Err(e) => return Err(e),
    }
    Ok(rids)
}

/// Delete master `removing` from the deployment, working from `this`
pub async fn remove_node(
    ctx: &ClusterContext,
    this: &str,
    removing: &str,
    force: bool,
    cleanup: bool,
) -> Result<NodeRemoval> {
    if this.eq_ignore_ascii_case(removing) {
        return Err(Error::SelfRemoval(this.to_string()));
    }
    ctx.ensure_resolvable(this).await?;

    let mut dir = ctx.open(this).await?;
    let result = remove_from(ctx, dir.as_mut(), removing, force, cleanup).await;
    dir.unbind().await;
    result
}

async fn remove_from(
    ctx: &ClusterContext,
    dir: &mut dyn Directory,
    removing: &str,
    force: bool,
    cleanup: bool,
) -> Result<NodeRemoval> {
    let layout = ctx.layout();
    let this = dir.host().to_string();
    ensure_unmanaged(dir, layout, "Removal of IPA master").await?;

    let Some(found) = agreement::get(dir, layout, removing).await? else {
        if !cleanup {
            return Err(Error::NoAgreement {
                node: this,
                remote: removing.to_string(),
            });
        }
        // Always asked: cleaning is irreversible even when forced
        ctx.confirm().notice("Cleaning a master is irreversible.");
        ctx.confirm()
            .notice("This should not normally be require, so use cautiously.");
        ctx.confirm().require("Continue to clean master?")?;
        replica_cleanup(dir, layout, removing).await?;
        return Ok(NodeRemoval::Cleaned {
            host: removing.to_string(),
        });
    };

    let mut report = RemovalReport {
        host: removing.to_string(),
        kind: found.kind.clone(),
        peers: Vec::new(),
        forced: false,
        services: None,
        links: Vec::new(),
        cleaned: Vec::new(),
        cleanup_error: None,
        dns_error: None,
    };

    if report.kind.is_winsync() {
        report.peers = vec![this.clone()];
        ctx.confirm()
            .notice("Skipping calculation to determine if one or more masters would be orphaned.");
    } else {
        let registry = MastersRegistry::read(dir, layout).await?;
        let mut removed_dir = match ctx.open(removing).await {
            Ok(removed_dir) => Some(removed_dir),
            Err(e) if force => {
                ctx.confirm()
                    .notice(&format!("Connection to '{}' failed: {}", removing, e));
                ctx.confirm().notice(&format!("Forcing removal of {}", removing));
                report.forced = true;
                None
            }
            Err(e) => {
                return Err(Error::ReplicaUnreachable {
                    host: removing.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let checks = match removed_dir.as_mut() {
            Some(removed) => check_removable(ctx, dir, removed.as_mut(), &registry, force).await,
            None => Ok(registry
                .others(removing)
                .map(|m| m.host.clone())
                .collect()),
        };
        if let Some(mut removed) = removed_dir {
            removed.unbind().await;
        }
        report.peers = checks?;

        report.services = Some(ensure_last_services(ctx, dir, &registry, removing, &this, force).await?);
    }

    let rids = if report.kind.is_winsync() {
        Vec::new()
    } else {
        rids_of(dir, layout, removing).await?
    };

    ctx.confirm().notice(&format!(
        "Deleting replication agreements between {} and {}",
        removing,
        report.peers.join(", ")
    ));
    let mut ranges_rescued = false;
    for peer in &report.peers {
        let removal = remove_link_with(ctx, peer, removing, true, &mut ranges_rescued).await;
        if let Err(e) = &removal {
            tracing::warn!("Unable to remove replication agreement for {} from {}: {}", removing, peer, e);
        }
        report.links.push(PeerOutcome::new(peer.as_str(), removal));
    }

    for (suffix, rid) in rids {
        let result = ruv::task::run_clean_task(ctx, &this, suffix, rid).await;
        report.cleaned.push(RidCleanup { suffix, rid, result });
    }

    if let Err(e) = replica_cleanup(dir, layout, removing).await {
        tracing::warn!("Failed to cleanup {} entries: {}", removing, e);
        report.cleanup_error = Some(e.to_string());
    }
    if let Err(e) = cleanup_dns(dir, layout, removing).await {
        tracing::warn!("Failed to cleanup {} DNS entries: {}", removing, e);
        report.dns_error = Some(e.to_string());
    }
    Ok(report_done(report))
}

fn report_done(report: RemovalReport) -> NodeRemoval {
    tracing::info!(
        "Removed {} ({} links, {} replica ids cleaned)",
        report.host,
        report.links.iter().filter(|l| l.is_ok()).count(),
        report.cleaned.len()
    );
    NodeRemoval::Removed(report)
}

/// Confirmation and orphan check while the removed node is reachable.
/// Returns the peers it holds IPA agreements with.
async fn check_removable(
    ctx: &ClusterContext,
    this_dir: &mut dyn Directory,
    removed: &mut dyn Directory,
    registry: &MastersRegistry,
    force: bool,
) -> Result<Vec<String>> {
    let peers: Vec<String> = agreement::find_ipa(removed, ctx.layout())
        .await?
        .into_iter()
        .map(|a| a.remote)
        .collect();

    if !force {
        ctx.confirm().notice("Deleting a master is irreversible.");
        ctx.confirm()
            .notice("To reconnect to the remote master you will need to prepare a new replica file");
        ctx.confirm().notice("and re-install.");
        ctx.confirm().require("Continue to delete?")?;
    }

    // Two masters cannot orphan each other
    if registry.len() > 2 {
        if let Some(orphaned) = check_last_link(ctx, removed, force).await? {
            if !force {
                return Err(Error::WouldOrphan(orphaned));
            }
            tracing::warn!("Forced removal of {} orphans {}", removed.host(), orphaned);
            ctx.confirm()
                .notice(&format!("Deleting this server will orphan '{}'. Forcing removal.", orphaned));
        }
    } else {
        tracing::debug!("{} masters on {}, orphan check skipped", registry.len(), this_dir.host());
    }
    Ok(peers)
}
