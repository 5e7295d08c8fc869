//! Replication links
//!
//! Creating a link goes through three checked stages, each a distinct type:
//! [`LinkRequest`] is what the operator asked for, [`ValidatedLink`] has its
//! arguments checked, [`CheckedLink`] has both ends inspected. Only a
//! `CheckedLink` can be created.
//!
//! Removing a link drains the remote end first: it is made read-only, its
//! pending changes are pushed, and its DNA ranges are handed to a survivor.

use std::path::PathBuf;

use serde::Serialize;

use crate::agreement::cacert::{self, CaCertificate};
use crate::agreement::{self, AgreementAuth, AgreementKind, WinsyncSettings};
use crate::cluster::{ClusterContext, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Dn, Layout, Modification, Scope};
use crate::error::{Error, Result};
use crate::range::{self, IdRange, RangeKind};
use crate::state::MastersRegistry;

use super::ensure_unmanaged;

/// Winsync arguments as given on the command line
#[derive(Clone, Default)]
pub struct WinsyncOptions {
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub cacert: Option<PathBuf>,
    pub passsync: Option<String>,
    pub subtree: Option<String>,
}

impl std::fmt::Debug for WinsyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinsyncOptions")
            .field("bind_dn", &self.bind_dn)
            .field("cacert", &self.cacert)
            .field("subtree", &self.subtree)
            .finish_non_exhaustive()
    }
}

/// A link the operator asked for
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub local: String,
    pub remote: String,
    /// `Some` for a winsync agreement
    pub winsync: Option<WinsyncOptions>,
}

#[derive(Debug, Clone)]
enum LinkPlan {
    Ipa,
    Winsync {
        settings: WinsyncSettings,
        cert: CaCertificate,
    },
}

/// A link whose arguments are complete
#[derive(Debug, Clone)]
pub struct ValidatedLink {
    local: String,
    remote: String,
    plan: LinkPlan,
}

/// A link whose ends were both inspected
#[derive(Debug, Clone)]
pub struct CheckedLink {
    local: String,
    remote: String,
    plan: LinkPlan,
}

/// A link that was created and initialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCreated {
    pub local: String,
    pub remote: String,
    pub kind: AgreementKind,
    pub init: WaitOutcome<()>,
}

impl LinkRequest {
    pub fn ipa(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            winsync: None,
        }
    }

    pub fn winsync(local: impl Into<String>, remote: impl Into<String>, options: WinsyncOptions) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            winsync: Some(options),
        }
    }

    /// Check the argument combination. Winsync links need every credential,
    /// a readable CA certificate and root privileges.
    pub fn validate(self, layout: &Layout, is_root: bool) -> Result<ValidatedLink> {
        let plan = match self.winsync {
            None => LinkPlan::Ipa,
            Some(options) => {
                let (Some(bind_dn), Some(bind_password), Some(cacert), Some(passsync)) =
                    (options.bind_dn, options.bind_password, options.cacert, options.passsync)
                else {
                    return Err(Error::MissingArguments(
                        "The arguments --binddn, --bindpw, --passsync and --cacert are required to create a winsync agreement"
                            .into(),
                    ));
                };
                if !is_root {
                    return Err(Error::InsufficientPrivilege(
                        "winsync agreements need to be created as root".into(),
                    ));
                }
                let cert = CaCertificate::load(&cacert)?;
                let subtree = options
                    .subtree
                    .unwrap_or_else(|| layout.default_win_subtree().to_string());
                LinkPlan::Winsync {
                    settings: WinsyncSettings {
                        remote: self.remote.clone(),
                        bind_dn,
                        bind_password,
                        passsync_password: passsync,
                        subtree,
                    },
                    cert,
                }
            }
        };
        Ok(ValidatedLink {
            local: self.local,
            remote: self.remote,
            plan,
        })
    }
}

pub(super) async fn has_entry(dir: &mut dyn Directory, dn: &Dn) -> Result<bool> {
    match dir.get_entry(dn).await {
        Ok(_) => Ok(true),
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Both masters entries present in one node's registry
async fn knows_both(dir: &mut dyn Directory, layout: &Layout, a: &str, b: &str) -> Result<bool> {
    Ok(has_entry(dir, &layout.master(a)).await? && has_entry(dir, &layout.master(b)).await?)
}

impl ValidatedLink {
    /// Refuse duplicates and links to hosts the registry does not know
    pub async fn check_peer(self, ctx: &ClusterContext) -> Result<CheckedLink> {
        ctx.ensure_resolvable(&self.local).await?;
        ctx.ensure_resolvable(&self.remote).await?;

        let mut dir = ctx.open(&self.local).await?;
        let result = self.check_on(ctx, dir.as_mut()).await;
        dir.unbind().await;
        result?;

        Ok(CheckedLink {
            local: self.local,
            remote: self.remote,
            plan: self.plan,
        })
    }

    async fn check_on(&self, ctx: &ClusterContext, local: &mut dyn Directory) -> Result<()> {
        let layout = ctx.layout();
        if matches!(self.plan, LinkPlan::Ipa) {
            ensure_unmanaged(local, layout, "Creation of IPA replication agreement").await?;
        }

        if let Some(existing) = agreement::get(local, layout, &self.remote).await? {
            return Err(Error::DuplicateAgreement(match existing.kind {
                AgreementKind::Winsync { subtree } => {
                    format!("winsync agreement already exists on subtree {}", subtree)
                }
                AgreementKind::Ipa => format!("A replication agreement to {} already exists", self.remote),
            }));
        }

        if matches!(self.plan, LinkPlan::Winsync { .. }) {
            return Ok(());
        }

        let local_ok = knows_both(local, layout, &self.local, &self.remote).await?;
        let mut remote = ctx
            .open(&self.remote)
            .await
            .map_err(|_| Error::ZombieHost(format!("Connection to {} unsuccessful.", self.remote)))?;
        let result = async {
            if local_ok && knows_both(remote.as_mut(), layout, &self.local, &self.remote).await? {
                return Ok(());
            }
            // One side lost its masters entry: the peer was deleted before
            // or never joined this deployment
            let ipa = match remote.search(&layout.masters(), Scope::OneLevel, None).await {
                Ok(_) => true,
                Err(Error::NotFound(_)) => false,
                Err(e) => return Err(e),
            };
            Err(Error::ZombieHost(if ipa {
                format!(
                    "Connection unsuccessful: {} is an IPA Server, but it might be unknown, foreign or previously deleted one.",
                    self.remote
                )
            } else {
                format!("Connection unsuccessful: {} is not an IPA Server.", self.remote)
            }))
        }
        .await;
        remote.unbind().await;
        result
    }
}

impl CheckedLink {
    /// Create the agreement(s) and run the first total update
    pub async fn create(self, ctx: &ClusterContext) -> Result<LinkCreated> {
        match &self.plan {
            LinkPlan::Ipa => self.create_ipa(ctx).await,
            LinkPlan::Winsync { settings, cert } => self.create_winsync(ctx, settings, cert).await,
        }
    }

    async fn create_ipa(&self, ctx: &ClusterContext) -> Result<LinkCreated> {
        let layout = ctx.layout();
        let mut local = ctx.open(&self.local).await?;
        let created = agreement::create_ipa(
            local.as_mut(),
            layout,
            Suffix::Domain,
            &self.remote,
            &AgreementAuth::Gssapi,
        )
        .await;
        local.unbind().await;
        created?;

        let mut remote = ctx.open(&self.remote).await?;
        let init = async {
            let dn = agreement::create_ipa(
                remote.as_mut(),
                layout,
                Suffix::Domain,
                &self.local,
                &AgreementAuth::Gssapi,
            )
            .await?;
            agreement::initialize(remote.as_mut(), &dn).await?;
            agreement::wait_for_init(ctx, remote.as_mut(), &dn).await
        }
        .await;
        remote.unbind().await;

        Ok(LinkCreated {
            local: self.local.clone(),
            remote: self.remote.clone(),
            kind: AgreementKind::Ipa,
            init: init?,
        })
    }

    async fn create_winsync(
        &self,
        ctx: &ClusterContext,
        settings: &WinsyncSettings,
        cert: &CaCertificate,
    ) -> Result<LinkCreated> {
        let layout = ctx.layout();
        let mut local = ctx.open(&self.local).await?;
        let init = async {
            cacert::import(local.as_mut(), layout, cert).await?;
            ctx.confirm().notice(&format!(
                "Added CA certificate {} to certificate database for {}",
                cert.path, self.local
            ));
            let dn = agreement::create_winsync(local.as_mut(), layout, settings).await?;
            agreement::initialize(local.as_mut(), &dn).await?;
            agreement::wait_for_init(ctx, local.as_mut(), &dn).await
        }
        .await;
        local.unbind().await;

        Ok(LinkCreated {
            local: self.local.clone(),
            remote: self.remote.clone(),
            kind: AgreementKind::Winsync {
                subtree: settings.subtree.clone(),
            },
            init: init?,
        })
    }
}

/// `connect`: validate, inspect and create in one go
pub async fn add_link(ctx: &ClusterContext, request: LinkRequest, is_root: bool) -> Result<LinkCreated> {
    request
        .validate(ctx.layout(), is_root)?
        .check_peer(ctx)
        .await?
        .create(ctx)
        .await
}

/// A DNA range rescued from a drained node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedRange {
    pub kind: RangeKind,
    pub range: IdRange,
    /// Master now holding it as on-deck range; `None` when it was lost
    pub kept_by: Option<String>,
}

/// What removing a link did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRemoval {
    pub from: String,
    pub to: String,
    pub kind: AgreementKind,
    pub saved_ranges: Vec<SavedRange>,
    /// Why `to` could not be drained when the removal was forced
    pub forced: Option<String>,
    /// Winsync shared info that could not be deleted
    pub shared_info_error: Option<String>,
}

/// Toggle the backend read-only flag
pub async fn set_readonly(dir: &mut dyn Directory, layout: &Layout, readonly: bool) -> Result<()> {
    let value = if readonly { "on" } else { "off" };
    dir.modify(&layout.userroot_backend(), vec![Modification::replace("nsslapd-readonly", value)])
        .await?;
    tracing::debug!("Backend of {} read-only: {}", dir.host(), value);
    Ok(())
}

async fn flush_and_save_ranges(
    ctx: &ClusterContext,
    peer: &mut dyn Directory,
    registry: &MastersRegistry,
    towards: &str,
    ranges_rescued: &mut bool,
) -> Result<Vec<SavedRange>> {
    let layout = ctx.layout();
    let pushed = agreement::force_sync(peer, layout, towards).await?;
    match agreement::wait_for_update(ctx, peer, &pushed.dn).await? {
        WaitOutcome::Finished(()) => {}
        other => tracing::warn!("Pending changes of {} may not be flushed: {:?}", peer.host(), other),
    }

    // A node drained once per peer hands its ranges over only the first time
    if *ranges_rescued {
        tracing::debug!("DNA ranges of {} already saved", peer.host());
        return Ok(Vec::new());
    }
    let mut freed_ranges = Vec::new();
    for kind in [RangeKind::Current, RangeKind::OnDeck] {
        if let Some(freed) = range::read(peer, layout, kind).await? {
            freed_ranges.push((kind, freed));
        }
    }
    *ranges_rescued = true;

    let mut saved = Vec::new();
    for (kind, freed) in freed_ranges {
        let kept_by = range::redistribute(ctx, registry, freed, peer.host()).await?;
        saved.push(SavedRange {
            kind,
            range: freed,
            kept_by,
        });
    }
    Ok(saved)
}

/// Drain `peer` and drop its agreement towards `towards`. The read-only flag
/// is lifted on every path.
async fn drain_peer(
    ctx: &ClusterContext,
    peer: &mut dyn Directory,
    registry: &MastersRegistry,
    towards: &str,
    ranges_rescued: &mut bool,
) -> Result<Vec<SavedRange>> {
    let layout = ctx.layout();
    set_readonly(peer, layout, true).await?;
    let saved = flush_and_save_ranges(ctx, peer, registry, towards, ranges_rescued).await;
    let restored = set_readonly(peer, layout, false).await;
    let saved = saved?;
    restored?;

    agreement::delete(peer, layout, towards).await?;
    agreement::delete_referral(peer, layout, towards).await?;
    Ok(saved)
}

/// Remove the link between `from` and `to`, draining `to` first.
///
/// Without `force`, removing the last IPA agreement of either end is refused
/// and any failure on `to` stops the removal. With `force` the local half is
/// removed regardless and `to`'s ranges may be lost.
pub async fn remove_link(ctx: &ClusterContext, from: &str, to: &str, force: bool) -> Result<LinkRemoval> {
    let mut ranges_rescued = false;
    remove_link_with(ctx, from, to, force, &mut ranges_rescued).await
}

/// [`remove_link`] for one of several links towards the same `to`. The DNA
/// ranges of `to` are redistributed only while `ranges_rescued` is unset,
/// and it is set once they have been.
pub(crate) async fn remove_link_with(
    ctx: &ClusterContext,
    from: &str,
    to: &str,
    force: bool,
    ranges_rescued: &mut bool,
) -> Result<LinkRemoval> {
    let mut dir = ctx.open(from).await?;
    let result = remove_link_on(ctx, dir.as_mut(), to, force, ranges_rescued).await;
    dir.unbind().await;
    result
}

async fn remove_link_on(
    ctx: &ClusterContext,
    dir: &mut dyn Directory,
    to: &str,
    force: bool,
    ranges_rescued: &mut bool,
) -> Result<LinkRemoval> {
    let layout = ctx.layout();
    let from = dir.host().to_string();
    let kind = match agreement::classify(dir, layout, to).await {
        Ok(kind) => kind,
        Err(Error::NotFound(_)) => {
            ensure_unmanaged(dir, layout, "Removal of IPA replication agreement").await?;
            return Err(Error::NoAgreement {
                node: from,
                remote: to.to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    let mut removal = LinkRemoval {
        from: from.clone(),
        to: to.to_string(),
        kind: kind.clone(),
        saved_ranges: Vec::new(),
        forced: None,
        shared_info_error: None,
    };

    if kind == AgreementKind::Ipa {
        ensure_unmanaged(dir, layout, "Removal of IPA replication agreement").await?;
        if !force && agreement::find_ipa(dir, layout).await?.len() <= 1 {
            return Err(Error::LastAgreement { host: from });
        }

        let registry = MastersRegistry::read(dir, layout).await?;
        match ctx.open(to).await {
            Ok(mut peer) => {
                let drained =
                    drain_remote(ctx, peer.as_mut(), &registry, &from, force, ranges_rescued).await;
                peer.unbind().await;
                match drained? {
                    Ok(saved) => removal.saved_ranges = saved,
                    Err(reason) => removal.forced = Some(reason),
                }
            }
            Err(e) if force => {
                tracing::warn!("Cannot drain {}: {}", to, e);
                removal.forced = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        if removal.forced.is_some() {
            ctx.confirm().notice(&format!("Forcing removal on '{}'", from));
            ctx.confirm()
                .notice(&format!("Any DNA range on '{}' will be lost", to));
        }
    }

    agreement::delete(dir, layout, to).await?;
    agreement::delete_referral(dir, layout, to).await?;

    if kind.is_winsync() {
        match dir.delete_subtree(&layout.replica_info(to)).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => {
                ctx.confirm()
                    .notice(&format!("Error deleting winsync replica shared info: {}", e));
                removal.shared_info_error = Some(e.to_string());
            }
        }
    }
    tracing::info!("Deleted replication agreement from '{}' to '{}'", from, to);
    Ok(removal)
}

/// Checks and drain on the remote end. The outer error stops the removal,
/// the inner one is a failure the caller forces past.
async fn drain_remote(
    ctx: &ClusterContext,
    peer: &mut dyn Directory,
    registry: &MastersRegistry,
    from: &str,
    force: bool,
    ranges_rescued: &mut bool,
) -> Result<std::result::Result<Vec<SavedRange>, String>> {
    let layout = ctx.layout();
    let to = peer.host().to_string();
    if !force {
        let agreements = agreement::find_ipa(peer, layout).await?;
        if !agreements.iter().any(|a| a.points_to(from)) {
            return Err(Error::NoAgreement {
                node: to,
                remote: from.to_string(),
            });
        }
        if agreements.len() <= 1 {
            return Err(Error::LastAgreement { host: to });
        }
    }

    match drain_peer(ctx, peer, registry, from, ranges_rescued).await {
        Ok(saved) => Ok(Ok(saved)),
        Err(e) => {
            ctx.confirm()
                .notice(&format!("Unable to remove agreement on {}: {}", to, e));
            if force {
                Ok(Err(e.to_string()))
            } else {
                Err(Error::AgreementRemoval {
                    host: to,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// `disconnect`: resolve both ends, then remove the link
pub async fn disconnect(ctx: &ClusterContext, from: &str, to: &str, force: bool) -> Result<LinkRemoval> {
    ctx.ensure_resolvable(from).await?;
    ctx.ensure_resolvable(to).await?;
    remove_link(ctx, from, to, force).await
}
