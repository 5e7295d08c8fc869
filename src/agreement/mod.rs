//! Replication Agreements
//!
//! An agreement is an entry below a suffix's replica configuration that
//! tells the node to push changes to one remote. IPA agreements come in
//! pairs, one on each end. Winsync agreements are one-directional towards an
//! Active Directory peer and carry the synchronised subtree.

pub mod cacert;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::cluster::{ClusterContext, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Dn, Entry, Filter, Layout, Modification, Scope};
use crate::error::{Error, Result};

/// Attribute only winsync agreements carry
pub const WINSYNC_SUBTREE_ATTR: &str = "nsds7WindowsReplicaSubtree";

/// Attributes never sent by incremental updates
const EXCLUDED_ATTRS: &str = "(objectclass=*) $ EXCLUDE memberof idnssoaserial entryusn \
krblastsuccessfulauth krblastfailedauth krbloginfailedcount";

/// Attributes never sent by total updates
const EXCLUDED_TOTAL_ATTRS: &str =
    "(objectclass=*) $ EXCLUDE entryusn krblastsuccessfulauth krblastfailedauth krbloginfailedcount";

/// Schedule that makes the server push pending changes immediately
const FORCE_SYNC_SCHEDULE: &str = "2358-2359 0";

/// Type of an agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AgreementKind {
    Ipa,
    Winsync { subtree: String },
}

impl AgreementKind {
    pub fn is_winsync(&self) -> bool {
        matches!(self, AgreementKind::Winsync { .. })
    }
}

impl std::fmt::Display for AgreementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgreementKind::Ipa => write!(f, "replica"),
            AgreementKind::Winsync { .. } => write!(f, "winsync"),
        }
    }
}

/// How the pushing end authenticates to the remote
#[derive(Clone, PartialEq, Eq)]
pub enum AgreementAuth {
    Gssapi,
    Simple { bind_dn: String, password: String },
}

impl std::fmt::Debug for AgreementAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgreementAuth::Gssapi => write!(f, "Gssapi"),
            AgreementAuth::Simple { bind_dn, .. } => f
                .debug_struct("Simple")
                .field("bind_dn", bind_dn)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// An agreement and its last known status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agreement {
    #[serde(skip)]
    pub dn: Dn,
    #[serde(skip)]
    pub suffix: Suffix,
    /// Host the agreement pushes to
    pub remote: String,
    pub kind: AgreementKind,
    pub enabled: bool,
    pub last_init_status: Option<String>,
    pub last_init_end: Option<DateTime<Utc>>,
    pub last_update_status: Option<String>,
    pub last_update_end: Option<DateTime<Utc>>,
    /// Total updates carry an attribute list (memberOf included)
    pub has_total_attr_list: bool,
}

impl Agreement {
    /// Build from an agreement entry. `None` when the entry names no remote.
    pub fn from_entry(entry: &Entry, suffix: Suffix) -> Option<Self> {
        let remote = entry.first("nsDS5ReplicaHost")?.to_string();
        let kind = match entry.first(WINSYNC_SUBTREE_ATTR) {
            Some(subtree) => AgreementKind::Winsync {
                subtree: subtree.to_string(),
            },
            None => AgreementKind::Ipa,
        };
        Some(Self {
            dn: entry.dn.clone(),
            suffix,
            remote,
            kind,
            enabled: !entry
                .first("nsds5ReplicaEnabled")
                .map(|v| v.eq_ignore_ascii_case("off"))
                .unwrap_or(false),
            last_init_status: entry.first("nsds5ReplicaLastInitStatus").map(str::to_string),
            last_init_end: entry.first("nsds5ReplicaLastInitEnd").and_then(parse_generalized_time),
            last_update_status: entry.first("nsds5ReplicaLastUpdateStatus").map(str::to_string),
            last_update_end: entry.first("nsds5ReplicaLastUpdateEnd").and_then(parse_generalized_time),
            has_total_attr_list: entry.has("nsDS5ReplicatedAttributeListTotal"),
        })
    }

    pub fn points_to(&self, host: &str) -> bool {
        self.remote.eq_ignore_ascii_case(host)
    }
}

/// Parse an LDAP generalized time such as `20240101000000Z`.
/// The all-zero stamp of a never-run update parses to `None`.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let digits = value.trim().trim_end_matches('Z');
    let digits = digits.split('.').next().unwrap_or(digits);
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn agreement_filter() -> Filter {
    Filter::Or(vec![
        Filter::object_class("nsds5replicationagreement"),
        Filter::object_class("nsDSWindowsReplicationAgreement"),
    ])
}

/// Agreements below one suffix's replica entry
pub async fn find_in(dir: &mut dyn Directory, layout: &Layout, suffix: Suffix) -> Result<Vec<Agreement>> {
    let entries = dir
        .search_or_empty(&layout.replica(suffix), Scope::OneLevel, Some(&agreement_filter()))
        .await?;
    Ok(entries
        .iter()
        .filter_map(|entry| Agreement::from_entry(entry, suffix))
        .collect())
}

/// Every agreement on the node, domain suffix first
pub async fn find(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<Agreement>> {
    let mut agreements = find_in(dir, layout, Suffix::Domain).await?;
    agreements.extend(find_in(dir, layout, Suffix::Ca).await?);
    Ok(agreements)
}

/// IPA agreements of the domain suffix
pub async fn find_ipa(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<Agreement>> {
    Ok(find_in(dir, layout, Suffix::Domain)
        .await?
        .into_iter()
        .filter(|a| a.kind == AgreementKind::Ipa)
        .collect())
}

/// The domain agreement towards `remote`, if any
pub async fn get(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<Option<Agreement>> {
    match dir.get_entry(&layout.agreement(Suffix::Domain, remote)).await {
        Ok(entry) => Ok(Agreement::from_entry(&entry, Suffix::Domain)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Type of the domain agreement towards `remote`
pub async fn classify(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<AgreementKind> {
    get(dir, layout, remote)
        .await?
        .map(|a| a.kind)
        .ok_or_else(|| Error::NotFound(layout.agreement(Suffix::Domain, remote).to_string()))
}

/// The domain agreement towards `remote`, `NoAgreement` when missing
pub async fn require(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<Agreement> {
    get(dir, layout, remote).await?.ok_or_else(|| Error::NoAgreement {
        node: dir.host().to_string(),
        remote: remote.to_string(),
    })
}

async fn register_bind_dn(dir: &mut dyn Directory, layout: &Layout, suffix: Suffix, bind_dn: &str) -> Result<()> {
    let replica = layout.replica(suffix);
    let entry = dir.get_entry(&replica).await?;
    if entry
        .values("nsDS5ReplicaBindDN")
        .iter()
        .any(|v| Dn::new(v.as_str()) == Dn::new(bind_dn))
    {
        return Ok(());
    }
    dir.modify(&replica, vec![Modification::add("nsDS5ReplicaBindDN", bind_dn)])
        .await
}

/// Create an IPA agreement on this node pushing to `remote`, and accept
/// replication binds from `remote` on this node's replica entry.
pub async fn create_ipa(
    dir: &mut dyn Directory,
    layout: &Layout,
    suffix: Suffix,
    remote: &str,
    auth: &AgreementAuth,
) -> Result<Dn> {
    let dn = layout.agreement(suffix, remote);
    let mut entry = Entry::new(dn.clone())
        .with("objectClass", ["top", "nsds5replicationagreement"])
        .with("cn", [format!("meTo{}", remote)])
        .with("nsDS5ReplicaHost", [remote])
        .with("nsDS5ReplicaPort", ["389"])
        .with("nsDS5ReplicaRoot", [layout.suffix(suffix).as_str()])
        .with("nsDS5ReplicaTransportInfo", ["LDAP"])
        .with("nsDS5ReplicatedAttributeList", [EXCLUDED_ATTRS])
        .with("nsDS5ReplicatedAttributeListTotal", [EXCLUDED_TOTAL_ATTRS])
        .with("nsds5ReplicaEnabled", ["on"])
        .with("description", [format!("me to {}", remote)]);

    let remote_identity = match auth {
        AgreementAuth::Gssapi => {
            entry.set("nsDS5ReplicaBindMethod", ["SASL/GSSAPI"]);
            layout.ldap_principal(remote).to_string()
        }
        AgreementAuth::Simple { bind_dn, password } => {
            entry.set("nsDS5ReplicaBindMethod", ["SIMPLE"]);
            entry.set("nsDS5ReplicaBindDN", [bind_dn.as_str()]);
            entry.set("nsDS5ReplicaCredentials", [password.as_str()]);
            bind_dn.clone()
        }
    };

    dir.add_entry(entry).await.map_err(|e| match e {
        Error::AlreadyExists(_) => {
            Error::DuplicateAgreement(format!("A replication agreement to {} already exists", remote))
        }
        other => other,
    })?;
    register_bind_dn(dir, layout, suffix, &remote_identity).await?;
    tracing::info!("Created {} agreement {} -> {}", suffix, dir.host(), remote);
    Ok(dn)
}

/// Settings of a winsync agreement
#[derive(Clone)]
pub struct WinsyncSettings {
    pub remote: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub passsync_password: String,
    /// Active Directory subtree to synchronise
    pub subtree: String,
}

impl std::fmt::Debug for WinsyncSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinsyncSettings")
            .field("remote", &self.remote)
            .field("bind_dn", &self.bind_dn)
            .field("subtree", &self.subtree)
            .finish_non_exhaustive()
    }
}

/// Windows domain of an AD host: everything after the first label
fn windows_domain(host: &str) -> &str {
    host.split_once('.').map(|(_, domain)| domain).unwrap_or(host)
}

async fn ensure_passsync_account(dir: &mut dyn Directory, layout: &Layout, password: &str) -> Result<()> {
    let dn = layout.passsync();
    let account = Entry::new(dn.clone())
        .with("objectClass", ["account", "simplesecurityobject"])
        .with("uid", ["passsync"])
        .with("userPassword", [password]);
    match dir.add_entry(account).await {
        Ok(()) => tracing::info!("Created passsync account on {}", dir.host()),
        Err(Error::AlreadyExists(_)) => {
            dir.modify(&dn, vec![Modification::replace("userPassword", password)])
                .await?;
            tracing::info!("Updated passsync password on {}", dir.host());
        }
        Err(e) => return Err(e),
    }
    register_bind_dn(dir, layout, Suffix::Domain, dn.as_str()).await
}

/// Create a winsync agreement on this node towards an AD peer. The peer's CA
/// certificate must already be imported.
pub async fn create_winsync(dir: &mut dyn Directory, layout: &Layout, settings: &WinsyncSettings) -> Result<Dn> {
    ensure_passsync_account(dir, layout, &settings.passsync_password).await?;

    let info = Entry::new(layout.replica_info(&settings.remote))
        .with("objectClass", ["top", "nsContainer"])
        .with("cn", [settings.remote.as_str()])
        .with("ipaConfigString", [format!("winsync:{}", dir.host())]);
    match dir.add_entry(info).await {
        Ok(()) | Err(Error::AlreadyExists(_)) => {}
        Err(e) => return Err(e),
    }

    let dn = layout.agreement(Suffix::Domain, &settings.remote);
    let entry = Entry::new(dn.clone())
        .with("objectClass", ["top", "nsDSWindowsReplicationAgreement"])
        .with("cn", [format!("meTo{}", settings.remote)])
        .with("nsDS5ReplicaHost", [settings.remote.as_str()])
        .with("nsDS5ReplicaPort", ["636"])
        .with("nsDS5ReplicaTransportInfo", ["SSL"])
        .with("nsDS5ReplicaRoot", [layout.basedn().as_str()])
        .with("nsDS5ReplicaBindMethod", ["simple"])
        .with("nsDS5ReplicaBindDN", [settings.bind_dn.as_str()])
        .with("nsDS5ReplicaCredentials", [settings.bind_password.as_str()])
        .with(WINSYNC_SUBTREE_ATTR, [settings.subtree.as_str()])
        .with(
            "nsds7DirectoryReplicaSubtree",
            [layout.basedn().child("cn", "accounts").child("cn", "users").to_string()],
        )
        .with("nsds7NewWinUserSyncEnabled", ["false"])
        .with("nsds7NewWinGroupSyncEnabled", ["false"])
        .with("nsds7WindowsDomain", [windows_domain(&settings.remote)])
        .with("nsds5ReplicaEnabled", ["on"])
        .with("description", [format!("me to {}", settings.remote)]);
    dir.add_entry(entry).await.map_err(|e| match e {
        Error::AlreadyExists(_) => Error::DuplicateAgreement(format!(
            "winsync agreement already exists on subtree {}",
            settings.subtree
        )),
        other => other,
    })?;
    tracing::info!("Created winsync agreement {} -> {}", dir.host(), settings.remote);
    Ok(dn)
}

async fn set_enabled(dir: &mut dyn Directory, layout: &Layout, remote: &str, enabled: bool) -> Result<()> {
    let agreement = require(dir, layout, remote).await?;
    if agreement.enabled == enabled {
        return Ok(());
    }
    let value = if enabled { "on" } else { "off" };
    dir.modify(&agreement.dn, vec![Modification::replace("nsds5ReplicaEnabled", value)])
        .await?;
    tracing::info!("Agreement {} -> {} turned {}", dir.host(), remote, value);
    Ok(())
}

pub async fn enable(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<()> {
    set_enabled(dir, layout, remote, true).await
}

pub async fn disable(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<()> {
    set_enabled(dir, layout, remote, false).await
}

/// Delete the domain agreement towards `remote`
pub async fn delete(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<()> {
    let dn = layout.agreement(Suffix::Domain, remote);
    dir.delete_entry(&dn).await?;
    tracing::info!("Deleted agreement {} -> {}", dir.host(), remote);
    Ok(())
}

/// Referral value a replica keeps for a peer
pub fn referral_url(layout: &Layout, suffix: Suffix, remote: &str) -> String {
    format!("ldap://{}:389/{}", remote, layout.suffix(suffix))
}

/// Drop the referral to `remote` from the replica entry, if present
pub async fn delete_referral(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<()> {
    let replica = layout.replica(Suffix::Domain);
    let url = referral_url(layout, Suffix::Domain, remote);
    let present = match dir.get_entry(&replica).await {
        Ok(entry) => entry
            .values("nsDS5ReplicaReferral")
            .iter()
            .any(|v| v.eq_ignore_ascii_case(&url)),
        Err(Error::NotFound(_)) => false,
        Err(e) => return Err(e),
    };
    if present {
        dir.modify(&replica, vec![Modification::delete_value("nsDS5ReplicaReferral", url)])
            .await?;
        tracing::debug!("Removed referral to {} on {}", remote, dir.host());
    }
    Ok(())
}

/// Make the agreement towards `remote` push pending changes now
pub async fn force_sync(dir: &mut dyn Directory, layout: &Layout, remote: &str) -> Result<Agreement> {
    let agreement = require(dir, layout, remote).await?;
    tracing::info!("Setting agreement {} schedule to {} to force synch", agreement.dn, FORCE_SYNC_SCHEDULE);
    dir.modify(
        &agreement.dn,
        vec![Modification::replace("nsDS5ReplicaUpdateSchedule", FORCE_SYNC_SCHEDULE)],
    )
    .await?;
    tracing::info!("Deleting schedule {} from agreement {}", FORCE_SYNC_SCHEDULE, agreement.dn);
    dir.modify(&agreement.dn, vec![Modification::clear("nsDS5ReplicaUpdateSchedule")])
        .await?;
    Ok(agreement)
}

/// Start a total update over an agreement
pub async fn initialize(dir: &mut dyn Directory, agreement: &Dn) -> Result<()> {
    dir.modify(agreement, vec![Modification::replace("nsds5BeginReplicaRefresh", "start")])
        .await?;
    tracing::info!("Starting replication on {}, please wait until the update is done", dir.host());
    Ok(())
}

/// State of a total update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    InProgress,
    Succeeded,
    Failed(String),
}

/// Interpret the init attributes of an agreement entry
pub fn init_state(entry: &Entry) -> InitState {
    if entry.has("nsds5BeginReplicaRefresh") {
        return InitState::InProgress;
    }
    let Some(status) = entry.first("nsds5ReplicaLastInitStatus") else {
        return InitState::InProgress;
    };
    let in_progress = entry
        .first("nsds5replicaUpdateInProgress")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if status.contains("replica busy") {
        InitState::Failed(status.to_string())
    } else if status.contains("Total update succeeded") {
        InitState::Succeeded
    } else if in_progress {
        InitState::InProgress
    } else {
        InitState::Failed(status.to_string())
    }
}

/// Poll a total update until it succeeds, fails or the deadline passes
pub async fn wait_for_init(ctx: &ClusterContext, dir: &mut dyn Directory, agreement: &Dn) -> Result<WaitOutcome<()>> {
    let deadline = ctx.deadline(ctx.polling().init_timeout());
    loop {
        let entry = dir.get_entry(agreement).await?;
        match init_state(&entry) {
            InitState::Succeeded => {
                tracing::info!("Update succeeded on {}", dir.host());
                return Ok(WaitOutcome::Finished(()));
            }
            InitState::Failed(status) => {
                return Err(Error::Directory {
                    host: dir.host().to_string(),
                    message: format!("Update failed! Status: [{}]", status),
                })
            }
            InitState::InProgress => tracing::debug!("Update in progress on {}", agreement),
        }
        if let Err(stop) = ctx.tick(deadline).await {
            tracing::warn!("Stopped waiting for update on {}: {:?}", agreement, stop);
            return Ok(stop.into());
        }
    }
}

/// Split an update status into its code and message. Both
/// `Error (0) Replica acquired successfully` and `0 Replica acquired` occur.
pub fn parse_update_status(status: &str) -> Option<(i32, &str)> {
    let status = status.trim();
    if let Some(rest) = status.strip_prefix("Error (") {
        let (code, message) = rest.split_once(')')?;
        return Some((code.trim().parse().ok()?, message.trim()));
    }
    let (code, message) = status.split_once(' ').unwrap_or((status, ""));
    Some((code.parse().ok()?, message.trim()))
}

fn stamp(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().trim_end_matches('Z').parse().ok())
}

/// State of an incremental update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    InProgress,
    Done,
    Failed(String),
}

/// Interpret the update attributes of an agreement entry
pub fn update_state(entry: &Entry) -> UpdateState {
    let status = entry.first("nsds5ReplicaLastUpdateStatus");
    if let Some((code, message)) = status.and_then(parse_update_status) {
        if code != 0 {
            return UpdateState::Failed(format!("Error ({}) {}", code, message));
        }
    }
    let idle = entry
        .first("nsds5replicaUpdateInProgress")
        .map(|v| v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);
    let start = stamp(entry.first("nsds5ReplicaLastUpdateStart"));
    let end = stamp(entry.first("nsds5ReplicaLastUpdateEnd"));
    match (start, end) {
        (Some(start), Some(end)) if idle && start <= end => UpdateState::Done,
        _ => UpdateState::InProgress,
    }
}

/// Poll an incremental update until it is done
pub async fn wait_for_update(ctx: &ClusterContext, dir: &mut dyn Directory, agreement: &Dn) -> Result<WaitOutcome<()>> {
    let deadline = ctx.deadline(ctx.polling().update_timeout());
    loop {
        let entry = dir.get_entry(agreement).await?;
        match update_state(&entry) {
            UpdateState::Done => return Ok(WaitOutcome::Finished(())),
            UpdateState::Failed(status) => {
                return Err(Error::Directory {
                    host: dir.host().to_string(),
                    message: format!("Incremental update failed: {}", status),
                })
            }
            UpdateState::InProgress => tracing::debug!("Incremental update in progress on {}", agreement),
        }
        if let Err(stop) = ctx.tick(deadline).await {
            return Ok(stop.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing;
    use crate::directory::{ClusterBuilder, Connector};

    const BASE: &str = "dc=example,dc=com";

    #[test]
    fn test_generalized_time() {
        let parsed = parse_generalized_time("20240315103000Z").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-15T10:30:00+00:00");
        assert!(parse_generalized_time("00000000000000Z").is_none());
        assert!(parse_generalized_time("garbage").is_none());
    }

    #[test]
    fn test_update_status_forms() {
        assert_eq!(
            parse_update_status("Error (0) Replica acquired successfully: Incremental update succeeded"),
            Some((0, "Replica acquired successfully: Incremental update succeeded"))
        );
        assert_eq!(parse_update_status("1 Can't acquire busy replica"), Some((1, "Can't acquire busy replica")));
        assert_eq!(parse_update_status("Error (-1) Problem connecting"), Some((-1, "Problem connecting")));
        assert_eq!(parse_update_status("no code"), None);
    }

    #[test]
    fn test_init_and_update_states() {
        let dn = Dn::new("cn=meTob,cn=replica");
        let busy = Entry::new(dn.clone()).with("nsds5ReplicaLastInitStatus", ["Error (1) replica busy"]);
        assert!(matches!(init_state(&busy), InitState::Failed(_)));
        let running = busy.clone().with("nsds5BeginReplicaRefresh", ["start"]);
        assert_eq!(init_state(&running), InitState::InProgress);
        let done = Entry::new(dn.clone()).with("nsds5ReplicaLastInitStatus", ["Error (0) Total update succeeded"]);
        assert_eq!(init_state(&done), InitState::Succeeded);

        let pending = Entry::new(dn.clone())
            .with("nsds5replicaUpdateInProgress", ["FALSE"])
            .with("nsds5ReplicaLastUpdateStart", ["20240101000005Z"])
            .with("nsds5ReplicaLastUpdateEnd", ["20240101000001Z"]);
        assert_eq!(update_state(&pending), UpdateState::InProgress);
        let failed = pending.clone().with("nsds5ReplicaLastUpdateStatus", ["Error (19) Replication error"]);
        assert!(matches!(update_state(&failed), UpdateState::Failed(_)));
    }

    #[tokio::test]
    async fn test_find_and_classify() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &["CA"])
            .link("a.example.com", "b.example.com")
            .ca_link("a.example.com", "b.example.com")
            .winsync("a.example.com", "ad.win.example.com", "cn=Users,dc=win,dc=example,dc=com")
            .build()
            .await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        let all = find(dir.as_mut(), &layout).await.unwrap();
        assert_eq!(all.len(), 3);
        let ipa = find_ipa(dir.as_mut(), &layout).await.unwrap();
        assert_eq!(ipa.len(), 1);
        assert!(ipa[0].points_to("B.example.com"));
        assert!(ipa[0].last_init_end.is_some());

        assert_eq!(classify(dir.as_mut(), &layout, "b.example.com").await.unwrap(), AgreementKind::Ipa);
        assert!(classify(dir.as_mut(), &layout, "ad.win.example.com")
            .await
            .unwrap()
            .is_winsync());
        assert!(classify(dir.as_mut(), &layout, "c.example.com").await.unwrap_err().is_not_found());
        let err = require(dir.as_mut(), &layout, "c.example.com").await.unwrap_err();
        assert_eq!(err.to_string(), "'a.example.com' has no replication agreement for 'c.example.com'");
        dir.unbind().await;
    }

    #[tokio::test]
    async fn test_create_ipa_pair_and_delete() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .build()
            .await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        let auth = AgreementAuth::Gssapi;
        create_ipa(dir.as_mut(), &layout, Suffix::Domain, "b.example.com", &auth).await.unwrap();
        let dup = create_ipa(dir.as_mut(), &layout, Suffix::Domain, "b.example.com", &auth).await;
        assert!(matches!(dup, Err(Error::DuplicateAgreement(_))));

        let agreement = get(dir.as_mut(), &layout, "b.example.com").await.unwrap().unwrap();
        assert!(agreement.enabled);
        assert!(agreement.has_total_attr_list);

        disable(dir.as_mut(), &layout, "b.example.com").await.unwrap();
        assert!(!get(dir.as_mut(), &layout, "b.example.com").await.unwrap().unwrap().enabled);
        enable(dir.as_mut(), &layout, "b.example.com").await.unwrap();

        delete(dir.as_mut(), &layout, "b.example.com").await.unwrap();
        delete_referral(dir.as_mut(), &layout, "b.example.com").await.unwrap();
        assert!(get(dir.as_mut(), &layout, "b.example.com").await.unwrap().is_none());
        dir.unbind().await;

        let replica = cluster.entry("a.example.com", &layout.replica(Suffix::Domain)).await.unwrap();
        let principal = layout.ldap_principal("b.example.com").to_string();
        assert_eq!(
            replica.values("nsDS5ReplicaBindDN").iter().filter(|v| **v == principal).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_referral_removed_when_present() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .build()
            .await;
        let mut replica = cluster.entry("a.example.com", &layout.replica(Suffix::Domain)).await.unwrap();
        replica.set("nsDS5ReplicaReferral", [referral_url(&layout, Suffix::Domain, "b.example.com")]);
        cluster.put_entry("a.example.com", replica).await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        delete_referral(dir.as_mut(), &layout, "b.example.com").await.unwrap();
        dir.unbind().await;
        let replica = cluster.entry("a.example.com", &layout.replica(Suffix::Domain)).await.unwrap();
        assert!(!replica.has("nsDS5ReplicaReferral"));
    }

    #[tokio::test]
    async fn test_winsync_provisioning() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .build()
            .await;
        let settings = WinsyncSettings {
            remote: "dc1.ad.example.org".into(),
            bind_dn: "cn=sync,cn=Users,dc=ad,dc=example,dc=org".into(),
            bind_password: "Secret1".into(),
            passsync_password: "Secret2".into(),
            subtree: "cn=Users,dc=ad,dc=example,dc=org".into(),
        };
        assert!(!format!("{:?}", settings).contains("Secret"));

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        create_winsync(dir.as_mut(), &layout, &settings).await.unwrap();
        let kind = classify(dir.as_mut(), &layout, "dc1.ad.example.org").await.unwrap();
        assert_eq!(
            kind,
            AgreementKind::Winsync {
                subtree: settings.subtree.clone()
            }
        );
        let dup = create_winsync(dir.as_mut(), &layout, &settings).await.unwrap_err();
        assert_eq!(
            dup.to_string(),
            "winsync agreement already exists on subtree cn=Users,dc=ad,dc=example,dc=org"
        );
        dir.unbind().await;

        // The shared info and the passsync account replicate, the agreement stays local
        let info = cluster.entry("b.example.com", &layout.replica_info("dc1.ad.example.org")).await.unwrap();
        assert_eq!(info.first("ipaConfigString"), Some("winsync:a.example.com"));
        let account = cluster.entry("b.example.com", &layout.passsync()).await.unwrap();
        assert_eq!(account.first("userPassword"), Some("Secret2"));
        assert!(cluster
            .entry("b.example.com", &layout.agreement(Suffix::Domain, "dc1.ad.example.org"))
            .await
            .is_none());
        let agreement = cluster
            .entry("a.example.com", &layout.agreement(Suffix::Domain, "dc1.ad.example.org"))
            .await
            .unwrap();
        assert_eq!(agreement.first("nsds7WindowsDomain"), Some("ad.example.org"));
    }

    #[tokio::test]
    async fn test_force_sync_and_waits() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .link("a.example.com", "b.example.com")
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);

        let mut dir = ctx.open("b.example.com").await.unwrap();
        let agreement = force_sync(dir.as_mut(), &layout, "a.example.com").await.unwrap();
        let entry = dir.get_entry(&agreement.dn).await.unwrap();
        assert!(!entry.has("nsDS5ReplicaUpdateSchedule"));
        assert_eq!(
            wait_for_update(&ctx, dir.as_mut(), &agreement.dn).await.unwrap(),
            WaitOutcome::Finished(())
        );

        initialize(dir.as_mut(), &agreement.dn).await.unwrap();
        assert_eq!(
            wait_for_init(&ctx, dir.as_mut(), &agreement.dn).await.unwrap(),
            WaitOutcome::Finished(())
        );
        dir.unbind().await;
    }

    #[tokio::test]
    async fn test_init_wait_times_out() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .link("a.example.com", "b.example.com")
            .simulate_tasks(false)
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);
        let ctx = ctx.with_polling(crate::config::PollingConfig {
            interval_ms: 5,
            init_timeout_secs: 0,
            update_timeout_secs: 0,
            task_timeout_secs: 0,
        });

        let mut dir = ctx.open("a.example.com").await.unwrap();
        let dn = layout.agreement(Suffix::Domain, "b.example.com");
        initialize(dir.as_mut(), &dn).await.unwrap();
        assert_eq!(wait_for_init(&ctx, dir.as_mut(), &dn).await.unwrap(), WaitOutcome::TimedOut);
        dir.unbind().await;
    }
}
