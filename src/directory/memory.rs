//! In-memory directory cluster
//!
//! Keeps one entry tree per host and implements [`Connector`] so the whole
//! administrative layer can run without a live deployment. Writes below a
//! replicated suffix are copied to every host, configuration writes stay
//! local. With task simulation enabled, the server-side work the tool polls
//! for completes immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::layout::{Layout, Suffix, RUV_TOMBSTONE_ID};
use super::{Connector, Directory, Dn, Entry, Filter, Modification, Scope};
use crate::error::{Error, Result};

/// Status a successful total update leaves on an agreement
pub const INIT_SUCCEEDED: &str = "Error (0) Total update succeeded";

/// Status a successful incremental update leaves on an agreement
pub const UPDATE_SUCCEEDED: &str =
    "Error (0) Replica acquired successfully: Incremental update succeeded";

const REPLICA_GENERATION: &str = "{replicageneration} 5f4e3a10000000040000";

/// Kind of recorded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Add,
    Modify,
    Delete,
}

/// A write issued through a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub host: String,
    pub op: WriteOp,
    pub dn: Dn,
}

#[derive(Debug, Default)]
struct HostTree {
    entries: BTreeMap<Dn, Entry>,
    offline: bool,
}

impl HostTree {
    fn base_exists(&self, base: &Dn) -> bool {
        self.entries.contains_key(base) || self.entries.keys().any(|dn| dn.is_within(base))
    }

    fn has_children(&self, dn: &Dn) -> bool {
        self.entries.keys().any(|other| other.is_child_of(dn))
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    hosts: BTreeMap<String, HostTree>,
    replicated: Vec<Dn>,
    simulate_tasks: bool,
    writes: Vec<WriteRecord>,
}

impl ClusterState {
    fn tree(&self, host: &str) -> Result<&HostTree> {
        match self.hosts.get(&host.to_lowercase()) {
            Some(tree) if tree.offline => Err(unreachable_host(host)),
            Some(tree) => Ok(tree),
            None => Err(Error::ConnectionFailed {
                host: host.to_string(),
                reason: "no such host".into(),
            }),
        }
    }

    fn tree_mut(&mut self, host: &str) -> Result<&mut HostTree> {
        match self.hosts.get_mut(&host.to_lowercase()) {
            Some(tree) if tree.offline => Err(unreachable_host(host)),
            Some(tree) => Ok(tree),
            None => Err(Error::ConnectionFailed {
                host: host.to_string(),
                reason: "no such host".into(),
            }),
        }
    }

    fn is_replicated(&self, dn: &Dn) -> bool {
        self.replicated.iter().any(|suffix| dn.is_within(suffix))
    }

    fn other_hosts(&self, host: &str) -> Vec<String> {
        let host = host.to_lowercase();
        self.hosts.keys().filter(|h| **h != host).cloned().collect()
    }

    fn search(&self, host: &str, base: &Dn, scope: Scope, filter: Option<&Filter>) -> Result<Vec<Entry>> {
        let tree = self.tree(host)?;
        if !tree.base_exists(base) {
            return Err(Error::NotFound(base.to_string()));
        }
        Ok(tree
            .entries
            .values()
            .filter(|entry| match scope {
                Scope::Base => entry.dn == *base,
                Scope::OneLevel => entry.dn.is_child_of(base),
                Scope::Subtree => entry.dn.is_within(base),
            })
            .filter(|entry| filter.map(|f| f.matches(entry)).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn add(&mut self, host: &str, entry: Entry) -> Result<()> {
        let tree = self.tree_mut(host)?;
        if tree.entries.contains_key(&entry.dn) {
            return Err(Error::AlreadyExists(entry.dn.to_string()));
        }
        tree.entries.insert(entry.dn.clone(), entry);
        Ok(())
    }

    fn modify(&mut self, host: &str, dn: &Dn, mods: &[Modification]) -> Result<()> {
        let tree = self.tree_mut(host)?;
        let entry = tree
            .entries
            .get_mut(dn)
            .ok_or_else(|| Error::NotFound(dn.to_string()))?;
        for modification in mods {
            entry.apply(modification);
        }
        Ok(())
    }

    fn delete(&mut self, host: &str, dn: &Dn) -> Result<()> {
        let tree = self.tree_mut(host)?;
        if !tree.entries.contains_key(dn) {
            return Err(Error::NotFound(dn.to_string()));
        }
        if tree.has_children(dn) {
            return Err(Error::Directory {
                host: host.to_string(),
                message: format!("Operation not allowed on non-leaf: {}", dn),
            });
        }
        tree.entries.remove(dn);
        Ok(())
    }

    /// Copy a write to every other host holding the suffix. Misses are ignored.
    fn replicate<F>(&mut self, host: &str, dn: &Dn, mut apply: F)
    where
        F: FnMut(&mut HostTree),
    {
        if !self.is_replicated(dn) {
            return;
        }
        for other in self.other_hosts(host) {
            if let Some(tree) = self.hosts.get_mut(&other) {
                apply(tree);
            }
        }
    }

    fn complete_tasks(&mut self, host: &str, dn: &Dn) {
        let Some(container) = dn.parent() else { return };
        let kind = container.rdn_value().unwrap_or_default().to_lowercase();
        let Some(task) = self.hosts.get(&host.to_lowercase()).and_then(|t| t.entries.get(dn)).cloned() else {
            return;
        };
        let rid = task.first("replica-id").unwrap_or_default().to_string();
        let status = match kind.as_str() {
            "cleanallruv" => {
                if let (Ok(rid), Some(base)) = (rid.parse::<u16>(), task.first("replica-base-dn")) {
                    self.purge_rid(&Dn::new(base), rid);
                }
                format!("Successfully cleaned rid({})", rid)
            }
            "abort cleanallruv" => format!("Successfully aborted task for rid({})", rid),
            "memberof task" => "Memberof task finished".to_string(),
            _ => return,
        };
        let _ = self.modify(
            host,
            dn,
            &[
                Modification::replace("nsTaskExitCode", "0"),
                Modification::replace("nsTaskStatus", status),
            ],
        );
    }

    fn purge_rid(&mut self, suffix: &Dn, rid: u16) {
        let prefix = format!("{{replica {} ", rid);
        let exact = format!("{{replica {}}}", rid);
        for tree in self.hosts.values_mut() {
            for entry in tree.entries.values_mut() {
                if !entry.dn.is_within(suffix)
                    || !entry
                        .values("nsuniqueid")
                        .iter()
                        .any(|v| v.eq_ignore_ascii_case(RUV_TOMBSTONE_ID))
                {
                    continue;
                }
                let kept: Vec<String> = entry
                    .values("nsds50ruv")
                    .iter()
                    .filter(|v| !v.starts_with(&prefix) && **v != exact)
                    .cloned()
                    .collect();
                entry.set("nsds50ruv", kept);
            }
        }
    }

    fn complete_agreement_work(&mut self, host: &str, dn: &Dn, mods: &[Modification]) {
        let stamp = generalized_now();
        let mut follow_up = Vec::new();
        for modification in mods {
            match modification {
                Modification::Replace(attr, values)
                    if attr.eq_ignore_ascii_case("nsds5BeginReplicaRefresh")
                        && values.iter().any(|v| v.eq_ignore_ascii_case("start")) =>
                {
                    follow_up.push(Modification::clear("nsds5BeginReplicaRefresh"));
                    follow_up.push(Modification::replace("nsds5ReplicaLastInitStatus", INIT_SUCCEEDED));
                    follow_up.push(Modification::replace("nsds5ReplicaLastInitEnd", stamp.clone()));
                }
                Modification::Delete(attr, _) | Modification::Replace(attr, _)
                    if attr.eq_ignore_ascii_case("nsDS5ReplicaUpdateSchedule") =>
                {
                    follow_up.push(Modification::replace("nsds5replicaUpdateInProgress", "FALSE"));
                    follow_up.push(Modification::replace("nsds5ReplicaLastUpdateStatus", UPDATE_SUCCEEDED));
                    follow_up.push(Modification::replace("nsds5ReplicaLastUpdateStart", stamp.clone()));
                    follow_up.push(Modification::replace("nsds5ReplicaLastUpdateEnd", stamp.clone()));
                }
                _ => {}
            }
        }
        if !follow_up.is_empty() {
            let _ = self.modify(host, dn, &follow_up);
        }
    }
}

fn unreachable_host(host: &str) -> Error {
    Error::ConnectionFailed {
        host: host.to_string(),
        reason: "Can't contact LDAP server".into(),
    }
}

fn generalized_now() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%SZ").to_string()
}

/// Simulated cluster of directory servers
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<RwLock<ClusterState>>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty host
    pub async fn add_host(&self, host: &str) {
        let mut state = self.state.write().await;
        state.hosts.entry(host.to_lowercase()).or_default();
    }

    /// Mark a host unreachable (or reachable again)
    pub async fn set_offline(&self, host: &str, offline: bool) {
        let mut state = self.state.write().await;
        if let Some(tree) = state.hosts.get_mut(&host.to_lowercase()) {
            tree.offline = offline;
        }
    }

    /// Copy writes below `suffix` to every host
    pub async fn replicate_suffix(&self, suffix: Dn) {
        self.state.write().await.replicated.push(suffix);
    }

    /// Complete CLEANALLRUV, abort, memberOf and replication refresh work on write
    pub async fn set_simulate_tasks(&self, enabled: bool) {
        self.state.write().await.simulate_tasks = enabled;
    }

    /// Insert or replace an entry on one host without recording a write
    pub async fn put_entry(&self, host: &str, entry: Entry) {
        let mut state = self.state.write().await;
        let tree = state.hosts.entry(host.to_lowercase()).or_default();
        tree.entries.insert(entry.dn.clone(), entry);
    }

    /// Read an entry from one host, regardless of its reachability
    pub async fn entry(&self, host: &str, dn: &Dn) -> Option<Entry> {
        let state = self.state.read().await;
        state
            .hosts
            .get(&host.to_lowercase())
            .and_then(|tree| tree.entries.get(dn))
            .cloned()
    }

    /// Entries of one host at or below `base`
    pub async fn entries_under(&self, host: &str, base: &Dn) -> Vec<Entry> {
        let state = self.state.read().await;
        state
            .hosts
            .get(&host.to_lowercase())
            .map(|tree| {
                tree.entries
                    .values()
                    .filter(|entry| entry.dn.is_within(base))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes issued through sessions, in order
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.read().await.writes.clone()
    }

    pub async fn clear_writes(&self) {
        self.state.write().await.writes.clear();
    }

    async fn record(&self, host: &str, op: WriteOp, dn: &Dn) {
        self.state.write().await.writes.push(WriteRecord {
            host: host.to_string(),
            op,
            dn: dn.clone(),
        });
    }
}

#[async_trait::async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, host: &str) -> Result<Box<dyn Directory>> {
        self.state.read().await.tree(host)?;
        tracing::debug!("Opened simulated session to {}", host);
        Ok(Box::new(MemorySession {
            host: host.to_string(),
            cluster: self.clone(),
            bound: true,
        }))
    }
}

/// Session against one simulated host
pub struct MemorySession {
    host: String,
    cluster: MemoryCluster,
    bound: bool,
}

impl MemorySession {
    fn ensure_bound(&self) -> Result<()> {
        if self.bound {
            Ok(())
        } else {
            Err(Error::Internal(format!("session to {} already unbound", self.host)))
        }
    }
}

#[async_trait::async_trait]
impl Directory for MemorySession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn search(&mut self, base: &Dn, scope: Scope, filter: Option<&Filter>) -> Result<Vec<Entry>> {
        self.ensure_bound()?;
        self.cluster.state.read().await.search(&self.host, base, scope, filter)
    }

    async fn add_entry(&mut self, entry: Entry) -> Result<()> {
        self.ensure_bound()?;
        let dn = entry.dn.clone();
        {
            let mut state = self.cluster.state.write().await;
            state.add(&self.host, entry.clone())?;
            state.replicate(&self.host, &dn, |tree| {
                tree.entries.entry(dn.clone()).or_insert_with(|| entry.clone());
            });
            if state.simulate_tasks {
                state.complete_tasks(&self.host, &dn);
            }
        }
        self.cluster.record(&self.host, WriteOp::Add, &dn).await;
        Ok(())
    }

    async fn modify(&mut self, dn: &Dn, mods: Vec<Modification>) -> Result<()> {
        self.ensure_bound()?;
        {
            let mut state = self.cluster.state.write().await;
            state.modify(&self.host, dn, &mods)?;
            state.replicate(&self.host, dn, |tree| {
                if let Some(entry) = tree.entries.get_mut(dn) {
                    for modification in &mods {
                        entry.apply(modification);
                    }
                }
            });
            if state.simulate_tasks {
                state.complete_agreement_work(&self.host, dn, &mods);
            }
        }
        self.cluster.record(&self.host, WriteOp::Modify, dn).await;
        Ok(())
    }

    async fn delete_entry(&mut self, dn: &Dn) -> Result<()> {
        self.ensure_bound()?;
        {
            let mut state = self.cluster.state.write().await;
            state.delete(&self.host, dn)?;
            state.replicate(&self.host, dn, |tree| {
                if !tree.has_children(dn) {
                    tree.entries.remove(dn);
                }
            });
        }
        self.cluster.record(&self.host, WriteOp::Delete, dn).await;
        Ok(())
    }

    async fn unbind(&mut self) {
        self.bound = false;
    }
}

#[derive(Debug, Clone)]
struct MasterSpec {
    host: String,
    rid: u16,
    ca_rid: Option<u16>,
    services: Vec<String>,
}

#[derive(Debug, Clone)]
struct IdRangeSpec {
    name: String,
    base: u32,
    size: u32,
    trusted: bool,
}

/// Builds a consistent simulated deployment
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    layout: Layout,
    masters: Vec<MasterSpec>,
    hosts: Vec<String>,
    links: Vec<(String, String, Suffix)>,
    winsync: Vec<(String, String, String)>,
    dna: BTreeMap<String, (u32, u32)>,
    dna_next: BTreeMap<String, (u32, u32)>,
    ranges: Vec<IdRangeSpec>,
    ruvs: Vec<(Option<String>, Suffix, u16, String)>,
    renewal_master: Option<String>,
    dnssec_key_master: Option<String>,
    domain_level: u32,
    offline: Vec<String>,
    simulate_tasks: bool,
}

impl ClusterBuilder {
    pub fn new(basedn: &str) -> Self {
        Self {
            layout: Layout::new(basedn),
            masters: Vec::new(),
            hosts: Vec::new(),
            links: Vec::new(),
            winsync: Vec::new(),
            dna: BTreeMap::new(),
            dna_next: BTreeMap::new(),
            ranges: Vec::new(),
            ruvs: Vec::new(),
            renewal_master: None,
            dnssec_key_master: None,
            domain_level: 0,
            offline: Vec::new(),
            simulate_tasks: true,
        }
    }

    /// Register a master. A "CA" service gives it a CA replica id of `1000 + rid`.
    pub fn master(mut self, host: &str, rid: u16, services: &[&str]) -> Self {
        let ca_rid = services
            .iter()
            .any(|s| s.eq_ignore_ascii_case("CA"))
            .then(|| rid.saturating_add(1000));
        self.masters.push(MasterSpec {
            host: host.to_string(),
            rid,
            ca_rid,
            services: services.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// A reachable host that is not in the masters registry
    pub fn host(mut self, host: &str) -> Self {
        self.hosts.push(host.to_string());
        self
    }

    /// IPA agreements in both directions on the domain suffix
    pub fn link(mut self, a: &str, b: &str) -> Self {
        self.links.push((a.to_string(), b.to_string(), Suffix::Domain));
        self
    }

    /// IPA agreements in both directions on the CA suffix
    pub fn ca_link(mut self, a: &str, b: &str) -> Self {
        self.links.push((a.to_string(), b.to_string(), Suffix::Ca));
        self
    }

    /// One-directional winsync agreement from `host` to an external peer
    pub fn winsync(mut self, host: &str, peer: &str, subtree: &str) -> Self {
        self.winsync
            .push((host.to_string(), peer.to_string(), subtree.to_string()));
        self
    }

    pub fn dna_range(mut self, host: &str, start: u32, end: u32) -> Self {
        self.dna.insert(host.to_lowercase(), (start, end));
        self
    }

    pub fn dna_next_range(mut self, host: &str, start: u32, end: u32) -> Self {
        self.dna_next.insert(host.to_lowercase(), (start, end));
        self
    }

    pub fn domain_range(mut self, name: &str, base: u32, size: u32) -> Self {
        self.ranges.push(IdRangeSpec {
            name: name.to_string(),
            base,
            size,
            trusted: false,
        });
        self
    }

    pub fn trust_range(mut self, name: &str, base: u32, size: u32) -> Self {
        self.ranges.push(IdRangeSpec {
            name: name.to_string(),
            base,
            size,
            trusted: true,
        });
        self
    }

    /// Extra RUV element on every host holding `suffix`
    pub fn stale_ruv(mut self, suffix: Suffix, rid: u16, origin: &str) -> Self {
        self.ruvs.push((None, suffix, rid, origin.to_string()));
        self
    }

    /// Extra RUV element on a single host
    pub fn ruv_on(mut self, host: &str, suffix: Suffix, rid: u16, origin: &str) -> Self {
        self.ruvs
            .push((Some(host.to_lowercase()), suffix, rid, origin.to_string()));
        self
    }

    pub fn renewal_master(mut self, host: &str) -> Self {
        self.renewal_master = Some(host.to_string());
        self
    }

    pub fn dnssec_key_master(mut self, host: &str) -> Self {
        self.dnssec_key_master = Some(host.to_string());
        self
    }

    pub fn domain_level(mut self, level: u32) -> Self {
        self.domain_level = level;
        self
    }

    pub fn offline(mut self, host: &str) -> Self {
        self.offline.push(host.to_string());
        self
    }

    pub fn simulate_tasks(mut self, enabled: bool) -> Self {
        self.simulate_tasks = enabled;
        self
    }

    /// Materialise the deployment
    pub async fn build(self) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        let layout = &self.layout;
        let all_hosts: Vec<String> = self
            .masters
            .iter()
            .map(|m| m.host.clone())
            .chain(self.hosts.iter().cloned())
            .collect();

        let shared = self.shared_entries();
        for host in &all_hosts {
            cluster.add_host(host).await;
            for entry in &shared {
                cluster.put_entry(host, entry.clone()).await;
            }
        }

        for master in &self.masters {
            for entry in self.local_entries(master) {
                cluster.put_entry(&master.host, entry).await;
            }
        }

        for (a, b, suffix) in &self.links {
            cluster.put_entry(a, ipa_agreement(layout, *suffix, b)).await;
            cluster.put_entry(b, ipa_agreement(layout, *suffix, a)).await;
        }

        for (host, peer, subtree) in &self.winsync {
            let dn = layout.agreement(Suffix::Domain, peer);
            let agreement = Entry::new(dn)
                .with("objectClass", ["top", "nsDSWindowsReplicationAgreement"])
                .with("cn", [format!("meTo{}", peer)])
                .with("nsDS5ReplicaHost", [peer.as_str()])
                .with("nsDS5ReplicaPort", ["636"])
                .with("nsDS5ReplicaRoot", [layout.basedn().as_str()])
                .with("nsds7WindowsReplicaSubtree", [subtree.as_str()])
                .with("nsds7DirectoryReplicaSubtree", [layout.basedn().as_str()])
                .with("nsds5ReplicaLastInitStatus", [INIT_SUCCEEDED])
                .with("nsds5ReplicaLastUpdateStatus", [UPDATE_SUCCEEDED]);
            cluster.put_entry(host, agreement).await;
            let info = Entry::new(layout.replica_info(peer))
                .with("objectClass", ["top", "nsContainer"])
                .with("cn", [peer.as_str()])
                .with("ipaConfigString", [format!("winsync:{}", host)]);
            for any in &all_hosts {
                cluster.put_entry(any, info.clone()).await;
            }
        }

        for host in &self.offline {
            cluster.set_offline(host, true).await;
        }
        cluster.replicate_suffix(layout.basedn().clone()).await;
        cluster.set_simulate_tasks(self.simulate_tasks).await;
        cluster
    }

    fn shared_entries(&self) -> Vec<Entry> {
        let layout = &self.layout;
        let mut entries = vec![Entry::new(layout.domain_level())
            .with("objectClass", ["top", "nsContainer", "ipaDomainLevelConfig"])
            .with("cn", ["Domain Level"])
            .with("ipaDomainLevel", [self.domain_level.to_string()])];

        for master in &self.masters {
            entries.push(
                Entry::new(layout.master(&master.host))
                    .with("objectClass", ["top", "nsContainer"])
                    .with("cn", [master.host.as_str()]),
            );
            let mut services = master.services.clone();
            if self.dnssec_key_master.as_deref() == Some(master.host.as_str())
                && !services.iter().any(|s| s.eq_ignore_ascii_case("DNSSEC"))
            {
                services.push("DNSSEC".into());
            }
            for service in services {
                let mut config = vec!["enabledService".to_string()];
                if service.eq_ignore_ascii_case("CA")
                    && self.renewal_master.as_deref() == Some(master.host.as_str())
                {
                    config.push("caRenewalMaster".into());
                }
                if service.eq_ignore_ascii_case("DNSSEC")
                    && self.dnssec_key_master.as_deref() == Some(master.host.as_str())
                {
                    config.push("dnssecKeyMaster".into());
                }
                entries.push(
                    Entry::new(layout.master_service(&master.host, &service))
                        .with("objectClass", ["top", "nsContainer", "ipaConfigObject"])
                        .with("cn", [service.as_str()])
                        .with("ipaConfigString", config),
                );
            }
        }

        for range in &self.ranges {
            let class = if range.trusted {
                "ipaTrustedADDomainRange"
            } else {
                "ipaDomainIDRange"
            };
            entries.push(
                Entry::new(layout.ranges().child("cn", &range.name))
                    .with("objectClass", ["top", "ipaIDrange", class])
                    .with("cn", [range.name.as_str()])
                    .with("ipaBaseID", [range.base.to_string()])
                    .with("ipaIDRangeSize", [range.size.to_string()]),
            );
        }

        let shared_cfg = dna_shared_config(layout);
        for master in &self.masters {
            let remaining = match self.dna.get(&master.host.to_lowercase()) {
                Some((start, end)) => end.saturating_sub(*start) + 1,
                None => 0,
            };
            entries.push(
                Entry::new(shared_cfg.child("dnaHostname", &master.host))
                    .with("objectClass", ["top", "dnaSharedConfig"])
                    .with("dnaHostname", [master.host.as_str()])
                    .with("dnaPortNum", ["389"])
                    .with("dnaRemainingValues", [remaining.to_string()]),
            );
        }

        if self
            .masters
            .iter()
            .any(|m| m.services.iter().any(|s| s.eq_ignore_ascii_case("DNS")))
        {
            entries.extend(dns_entries(layout, &self.masters));
        }

        let domain_ruv = self.ruv_values(None, Suffix::Domain);
        entries.push(tombstone(layout.suffix(Suffix::Domain), domain_ruv));
        entries
    }

    fn local_entries(&self, master: &MasterSpec) -> Vec<Entry> {
        let layout = &self.layout;
        let host_key = master.host.to_lowercase();
        let peers: Vec<String> = self
            .masters
            .iter()
            .filter(|m| m.host != master.host)
            .map(|m| layout.ldap_principal(&m.host).to_string())
            .collect();

        let mut entries = vec![replica_entry(layout, Suffix::Domain, master.rid, &peers)];
        if let Some(ca_rid) = master.ca_rid {
            entries.push(replica_entry(layout, Suffix::Ca, ca_rid, &peers));
            entries.push(tombstone(
                layout.suffix(Suffix::Ca),
                self.ruv_values(Some(&host_key), Suffix::Ca),
            ));
        }

        // Host-specific RUV elements land on this host's copy of the domain tombstone.
        let domain_ruv = self.ruv_values(Some(&host_key), Suffix::Domain);
        entries.push(tombstone(layout.suffix(Suffix::Domain), domain_ruv));

        let (next, max) = self.dna.get(&host_key).copied().unwrap_or((1101, 1100));
        let mut dna = Entry::new(layout.dna_config())
            .with("objectClass", ["top", "extensibleObject"])
            .with("cn", ["Posix IDs"])
            .with("dnaType", ["uidNumber", "gidNumber"])
            .with("dnaNextValue", [next.to_string()])
            .with("dnaMaxValue", [max.to_string()])
            .with("dnaSharedCfgDN", [dna_shared_config(layout).to_string()]);
        if let Some((start, end)) = self.dna_next.get(&host_key) {
            dna.set("dnaNextRange", [format!("{}-{}", start, end)]);
        }
        entries.push(dna);

        entries.push(
            Entry::new(layout.userroot_backend())
                .with("cn", ["userRoot"])
                .with("nsslapd-readonly", ["off"]),
        );
        entries.push(
            Entry::new(layout.config())
                .with("cn", ["config"])
                .with("nsslapd-ignore-time-skew", ["off"]),
        );
        entries
    }

    /// RUV values for a tombstone. `host` selects host-specific extras.
    fn ruv_values(&self, host: Option<&str>, suffix: Suffix) -> Vec<String> {
        let mut values = vec![REPLICA_GENERATION.to_string()];
        for master in &self.masters {
            let rid = match suffix {
                Suffix::Domain => Some(master.rid),
                Suffix::Ca => master.ca_rid,
            };
            if let Some(rid) = rid {
                values.push(ruv_value(rid, &master.host));
            }
        }
        for (only, ruv_suffix, rid, origin) in &self.ruvs {
            if *ruv_suffix != suffix {
                continue;
            }
            let applies = match (only, host) {
                (None, _) => true,
                (Some(only), Some(host)) => only == host,
                (Some(_), None) => false,
            };
            if applies {
                values.push(ruv_value(*rid, origin));
            }
        }
        values
    }
}

fn ruv_value(rid: u16, origin: &str) -> String {
    format!(
        "{{replica {} ldap://{}:389}} 5f4e3a10000000{:02x}0000 5f4e3b20000000{:02x}0000",
        rid,
        origin,
        rid % 256,
        rid % 256
    )
}

fn tombstone(suffix: Dn, ruv: Vec<String>) -> Entry {
    Entry::new(suffix.child("nsuniqueid", RUV_TOMBSTONE_ID))
        .with("objectClass", ["top", "nsTombstone", "extensibleObject"])
        .with("nsUniqueId", [RUV_TOMBSTONE_ID])
        .with("nsds50ruv", ruv)
}

fn replica_entry(layout: &Layout, suffix: Suffix, rid: u16, peers: &[String]) -> Entry {
    Entry::new(layout.replica(suffix))
        .with("objectClass", ["top", "nsds5replica", "extensibleObject"])
        .with("cn", ["replica"])
        .with("nsDS5ReplicaRoot", [layout.suffix(suffix).as_str()])
        .with("nsDS5ReplicaID", [rid.to_string()])
        .with("nsDS5ReplicaType", ["3"])
        .with("nsDS5Flags", ["1"])
        .with("nsDS5ReplicaBindDN", peers.to_vec())
}

fn ipa_agreement(layout: &Layout, suffix: Suffix, remote: &str) -> Entry {
    Entry::new(layout.agreement(suffix, remote))
        .with("objectClass", ["top", "nsds5replicationagreement"])
        .with("cn", [format!("meTo{}", remote)])
        .with("nsDS5ReplicaHost", [remote])
        .with("nsDS5ReplicaPort", ["389"])
        .with("nsDS5ReplicaRoot", [layout.suffix(suffix).as_str()])
        .with("nsDS5ReplicaBindMethod", ["SASL/GSSAPI"])
        .with("nsDS5ReplicaTransportInfo", ["LDAP"])
        .with("nsds5ReplicaEnabled", ["on"])
        .with(
            "nsDS5ReplicatedAttributeListTotal",
            ["(objectclass=*) $ EXCLUDE entryusn krblastsuccessfulauth krblastfailedauth krbloginfailedcount"],
        )
        .with("nsds5replicaUpdateInProgress", ["FALSE"])
        .with("nsds5ReplicaLastInitStatus", [INIT_SUCCEEDED])
        .with("nsds5ReplicaLastInitEnd", ["20240101000000Z"])
        .with("nsds5ReplicaLastUpdateStatus", [UPDATE_SUCCEEDED])
        .with("nsds5ReplicaLastUpdateStart", ["20240101000000Z"])
        .with("nsds5ReplicaLastUpdateEnd", ["20240101000001Z"])
}

fn dna_shared_config(layout: &Layout) -> Dn {
    layout
        .basedn()
        .child("cn", "etc")
        .child("cn", "ipa")
        .child("cn", "dna")
        .child("cn", "posix-ids")
}

fn dns_entries(layout: &Layout, masters: &[MasterSpec]) -> Vec<Entry> {
    let realm = layout.realm().to_lowercase();
    let zone = layout.dns().child("idnsname", &format!("{}.", realm));
    let mut entries = vec![
        Entry::new(layout.dns())
            .with("objectClass", ["top", "nsContainer", "idnsConfigObject"])
            .with("cn", ["dns"]),
        Entry::new(zone.clone())
            .with("objectClass", ["top", "idnsRecord", "idnsZone"])
            .with("idnsName", [format!("{}.", realm)]),
    ];
    let srv: Vec<String> = masters
        .iter()
        .map(|m| format!("0 100 389 {}.", m.host))
        .collect();
    entries.push(
        Entry::new(zone.child("idnsname", "_ldap._tcp"))
            .with("objectClass", ["top", "idnsRecord"])
            .with("idnsName", ["_ldap._tcp"])
            .with("sRVRecord", srv),
    );
    for master in masters {
        let label = master
            .host
            .strip_suffix(&format!(".{}", realm))
            .unwrap_or(&master.host)
            .to_string();
        entries.push(
            Entry::new(zone.child("idnsname", &label))
                .with("objectClass", ["top", "idnsRecord"])
                .with("idnsName", [label.as_str()])
                .with("aRecord", ["192.0.2.10"]),
        );
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> &'static str {
        "dc=example,dc=com"
    }

    #[tokio::test]
    async fn test_offline_host_refuses_connection() {
        let cluster = ClusterBuilder::new(base())
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &[])
            .offline("b.example.com")
            .build()
            .await;

        assert!(cluster.connect("a.example.com").await.is_ok());
        let err = cluster.connect("b.example.com").await.err().unwrap();
        assert!(err.is_connectivity());
        assert!(cluster.connect("nowhere.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_search_scopes_and_missing_base() {
        let layout = Layout::new(base());
        let cluster = ClusterBuilder::new(base())
            .master("a.example.com", 4, &["CA", "DNS"])
            .master("b.example.com", 5, &["DNS"])
            .build()
            .await;

        let mut session = cluster.connect("a.example.com").await.unwrap();
        let masters = session
            .search(&layout.masters(), Scope::OneLevel, None)
            .await
            .unwrap();
        assert_eq!(masters.len(), 2);

        let services = session
            .search(&layout.masters(), Scope::Subtree, Some(&Filter::eq("cn", "DNS")))
            .await
            .unwrap();
        assert_eq!(services.len(), 2);

        let missing = session
            .search(&layout.abort_tasks(), Scope::OneLevel, None)
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
        session.unbind().await;
        assert!(session.get_entry(&layout.masters()).await.is_err());
    }

    #[tokio::test]
    async fn test_replicated_writes_reach_every_host() {
        let layout = Layout::new(base());
        let cluster = ClusterBuilder::new(base())
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .build()
            .await;

        let mut session = cluster.connect("a.example.com").await.unwrap();
        session
            .delete_entry(&layout.master("b.example.com"))
            .await
            .unwrap();
        session
            .modify(
                &layout.userroot_backend(),
                vec![Modification::replace("nsslapd-readonly", "on")],
            )
            .await
            .unwrap();
        session.unbind().await;

        assert!(cluster
            .entry("b.example.com", &layout.master("b.example.com"))
            .await
            .is_none());
        let backend = cluster
            .entry("b.example.com", &layout.userroot_backend())
            .await
            .unwrap();
        assert_eq!(backend.first("nsslapd-readonly"), Some("off"));
        assert_eq!(cluster.writes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_leaf_delete_is_rejected() {
        let layout = Layout::new(base());
        let cluster = ClusterBuilder::new(base())
            .master("a.example.com", 4, &["CA"])
            .build()
            .await;

        let mut session = cluster.connect("a.example.com").await.unwrap();
        let result = session.delete_entry(&layout.master("a.example.com")).await;
        assert!(matches!(result, Err(Error::Directory { .. })));
        session
            .delete_subtree(&layout.master("a.example.com"))
            .await
            .unwrap();
        session.unbind().await;
        assert!(cluster
            .entry("a.example.com", &layout.master_service("a.example.com", "CA"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cleanallruv_task_purges_rid() {
        let layout = Layout::new(base());
        let cluster = ClusterBuilder::new(base())
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .stale_ruv(Suffix::Domain, 9, "gone.example.com")
            .build()
            .await;

        let mut session = cluster.connect("a.example.com").await.unwrap();
        let task = Entry::new(layout.clean_task(9))
            .with("objectClass", ["top", "extensibleObject"])
            .with("cn", ["clean 9"])
            .with("replica-base-dn", [base()])
            .with("replica-id", ["9"]);
        session.add_entry(task).await.unwrap();
        let task = session.get_entry(&layout.clean_task(9)).await.unwrap();
        session.unbind().await;

        assert_eq!(task.first("nsTaskExitCode"), Some("0"));
        let tombstone = cluster
            .entry(
                "b.example.com",
                &layout.suffix(Suffix::Domain).child("nsuniqueid", RUV_TOMBSTONE_ID),
            )
            .await
            .unwrap();
        assert!(tombstone
            .values("nsds50ruv")
            .iter()
            .all(|v| !v.starts_with("{replica 9 ")));
        assert_eq!(tombstone.values("nsds50ruv").len(), 3);
    }
}
