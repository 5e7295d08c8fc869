//! Masters Registry
//!
//! Reads the masters container: one entry per node, one child per service
//! the node provides. Also reads the winsync peers recorded next to it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::directory::{Directory, Dn, Layout, Modification, Scope};
use crate::error::{Error, Result};

/// Marker on a CA service entry of the CA renewal master
pub const CA_RENEWAL_MASTER: &str = "caRenewalMaster";

/// Marker on a DNSSEC service entry of the DNSSEC key master
pub const DNSSEC_KEY_MASTER: &str = "dnssecKeyMaster";

/// Service a node provides
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceRole {
    Ca,
    Dns,
    Kdc,
    Kpasswd,
    Dnssec,
    Other(String),
}

impl ServiceRole {
    /// Parse a service container name
    pub fn from_cn(cn: &str) -> Self {
        match cn.to_ascii_uppercase().as_str() {
            "CA" => ServiceRole::Ca,
            "DNS" => ServiceRole::Dns,
            "KDC" => ServiceRole::Kdc,
            "KPASSWD" => ServiceRole::Kpasswd,
            "DNSSEC" => ServiceRole::Dnssec,
            _ => ServiceRole::Other(cn.to_string()),
        }
    }

    /// Service container name
    pub fn cn(&self) -> &str {
        match self {
            ServiceRole::Ca => "CA",
            ServiceRole::Dns => "DNS",
            ServiceRole::Kdc => "KDC",
            ServiceRole::Kpasswd => "KPASSWD",
            ServiceRole::Dnssec => "DNSSEC",
            ServiceRole::Other(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cn())
    }
}

/// A node of the masters registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    /// Fully qualified host name
    pub host: String,
    /// Services provided by the node
    pub services: BTreeSet<ServiceRole>,
    /// Holds the CA renewal master role
    pub ca_renewal_master: bool,
    /// Holds the DNSSEC key master role
    pub dnssec_key_master: bool,
}

impl Master {
    pub fn provides(&self, role: &ServiceRole) -> bool {
        self.services.contains(role)
    }

    pub fn is(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
    }
}

/// Kind of a peer in the public server list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    /// A registered master
    Master,
    /// An external winsync peer, synchronised by `via`
    Winsync { via: String },
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Master => write!(f, "master"),
            PeerKind::Winsync { .. } => write!(f, "winsync"),
        }
    }
}

/// Entry of the public server list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub kind: PeerKind,
}

/// Snapshot of the masters registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MastersRegistry {
    masters: Vec<Master>,
}

impl MastersRegistry {
    pub fn new(masters: Vec<Master>) -> Self {
        Self { masters }
    }

    /// Read every master with its services
    pub async fn read(dir: &mut dyn Directory, layout: &Layout) -> Result<Self> {
        let entries = dir.search(&layout.masters(), Scope::OneLevel, None).await?;
        let mut masters = Vec::with_capacity(entries.len());
        for entry in entries {
            let host = match entry.first("cn") {
                Some(cn) => cn.to_string(),
                None => match entry.dn.rdn_value() {
                    Some(value) => value,
                    None => continue,
                },
            };
            masters.push(read_services(dir, &entry.dn, host).await?);
        }
        tracing::debug!("Read {} masters from {}", masters.len(), dir.host());
        Ok(Self { masters })
    }

    pub fn all(&self) -> &[Master] {
        &self.masters
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&Master> {
        self.masters.iter().find(|m| m.is(host))
    }

    pub fn contains(&self, host: &str) -> bool {
        self.get(host).is_some()
    }

    /// Every master except `host`
    pub fn others<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a Master> + 'a {
        self.masters.iter().filter(move |m| !m.is(host))
    }

    /// Masters providing a service
    pub fn providers<'a>(&'a self, role: &'a ServiceRole) -> impl Iterator<Item = &'a Master> + 'a {
        self.masters.iter().filter(move |m| m.provides(role))
    }

    /// True when `host` provides `role` and no other master does
    pub fn is_last_provider(&self, host: &str, role: &ServiceRole) -> bool {
        let provides = self.get(host).map(|m| m.provides(role)).unwrap_or(false);
        provides && !self.others(host).any(|m| m.provides(role))
    }

    pub fn renewal_master(&self) -> Option<&Master> {
        self.masters.iter().find(|m| m.ca_renewal_master)
    }

    pub fn dnssec_key_master(&self) -> Option<&Master> {
        self.masters.iter().find(|m| m.dnssec_key_master)
    }
}

async fn read_services(dir: &mut dyn Directory, master_dn: &Dn, host: String) -> Result<Master> {
    let services = dir.search_or_empty(master_dn, Scope::OneLevel, None).await?;
    let mut master = Master {
        host,
        services: BTreeSet::new(),
        ca_renewal_master: false,
        dnssec_key_master: false,
    };
    for service in services {
        let Some(cn) = service.first("cn").map(str::to_string).or_else(|| service.dn.rdn_value()) else {
            continue;
        };
        let role = ServiceRole::from_cn(&cn);
        let config = service.values("ipaConfigString");
        if role == ServiceRole::Ca && config.iter().any(|c| c.eq_ignore_ascii_case(CA_RENEWAL_MASTER)) {
            master.ca_renewal_master = true;
        }
        if role == ServiceRole::Dnssec && config.iter().any(|c| c.eq_ignore_ascii_case(DNSSEC_KEY_MASTER)) {
            master.dnssec_key_master = true;
        }
        master.services.insert(role);
    }
    Ok(master)
}

/// Winsync peers recorded in the shared replica info container
pub async fn read_winsync_peers(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<Peer>> {
    let entries = dir
        .search_or_empty(&layout.replicas(), Scope::OneLevel, None)
        .await?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.first("cn").map(str::to_string).or_else(|| entry.dn.rdn_value())?;
            let config = entry.first("ipaConfigString")?;
            let (kind, via) = config.split_once(':')?;
            kind.eq_ignore_ascii_case("winsync").then(|| Peer {
                name,
                kind: PeerKind::Winsync { via: via.to_string() },
            })
        })
        .collect())
}

/// Public server list: masters followed by winsync peers
pub async fn read_peers(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<Peer>> {
    let registry = MastersRegistry::read(dir, layout).await?;
    let mut peers: Vec<Peer> = registry
        .all()
        .iter()
        .map(|m| Peer {
            name: m.host.clone(),
            kind: PeerKind::Master,
        })
        .collect();
    match read_winsync_peers(dir, layout).await {
        Ok(winsync) => peers.extend(winsync),
        Err(e) => tracing::debug!("Could not read winsync peers: {}", e),
    }
    Ok(peers)
}

/// Domain level of the deployment, 0 when never raised
pub async fn domain_level(dir: &mut dyn Directory, layout: &Layout) -> Result<u32> {
    match dir.get_entry(&layout.domain_level()).await {
        Ok(entry) => Ok(entry.first_int("ipaDomainLevel").unwrap_or(0)),
        Err(Error::NotFound(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Move the CA renewal master role from one master to another
pub async fn move_renewal_master(dir: &mut dyn Directory, layout: &Layout, from: &str, to: &str) -> Result<()> {
    let from_dn = layout.master_service(from, ServiceRole::Ca.cn());
    match dir
        .modify(&from_dn, vec![Modification::delete_value("ipaConfigString", CA_RENEWAL_MASTER)])
        .await
    {
        Ok(()) | Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    let to_dn = layout.master_service(to, ServiceRole::Ca.cn());
    dir.modify(&to_dn, vec![Modification::add("ipaConfigString", CA_RENEWAL_MASTER)])
        .await?;
    tracing::info!("CA renewal master moved from {} to {}", from, to);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ClusterBuilder, Connector};

    const BASE: &str = "dc=example,dc=com";

    #[tokio::test]
    async fn test_read_registry() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA", "DNS", "KDC"])
            .master("b.example.com", 5, &["DNS"])
            .master("c.example.com", 6, &["KDC"])
            .renewal_master("a.example.com")
            .dnssec_key_master("b.example.com")
            .build()
            .await;

        let mut dir = cluster.connect("c.example.com").await.unwrap();
        let registry = MastersRegistry::read(dir.as_mut(), &layout).await.unwrap();
        dir.unbind().await;

        assert_eq!(registry.len(), 3);
        assert!(registry.is_last_provider("a.example.com", &ServiceRole::Ca));
        assert!(!registry.is_last_provider("a.example.com", &ServiceRole::Dns));
        assert!(!registry.is_last_provider("b.example.com", &ServiceRole::Ca));
        assert_eq!(registry.renewal_master().unwrap().host, "a.example.com");
        assert_eq!(registry.dnssec_key_master().unwrap().host, "b.example.com");
        assert!(registry.get("B.EXAMPLE.COM").unwrap().provides(&ServiceRole::Dnssec));
        assert_eq!(registry.others("a.example.com").count(), 2);
        assert_eq!(registry.providers(&ServiceRole::Kdc).count(), 2);
    }

    #[tokio::test]
    async fn test_peers_include_winsync() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .winsync("a.example.com", "ad.example.net", "cn=Users,dc=example,dc=net")
            .build()
            .await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        let peers = read_peers(dir.as_mut(), &layout).await.unwrap();
        assert_eq!(domain_level(dir.as_mut(), &layout).await.unwrap(), 0);
        dir.unbind().await;

        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[1],
            Peer {
                name: "ad.example.net".into(),
                kind: PeerKind::Winsync { via: "a.example.com".into() },
            }
        );
    }

    #[tokio::test]
    async fn test_move_renewal_master() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &["CA"])
            .renewal_master("b.example.com")
            .build()
            .await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        move_renewal_master(dir.as_mut(), &layout, "b.example.com", "a.example.com")
            .await
            .unwrap();
        let registry = MastersRegistry::read(dir.as_mut(), &layout).await.unwrap();
        dir.unbind().await;
        assert_eq!(registry.renewal_master().unwrap().host, "a.example.com");
    }

    #[test]
    fn test_service_role_parsing() {
        assert_eq!(ServiceRole::from_cn("ca"), ServiceRole::Ca);
        assert_eq!(ServiceRole::from_cn("HTTP"), ServiceRole::Other("HTTP".into()));
        assert_eq!(ServiceRole::Kpasswd.to_string(), "KPASSWD");
    }
}
