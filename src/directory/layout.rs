//! Directory layout
//!
//! Every DN the tool reads or writes, derived from the domain base DN.

use serde::Serialize;

use super::{Dn, Filter};

/// Suffix of the certificate subsystem database
pub const CA_SUFFIX: &str = "o=ipaca";

/// Unique id carried by the RUV tombstone of every replicated suffix
pub const RUV_TOMBSTONE_ID: &str = "ffffffff-ffffffff-ffffffff-ffffffff";

/// One of the two replicated suffixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Suffix {
    Domain,
    Ca,
}

impl Suffix {
    pub fn all() -> [Suffix; 2] {
        [Suffix::Domain, Suffix::Ca]
    }
}

impl std::fmt::Display for Suffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suffix::Domain => write!(f, "domain"),
            Suffix::Ca => write!(f, "ca"),
        }
    }
}

/// DN factory for one deployment
#[derive(Debug, Clone)]
pub struct Layout {
    basedn: Dn,
}

impl Layout {
    pub fn new(basedn: impl Into<String>) -> Self {
        Self {
            basedn: Dn::new(basedn.into()),
        }
    }

    pub fn basedn(&self) -> &Dn {
        &self.basedn
    }

    /// Database suffix DN
    pub fn suffix(&self, suffix: Suffix) -> Dn {
        match suffix {
            Suffix::Domain => self.basedn.clone(),
            Suffix::Ca => Dn::new(CA_SUFFIX),
        }
    }

    fn etc_ipa(&self) -> Dn {
        self.basedn.child("cn", "etc").child("cn", "ipa")
    }

    /// Masters registry container
    pub fn masters(&self) -> Dn {
        self.etc_ipa().child("cn", "masters")
    }

    pub fn master(&self, host: &str) -> Dn {
        self.masters().child("cn", host)
    }

    pub fn master_service(&self, host: &str, service: &str) -> Dn {
        self.master(host).child("cn", service)
    }

    /// Winsync shared info container
    pub fn replicas(&self) -> Dn {
        self.etc_ipa().child("cn", "replicas")
    }

    pub fn replica_info(&self, peer: &str) -> Dn {
        self.replicas().child("cn", peer)
    }

    pub fn domain_level(&self) -> Dn {
        self.etc_ipa().child("cn", "Domain Level")
    }

    /// ID range definitions
    pub fn ranges(&self) -> Dn {
        self.basedn.child("cn", "etc").child("cn", "ranges")
    }

    pub fn certificates(&self) -> Dn {
        self.etc_ipa().child("cn", "certificates")
    }

    pub fn passsync(&self) -> Dn {
        self.basedn
            .child("cn", "etc")
            .child("cn", "sysaccounts")
            .child("uid", "passsync")
    }

    pub fn dns(&self) -> Dn {
        self.basedn.child("cn", "dns")
    }

    /// Default subtree synchronised by winsync agreements
    pub fn default_win_subtree(&self) -> Dn {
        self.basedn.child("cn", "Users")
    }

    /// Kerberos realm implied by the base DN
    pub fn realm(&self) -> String {
        self.basedn
            .rdns()
            .iter()
            .filter_map(|rdn| rdn.split_once('='))
            .filter(|(attr, _)| attr.trim().eq_ignore_ascii_case("dc"))
            .map(|(_, value)| value.trim().to_uppercase())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Service principal a peer uses when binding for replication
    pub fn ldap_principal(&self, host: &str) -> Dn {
        self.basedn
            .child("cn", "accounts")
            .child("cn", "services")
            .child("krbprincipalname", &format!("ldap/{}@{}", host, self.realm()))
    }

    fn mapping_tree(&self, suffix: Suffix) -> Dn {
        Dn::new("cn=config")
            .child("cn", "mapping tree")
            .child("cn", self.suffix(suffix).as_str())
    }

    /// Replica configuration entry of a suffix
    pub fn replica(&self, suffix: Suffix) -> Dn {
        self.mapping_tree(suffix).child("cn", "replica")
    }

    /// Agreement entry on this node pointing at `remote`
    pub fn agreement(&self, suffix: Suffix, remote: &str) -> Dn {
        self.replica(suffix).child("cn", &format!("meTo{}", remote))
    }

    /// Filter matching the RUV tombstone of a suffix
    pub fn tombstone_filter(&self) -> Filter {
        Filter::And(vec![
            Filter::eq("nsuniqueid", RUV_TOMBSTONE_ID),
            Filter::object_class("nstombstone"),
        ])
    }

    pub fn cleanallruv_tasks(&self) -> Dn {
        tasks().child("cn", "cleanallruv")
    }

    pub fn clean_task(&self, rid: u16) -> Dn {
        self.cleanallruv_tasks().child("cn", &format!("clean {}", rid))
    }

    pub fn abort_tasks(&self) -> Dn {
        tasks().child("cn", "abort cleanallruv")
    }

    pub fn abort_task(&self, rid: u16) -> Dn {
        self.abort_tasks().child("cn", &format!("abort {}", rid))
    }

    pub fn memberof_task(&self, name: &str) -> Dn {
        tasks().child("cn", "memberof task").child("cn", name)
    }

    /// DNA plugin configuration for POSIX ids
    pub fn dna_config(&self) -> Dn {
        Dn::new("cn=config")
            .child("cn", "plugins")
            .child("cn", "Distributed Numeric Assignment Plugin")
            .child("cn", "Posix IDs")
    }

    /// Backend whose read-only flag is toggled while draining a node
    pub fn userroot_backend(&self) -> Dn {
        Dn::new("cn=config")
            .child("cn", "plugins")
            .child("cn", "ldbm database")
            .child("cn", "userRoot")
    }

    pub fn config(&self) -> Dn {
        Dn::new("cn=config")
    }
}

fn tasks() -> Dn {
    Dn::new("cn=config").child("cn", "tasks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_dns() {
        let layout = Layout::new("dc=example,dc=com");
        assert_eq!(
            layout.master("ipa1.example.com"),
            Dn::new("cn=ipa1.example.com,cn=masters,cn=ipa,cn=etc,dc=example,dc=com")
        );
        assert_eq!(
            layout.agreement(Suffix::Domain, "ipa2.example.com").as_str(),
            "cn=meToipa2.example.com,cn=replica,cn=dc\\=example\\,dc\\=com,cn=mapping tree,cn=config"
        );
        assert_eq!(
            layout.replica(Suffix::Ca),
            Dn::new("cn=replica,cn=o\\=ipaca,cn=mapping tree,cn=config")
        );
        assert_eq!(
            layout.clean_task(7),
            Dn::new("cn=clean 7,cn=cleanallruv,cn=tasks,cn=config")
        );
        assert_eq!(
            layout.dna_config(),
            Dn::new("cn=posix ids,cn=distributed numeric assignment plugin,cn=plugins,cn=config")
        );
        assert_eq!(layout.ranges(), Dn::new("cn=ranges,cn=etc,dc=example,dc=com"));
        assert_eq!(
            layout.ldap_principal("a.example.com"),
            Dn::new("krbprincipalname=ldap/a.example.com@EXAMPLE.COM,cn=services,cn=accounts,dc=example,dc=com")
        );
    }

    #[test]
    fn test_agreement_is_under_replica() {
        let layout = Layout::new("dc=example,dc=com");
        let agreement = layout.agreement(Suffix::Ca, "b.example.com");
        assert!(agreement.is_child_of(&layout.replica(Suffix::Ca)));
        assert_eq!(agreement.rdn_value().as_deref(), Some("meTob.example.com"));
    }
}
