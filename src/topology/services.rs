//! Service continuity
//!
//! Removing a master must leave at least one CA, should leave at least one
//! DNS server, and must not silently drop the CA renewal master or the
//! DNSSEC key master roles.

use crate::cluster::ClusterContext;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::state::{move_renewal_master, MastersRegistry, ServiceRole};

/// What the continuity check decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCheck {
    /// The removed master was the last DNS server
    pub last_dns: bool,
    /// New holder of the CA renewal master role
    pub renewal_master: Option<String>,
}

/// Pick the master that takes over CA renewal from `removing`:
/// `preferred` when it runs a CA, else the first other CA master.
pub fn renewal_successor<'a>(
    registry: &'a MastersRegistry,
    removing: &str,
    preferred: &str,
) -> Option<&'a str> {
    let ca = ServiceRole::Ca;
    registry
        .get(preferred)
        .filter(|m| !m.is(removing) && m.provides(&ca))
        .or_else(|| registry.all().iter().find(|m| !m.is(removing) && m.provides(&ca)))
        .map(|m| m.host.as_str())
}

/// Check that `removing` can go and hand over its roles. `dir` is a session
/// to a surviving master.
pub async fn ensure_last_services(
    ctx: &ClusterContext,
    dir: &mut dyn Directory,
    registry: &MastersRegistry,
    removing: &str,
    preferred: &str,
    force: bool,
) -> Result<ServiceCheck> {
    let mut check = ServiceCheck::default();
    let Some(master) = registry.get(removing) else {
        tracing::debug!("{} is not in the masters registry, no services to check", removing);
        return Ok(check);
    };

    // Losing the last CA cannot be forced
    if registry.is_last_provider(removing, &ServiceRole::Ca) {
        return Err(Error::LastCaProvider);
    }

    if registry.is_last_provider(removing, &ServiceRole::Dns) {
        check.last_dns = true;
        ctx.confirm()
            .notice("Deleting this server will leave your installation without a DNS.");
        if !force {
            ctx.confirm().require("Continue to delete?")?;
        }
    }

    if master.provides(&ServiceRole::Dns) && !check.last_dns && !force && master.dnssec_key_master {
        return Err(Error::DnssecKeyMaster);
    }

    if master.ca_renewal_master {
        match renewal_successor(registry, removing, preferred) {
            Some(successor) => {
                move_renewal_master(dir, ctx.layout(), removing, successor).await?;
                check.renewal_master = Some(successor.to_string());
            }
            None => tracing::warn!("No CA master left to take over renewal from {}", removing),
        }
    }
    Ok(check)
}
