//! Replica Update Vectors
//!
//! Every replicated suffix keeps a tombstone entry whose `nsds50ruv` values
//! list one element per replica that ever wrote to it:
//!
//! ```text
//! {replicageneration} 5f4e3a10000000040000
//! {replica 4 ldap://ipa1.example.com:389} 5f4e3a10000000040000 5f4e3b20000000040000
//! ```
//!
//! The generation record is skipped; malformed values are logged and skipped.

pub mod dangling;
pub mod task;

use serde::Serialize;

use crate::cluster::ClusterContext;
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Layout, Scope};
use crate::error::{Error, Result};

/// One replica element of an update vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuvElement {
    /// Origin as `host:port`
    pub origin: String,
    pub rid: u16,
    pub min_csn: Option<String>,
    pub max_csn: Option<String>,
}

impl RuvElement {
    /// Origin host without the port
    pub fn host(&self) -> &str {
        match self.origin.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.origin,
        }
    }
}

/// A parsed `nsds50ruv` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuvRecord {
    Generation,
    Replica(RuvElement),
}

/// Parse one `nsds50ruv` value. `None` when the value is malformed.
pub fn parse_ruv_value(value: &str) -> Option<RuvRecord> {
    let value = value.trim();
    if value.starts_with("{replicageneration") {
        return Some(RuvRecord::Generation);
    }

    let body = value.strip_prefix("{replica ")?;
    let (inner, rest) = body.split_once('}')?;
    let mut parts = inner.split_whitespace();
    let rid: u16 = parts.next()?.parse().ok()?;
    let url = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let (scheme, netloc) = url.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("ldap") && !scheme.eq_ignore_ascii_case("ldaps") {
        return None;
    }
    let netloc = netloc.split('/').next().unwrap_or_default();
    let (host, port) = netloc.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut csns = rest.split_whitespace();
    Some(RuvRecord::Replica(RuvElement {
        origin: netloc.to_string(),
        rid,
        min_csn: csns.next().map(str::to_string),
        max_csn: csns.next().map(str::to_string),
    }))
}

/// Update vectors of both suffixes as seen by one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeRuvs {
    pub domain: Vec<RuvElement>,
    pub ca: Vec<RuvElement>,
}

impl NodeRuvs {
    pub fn get(&self, suffix: Suffix) -> &[RuvElement] {
        match suffix {
            Suffix::Domain => &self.domain,
            Suffix::Ca => &self.ca,
        }
    }

    /// Locate a replica id, domain suffix first
    pub fn find_rid(&self, rid: u16) -> Option<(Suffix, &RuvElement)> {
        Suffix::all()
            .into_iter()
            .find_map(|suffix| self.get(suffix).iter().find(|e| e.rid == rid).map(|e| (suffix, e)))
    }
}

/// Read the update vector of one suffix
pub async fn collect(dir: &mut dyn Directory, layout: &Layout, suffix: Suffix) -> Result<Vec<RuvElement>> {
    let filter = layout.tombstone_filter();
    let entries = match dir
        .search(&layout.suffix(suffix), Scope::Subtree, Some(&filter))
        .await
    {
        Ok(entries) => entries,
        Err(Error::NotFound(_)) => return Err(Error::NoRuvsFound),
        Err(e) => return Err(e),
    };
    if entries.is_empty() {
        return Err(Error::NoRuvsFound);
    }

    let mut elements = Vec::new();
    for entry in &entries {
        for value in entry.values("nsds50ruv") {
            match parse_ruv_value(value) {
                Some(RuvRecord::Replica(element)) => elements.push(element),
                Some(RuvRecord::Generation) => {}
                None => tracing::warn!("unable to decode: {}", value),
            }
        }
    }
    Ok(elements)
}

/// Read both update vectors from one node.
///
/// A suffix without a tombstone is simply empty. Connectivity failures fail
/// the call unless `best_effort` is set.
pub async fn collect_both(dir: &mut dyn Directory, layout: &Layout, best_effort: bool) -> Result<NodeRuvs> {
    let mut ruvs = NodeRuvs::default();
    for suffix in [Suffix::Ca, Suffix::Domain] {
        let elements = match collect(dir, layout, suffix).await {
            Ok(elements) => elements,
            Err(Error::NoRuvsFound) => {
                tracing::debug!("No {} RUVs on {}", suffix, dir.host());
                Vec::new()
            }
            Err(e) if best_effort || !e.is_connectivity() => {
                tracing::debug!("Failed to get {} RUVs from {}: {}", suffix, dir.host(), e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        match suffix {
            Suffix::Domain => ruvs.domain = elements,
            Suffix::Ca => ruvs.ca = elements,
        }
    }

    if ruvs.domain.is_empty() && ruvs.ca.is_empty() {
        return Err(Error::NoRuvsFound);
    }
    Ok(ruvs)
}

/// Connect to `host` and read both update vectors
pub async fn collect_from(ctx: &ClusterContext, host: &str, best_effort: bool) -> Result<NodeRuvs> {
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let result = collect_both(dir.as_mut(), ctx.layout(), best_effort).await;
    dir.unbind().await;
    result
}

/// Replica id a node reports for itself on a suffix
pub async fn replica_id(dir: &mut dyn Directory, layout: &Layout, suffix: Suffix) -> Result<Option<u16>> {
    match dir.get_entry(&layout.replica(suffix)).await {
        Ok(entry) => Ok(entry.first_int("nsDS5ReplicaID")),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replica id of `host` in the domain update vector seen by `dir`
pub async fn rid_for_host(dir: &mut dyn Directory, layout: &Layout, host: &str) -> Result<Option<u16>> {
    let elements = match collect(dir, layout, Suffix::Domain).await {
        Ok(elements) => elements,
        Err(Error::NoRuvsFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(elements
        .iter()
        .find(|e| e.host().eq_ignore_ascii_case(host))
        .map(|e| e.rid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing;
    use crate::directory::{ClusterBuilder, Connector};

    const BASE: &str = "dc=example,dc=com";

    #[test]
    fn test_parse_replica_value() {
        let record = parse_ruv_value("{replica 5 ldap://foo.example:389}").unwrap();
        let RuvRecord::Replica(element) = record else {
            panic!("expected a replica element");
        };
        assert_eq!(element.origin, "foo.example:389");
        assert_eq!(element.host(), "foo.example");
        assert_eq!(element.rid, 5);
        assert!(element.min_csn.is_none());
    }

    #[test]
    fn test_parse_with_csns() {
        let value = "{replica 1095 ldap://ca1.example.com:389} 5f4e3a10000004470000 5f4e3b20000004470000";
        let Some(RuvRecord::Replica(element)) = parse_ruv_value(value) else {
            panic!("expected a replica element");
        };
        assert_eq!(element.rid, 1095);
        assert_eq!(element.min_csn.as_deref(), Some("5f4e3a10000004470000"));
        assert_eq!(element.max_csn.as_deref(), Some("5f4e3b20000004470000"));
    }

    #[test]
    fn test_generation_and_malformed() {
        assert_eq!(
            parse_ruv_value("{replicageneration} 5f4e3a10000000040000"),
            Some(RuvRecord::Generation)
        );
        assert_eq!(parse_ruv_value("{replica x ldap://a:389}"), None);
        assert_eq!(parse_ruv_value("{replica 4 ldap://a}"), None);
        assert_eq!(parse_ruv_value("{replica 4 http://a:80}"), None);
        assert_eq!(parse_ruv_value("garbage"), None);
    }

    #[tokio::test]
    async fn test_collect_both_suffixes() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &[])
            .build()
            .await;

        let mut dir = cluster.connect("a.example.com").await.unwrap();
        let ruvs = collect_both(dir.as_mut(), &layout, false).await.unwrap();
        assert_eq!(ruvs.domain.len(), 2);
        assert_eq!(ruvs.ca.len(), 1);
        assert_eq!(ruvs.find_rid(1004).map(|(s, e)| (s, e.host())), Some((Suffix::Ca, "a.example.com")));
        assert_eq!(replica_id(dir.as_mut(), &layout, Suffix::Domain).await.unwrap(), Some(4));
        assert_eq!(rid_for_host(dir.as_mut(), &layout, "b.example.com").await.unwrap(), Some(5));
        dir.unbind().await;

        // No CA on b: the CA half is silently empty.
        let mut dir = cluster.connect("b.example.com").await.unwrap();
        let ruvs = collect_both(dir.as_mut(), &layout, false).await.unwrap();
        assert!(ruvs.ca.is_empty());
        assert_eq!(replica_id(dir.as_mut(), &layout, Suffix::Ca).await.unwrap(), None);
        dir.unbind().await;
    }

    #[tokio::test]
    async fn test_malformed_values_are_skipped() {
        let layout = Layout::new(BASE);
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .build()
            .await;
        let dn = layout
            .suffix(Suffix::Domain)
            .child("nsuniqueid", crate::directory::layout::RUV_TOMBSTONE_ID);
        let mut tombstone = cluster.entry("a.example.com", &dn).await.unwrap();
        let mut values = tombstone.values("nsds50ruv").to_vec();
        values.push("{replica bogus}".into());
        tombstone.set("nsds50ruv", values);
        cluster.put_entry("a.example.com", tombstone).await;

        let (ctx, _) = testing::context(&cluster, true);
        let ruvs = collect_from(&ctx, "a.example.com", false).await.unwrap();
        assert_eq!(ruvs.domain.len(), 1);
    }

    #[tokio::test]
    async fn test_no_tombstone_is_no_ruvs() {
        let cluster = crate::directory::MemoryCluster::new();
        cluster.add_host("bare.example.com").await;
        let (ctx, _) = testing::context(&cluster, true);
        let err = collect_from(&ctx, "bare.example.com", false).await.unwrap_err();
        assert!(matches!(err, Error::NoRuvsFound));

        cluster.set_offline("bare.example.com", true).await;
        let err = collect_from(&ctx, "bare.example.com", true).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
