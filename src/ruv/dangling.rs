//! Dangling RUV detection
//!
//! Each reachable master reports its own replica ids and the update vectors
//! it holds. An element whose (host, rid) pair no current master claims is
//! left over from an uninstalled replica. Elements originating from a master
//! that could not be reached are never touched.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::cluster::{ClusterContext, PeerOutcome, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::state::{MastersRegistry, ServiceRole};

use super::task::{run_clean_task, TaskResult};
use super::{collect_both, replica_id, NodeRuvs};

/// What one master reported during a survey
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeObservation {
    pub host: String,
    pub online: bool,
    pub domain_rid: Option<u16>,
    pub ca_rid: Option<u16>,
    pub ruvs: NodeRuvs,
}

impl NodeObservation {
    /// A master that could not be contacted
    pub fn offline(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            online: false,
            domain_rid: None,
            ca_rid: None,
            ruvs: NodeRuvs::default(),
        }
    }

    fn self_rid(&self, suffix: Suffix) -> Option<u16> {
        match suffix {
            Suffix::Domain => self.domain_rid,
            Suffix::Ca => self.ca_rid,
        }
    }
}

/// An update vector element nobody owns any more
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DanglingRuv {
    /// Master whose vector holds the element
    pub observed_on: String,
    pub suffix: Suffix,
    pub rid: u16,
    /// Origin host, port stripped
    pub origin: String,
}

/// Outcome of a dangling RUV survey
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DanglingReport {
    pub offline: Vec<String>,
    pub dangling: Vec<DanglingRuv>,
}

impl DanglingReport {
    pub fn is_empty(&self) -> bool {
        self.dangling.is_empty()
    }

    /// Dangling elements grouped by the master that holds them
    pub fn by_host(&self) -> BTreeMap<&str, Vec<&DanglingRuv>> {
        let mut grouped: BTreeMap<&str, Vec<&DanglingRuv>> = BTreeMap::new();
        for entry in &self.dangling {
            grouped.entry(entry.observed_on.as_str()).or_default().push(entry);
        }
        grouped
    }

    /// One element per (suffix, rid), first observer wins
    pub fn to_clean(&self) -> Vec<&DanglingRuv> {
        let mut seen = BTreeSet::new();
        self.dangling
            .iter()
            .filter(|entry| seen.insert((entry.suffix, entry.rid)))
            .collect()
    }

    /// Operator-facing listing of what is about to be removed
    pub fn describe(&self) -> String {
        let mut out = String::from("These RUVs are dangling and will be removed:");
        for (host, entries) in self.by_host() {
            out.push_str(&format!("\nHost: {}", host));
            for (label, suffix) in [("RUVs", Suffix::Domain), ("CS-RUVs", Suffix::Ca)] {
                out.push_str(&format!("\n\t{}:", label));
                for entry in entries.iter().filter(|e| e.suffix == suffix) {
                    out.push_str(&format!("\n\t\tid: {}, hostname: {}", entry.rid, entry.origin));
                }
            }
        }
        out
    }
}

/// Classify the observed elements of every online master
pub fn find_dangling(observations: &[NodeObservation]) -> DanglingReport {
    let offline: BTreeSet<String> = observations
        .iter()
        .filter(|o| !o.online)
        .map(|o| o.host.to_lowercase())
        .collect();

    let mut owned = BTreeSet::new();
    for observation in observations.iter().filter(|o| o.online) {
        for suffix in Suffix::all() {
            if let Some(rid) = observation.self_rid(suffix) {
                owned.insert((suffix, observation.host.to_lowercase(), rid));
            }
        }
    }

    let mut dangling = Vec::new();
    for observation in observations.iter().filter(|o| o.online) {
        for suffix in Suffix::all() {
            let mut found = BTreeSet::new();
            for element in observation.ruvs.get(suffix) {
                let origin = element.host().to_lowercase();
                if owned.contains(&(suffix, origin.clone(), element.rid)) || offline.contains(&origin) {
                    continue;
                }
                if found.insert((element.rid, origin.clone())) {
                    dangling.push(DanglingRuv {
                        observed_on: observation.host.clone(),
                        suffix,
                        rid: element.rid,
                        origin,
                    });
                }
            }
        }
    }

    DanglingReport {
        offline: observations
            .iter()
            .filter(|o| !o.online)
            .map(|o| o.host.clone())
            .collect(),
        dangling,
    }
}

async fn observe(ctx: &ClusterContext, dir: &mut dyn Directory, host: &str, has_ca: bool) -> Result<NodeObservation> {
    let layout = ctx.layout();
    let domain_rid = replica_id(dir, layout, Suffix::Domain).await?;
    let ca_rid = if has_ca {
        replica_id(dir, layout, Suffix::Ca).await?
    } else {
        None
    };
    let ruvs = match collect_both(dir, layout, true).await {
        Ok(ruvs) => ruvs,
        Err(Error::NoRuvsFound) => NodeRuvs::default(),
        Err(e) => return Err(e),
    };
    Ok(NodeObservation {
        host: host.to_string(),
        online: true,
        domain_rid,
        ca_rid,
        ruvs,
    })
}

/// Visit every registered master and record what it reports
pub async fn survey(ctx: &ClusterContext, host: &str) -> Result<Vec<NodeObservation>> {
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let registry = MastersRegistry::read(dir.as_mut(), ctx.layout()).await;
    dir.unbind().await;
    let registry = registry?;

    let mut observations = Vec::with_capacity(registry.len());
    for master in registry.all() {
        let mut dir = match ctx.open(&master.host).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::debug!("Survey of {} failed: {}", master.host, e);
                ctx.confirm()
                    .notice(&format!("The server '{}' appears to be offline.", master.host));
                observations.push(NodeObservation::offline(&master.host));
                continue;
            }
        };
        let observation = observe(ctx, dir.as_mut(), &master.host, master.provides(&ServiceRole::Ca)).await;
        dir.unbind().await;
        let observation = observation.map_err(|e| {
            Error::Internal(format!("Failed to obtain information from '{}': {}", master.host, e))
        })?;
        observations.push(observation);
    }
    Ok(observations)
}

/// Survey the deployment and clean every dangling element once
pub async fn clean_dangling(
    ctx: &ClusterContext,
    host: &str,
    force: bool,
) -> Result<(DanglingReport, Vec<PeerOutcome<(DanglingRuv, WaitOutcome<TaskResult>)>>)> {
    let observations = survey(ctx, host).await?;
    let report = find_dangling(&observations);
    if report.is_empty() {
        tracing::info!("No dangling RUVs found");
        return Ok((report, Vec::new()));
    }

    ctx.confirm().notice(&report.describe());
    if !force {
        ctx.confirm().require("Proceed with cleaning?")?;
    }

    let mut outcomes = Vec::new();
    for entry in report.to_clean() {
        tracing::info!(
            "Cleaning {} rid {} of {} via {}",
            entry.suffix,
            entry.rid,
            entry.origin,
            entry.observed_on
        );
        let result = run_clean_task(ctx, &entry.observed_on, entry.suffix, entry.rid)
            .await
            .map(|wait| (entry.clone(), wait));
        if let Err(e) = &result {
            tracing::warn!("Cleaning rid {} on {} failed: {}", entry.rid, entry.observed_on, e);
        }
        outcomes.push(PeerOutcome::new(&entry.observed_on, result));
    }
    Ok((report, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing;
    use crate::directory::ClusterBuilder;
    use crate::ruv::RuvElement;

    const BASE: &str = "dc=example,dc=com";

    fn element(host: &str, rid: u16) -> RuvElement {
        RuvElement {
            origin: format!("{}:389", host),
            rid,
            min_csn: None,
            max_csn: None,
        }
    }

    fn online(host: &str, rid: u16, domain: Vec<RuvElement>) -> NodeObservation {
        NodeObservation {
            host: host.to_string(),
            online: true,
            domain_rid: Some(rid),
            ca_rid: None,
            ruvs: NodeRuvs {
                domain,
                ca: Vec::new(),
            },
        }
    }

    #[test]
    fn test_self_reported_ids_are_never_dangling() {
        let observations = vec![
            online("a", 4, vec![element("a", 4), element("b", 5)]),
            online("b", 5, vec![element("a", 4), element("b", 5)]),
        ];
        assert!(find_dangling(&observations).is_empty());
    }

    #[test]
    fn test_stale_and_offline_origins() {
        let observations = vec![
            online(
                "a",
                4,
                vec![element("a", 4), element("gone", 7), element("c", 6), element("a", 3)],
            ),
            online("b", 5, vec![element("b", 5), element("gone", 7)]),
            NodeObservation::offline("c"),
        ];
        let report = find_dangling(&observations);
        assert_eq!(report.offline, vec!["c".to_string()]);

        let found: Vec<(&str, u16, &str)> = report
            .dangling
            .iter()
            .map(|d| (d.observed_on.as_str(), d.rid, d.origin.as_str()))
            .collect();
        assert_eq!(found, vec![("a", 7, "gone"), ("a", 3, "a"), ("b", 7, "gone")]);

        let clean: Vec<u16> = report.to_clean().iter().map(|d| d.rid).collect();
        assert_eq!(clean, vec![7, 3]);
        assert!(report.describe().contains("\t\tid: 7, hostname: gone"));
    }

    #[test]
    fn test_report_serializes() {
        let observations = vec![online("a", 4, vec![element("a", 4), element("gone", 7)])];
        let report = find_dangling(&observations);
        let text = toml::to_string(&report).unwrap();
        assert!(text.contains("suffix = \"domain\""));
        assert!(text.contains("origin = \"gone\""));
    }

    #[tokio::test]
    async fn test_nothing_dangling_creates_no_task() {
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &[])
            .link("a.example.com", "b.example.com")
            .build()
            .await;
        let (ctx, confirm) = testing::context(&cluster, true);

        let (report, outcomes) = clean_dangling(&ctx, "a.example.com", false).await.unwrap();
        assert!(report.is_empty());
        assert!(outcomes.is_empty());
        assert!(cluster.writes().await.is_empty());
        assert!(confirm.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_clean_dangling_dedups_per_rid() {
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &["CA"])
            .master("b.example.com", 5, &["CA"])
            .master("c.example.com", 6, &[])
            .stale_ruv(Suffix::Domain, 9, "old.example.com")
            .ruv_on("a.example.com", Suffix::Ca, 1099, "old.example.com")
            .ruv_on("a.example.com", Suffix::Domain, 12, "c.example.com")
            .offline("c.example.com")
            .build()
            .await;
        let (ctx, confirm) = testing::context(&cluster, true);

        let (report, outcomes) = clean_dangling(&ctx, "a.example.com", false).await.unwrap();
        assert_eq!(report.offline, vec!["c.example.com".to_string()]);
        // rid 9 shows up on both reachable masters, rid 12 comes from an offline origin
        assert_eq!(report.dangling.len(), 3);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert!(confirm
            .transcript()
            .iter()
            .any(|l| l == "The server 'c.example.com' appears to be offline."));
        assert!(confirm.transcript().iter().any(|l| l == "Proceed with cleaning?"));

        let observations = survey(&ctx, "a.example.com").await.unwrap();
        let remaining = find_dangling(&observations);
        assert!(remaining.is_empty(), "left over: {:?}", remaining.dangling);
    }

    #[tokio::test]
    async fn test_declined_cleanup() {
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .stale_ruv(Suffix::Domain, 9, "old.example.com")
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, false);
        let err = clean_dangling(&ctx, "a.example.com", false).await.unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert!(cluster.writes().await.is_empty());
    }
}
