//! Orphan-safety check
//!
//! Removing a master must not leave one of its neighbours without any
//! replication partner. Only direct neighbours are inspected, so a removal
//! that splits the topology further away goes unnoticed.

use std::collections::{BTreeMap, BTreeSet};

use crate::agreement;
use crate::cluster::ClusterContext;
use crate::directory::Directory;
use crate::error::Result;

/// Agreement edges among masters, keyed by lowercased host name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl ReplicationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` holds an agreement towards `to`
    pub fn add_agreement(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_lowercase())
            .or_default()
            .insert(to.to_lowercase());
    }

    /// Record agreements in both directions
    pub fn link(&mut self, a: &str, b: &str) {
        self.add_agreement(a, b);
        self.add_agreement(b, a);
    }

    pub fn partners(&self, host: &str) -> Vec<&str> {
        self.edges
            .get(&host.to_lowercase())
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Neighbours of `removing` whose only partner is `removing`
    pub fn would_orphan(&self, removing: &str) -> Vec<String> {
        let removing = removing.to_lowercase();
        self.partners(&removing)
            .into_iter()
            .filter(|neighbour| {
                let partners = self.partners(neighbour);
                partners.len() == 1 && partners[0] == removing
            })
            .map(str::to_string)
            .collect()
    }
}

/// Visit every direct neighbour of the master behind `removing_dir` and
/// report the ones that would lose their last partner, joined for display.
///
/// A neighbour that cannot be reached is skipped after the operator agrees
/// (or unconditionally with `force`).
pub async fn check_last_link(
    ctx: &ClusterContext,
    removing_dir: &mut dyn Directory,
    force: bool,
) -> Result<Option<String>> {
    let removing = removing_dir.host().to_string();
    let mut graph = ReplicationGraph::new();
    let neighbours = agreement::find_ipa(removing_dir, ctx.layout()).await?;

    for neighbour in &neighbours {
        graph.add_agreement(&removing, &neighbour.remote);
        let mut dir = match ctx.open(&neighbour.remote).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("Orphan check skipped {}: {}", neighbour.remote, e);
                ctx.confirm().notice(&format!(
                    "Unable to validate that '{}' will not be orphaned.",
                    neighbour.remote
                ));
                if !force {
                    ctx.confirm().require("Continue to delete?")?;
                }
                continue;
            }
        };
        let partners = agreement::find_ipa(dir.as_mut(), ctx.layout()).await;
        dir.unbind().await;
        for partner in partners? {
            graph.add_agreement(&neighbour.remote, &partner.remote);
        }
    }

    let orphaned = graph.would_orphan(&removing);
    if orphaned.is_empty() {
        Ok(None)
    } else {
        Ok(Some(orphaned.join(", ")))
    }
}
