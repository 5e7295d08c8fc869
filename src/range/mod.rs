//! ID Range Allocator
//!
//! Every master hands out POSIX ids from its own DNA range and may keep a
//! second, on-deck range to switch to when the first runs out. Ranges never
//! overlap across masters, always sit inside one domain ID range and never
//! touch a trusted domain's range.

use serde::Serialize;

use crate::cluster::ClusterContext;
use crate::directory::{Directory, Dn, Entry, Filter, Layout, Modification, Scope};
use crate::error::{Error, Result};
use crate::state::MastersRegistry;

/// Upper bound (exclusive) of a usable id
pub const MAX_ID: u32 = i32::MAX as u32;

const UNCONFIGURED_NEXT: u32 = 1101;
const UNCONFIGURED_MAX: u32 = 1100;

/// Inclusive id interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct IdRange {
    pub start: u32,
    pub end: u32,
}

impl IdRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The `0-0` sentinel
    pub fn is_empty_marker(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        overlaps(
            self.start as u64,
            self.end as u64,
            other.start as u64,
            other.end as u64,
        )
    }
}

impl std::fmt::Display for IdRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Which of a master's two ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RangeKind {
    Current,
    OnDeck,
}

impl RangeKind {
    /// Name used in overlap messages
    pub fn label(&self) -> &'static str {
        match self {
            RangeKind::Current => "DNA range",
            RangeKind::OnDeck => "DNA next range",
        }
    }
}

/// Closed intervals `[a_start, a_end]` and `[b_start, b_end]` intersect
pub fn overlaps(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start.max(b_start) <= a_end.min(b_end)
}

/// Parse and check a `start-end` range string
pub fn validate(value: &str, allow_all_zero: bool) -> Result<IdRange> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| Error::InvalidRange("Invalid range, must be the form x-y".into()))?;
    let (start, end) = match (start.trim().parse::<i64>(), end.trim().parse::<i64>()) {
        (Ok(start), Ok(end)) => (start, end),
        _ => return Err(Error::InvalidRange("The range must consist of integers".into())),
    };

    if start == 0 && end == 0 && allow_all_zero {
        return Ok(IdRange::new(0, 0));
    }

    let max = MAX_ID as i64;
    if start <= 0 || end <= 0 || start >= max || end >= max {
        return Err(Error::InvalidRange(format!(
            "The range must consist of positive integers between 1 and {}",
            MAX_ID
        )));
    }
    if start >= end {
        return Err(Error::InvalidRange("Invalid range".into()));
    }
    Ok(IdRange::new(start as u32, end as u32))
}

/// Parse a stored `dnaNextRange` value
fn parse_stored(value: &str) -> Option<IdRange> {
    let (start, end) = value.trim().split_once('-')?;
    Some(IdRange::new(start.trim().parse().ok()?, end.trim().parse().ok()?))
}

async fn dna_config(dir: &mut dyn Directory, layout: &Layout) -> Result<Entry> {
    dir.get_entry(&layout.dna_config()).await
}

async fn remaining_values(dir: &mut dyn Directory, config: &Entry) -> Result<Option<u64>> {
    let Some(shared) = config.first("dnaSharedCfgDN") else {
        return Ok(None);
    };
    let filter = Filter::eq("dnaHostname", dir.host().to_string());
    let entries = dir
        .search_or_empty(&Dn::new(shared), Scope::OneLevel, Some(&filter))
        .await?;
    Ok(entries.iter().find_map(|e| e.first_int("dnaRemainingValues")))
}

/// The master's current range, `None` when no range is configured.
/// `NotFound` means the DNA configuration cannot be read.
pub async fn read_current(dir: &mut dyn Directory, layout: &Layout) -> Result<Option<IdRange>> {
    let config = dna_config(dir, layout).await?;
    let next: u32 = config.first_int("dnaNextValue").unwrap_or(0);
    let max: u32 = config.first_int("dnaMaxValue").unwrap_or(0);
    if next == 0 && max == 0 {
        return Ok(None);
    }
    if next == UNCONFIGURED_NEXT && max == UNCONFIGURED_MAX {
        // Fresh installs carry a placeholder until a range is assigned
        if remaining_values(dir, &config).await?.unwrap_or(0) == 0 {
            return Ok(None);
        }
    }
    Ok(Some(IdRange::new(next, max)))
}

/// The master's on-deck range, `None` when unset
pub async fn read_on_deck(dir: &mut dyn Directory, layout: &Layout) -> Result<Option<IdRange>> {
    let config = dna_config(dir, layout).await?;
    Ok(config
        .first("dnaNextRange")
        .and_then(parse_stored)
        .filter(|r| !r.is_empty_marker()))
}

pub async fn read(dir: &mut dyn Directory, layout: &Layout, kind: RangeKind) -> Result<Option<IdRange>> {
    match kind {
        RangeKind::Current => read_current(dir, layout).await,
        RangeKind::OnDeck => read_on_deck(dir, layout).await,
    }
}

/// Whether a write changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Store a range on the master. `0-0` clears an on-deck range.
pub async fn write(
    dir: &mut dyn Directory,
    layout: &Layout,
    kind: RangeKind,
    range: IdRange,
) -> Result<WriteOutcome> {
    let config = dna_config(dir, layout).await?;
    let mods = match kind {
        RangeKind::Current => {
            let next = range.start.to_string();
            let max = range.end.to_string();
            if config.first("dnaNextValue") == Some(next.as_str())
                && config.first("dnaMaxValue") == Some(max.as_str())
            {
                return Ok(WriteOutcome::Unchanged);
            }
            vec![
                Modification::replace("dnaNextValue", next),
                Modification::replace("dnaMaxValue", max),
            ]
        }
        RangeKind::OnDeck if range.is_empty_marker() => {
            if !config.has("dnaNextRange") {
                return Ok(WriteOutcome::Unchanged);
            }
            vec![Modification::clear("dnaNextRange")]
        }
        RangeKind::OnDeck => {
            let value = range.to_string();
            if config.first("dnaNextRange") == Some(value.as_str()) {
                return Ok(WriteOutcome::Unchanged);
            }
            vec![Modification::replace("dnaNextRange", value)]
        }
    };
    dir.modify(&layout.dna_config(), mods).await?;
    tracing::info!("Set {} on {} to {}", kind.label(), dir.host(), range);
    Ok(WriteOutcome::Written)
}

/// A domain or trusted domain id range definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRangeDef {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

impl IdRangeDef {
    fn from_entry(entry: &Entry) -> Option<Self> {
        Some(Self {
            name: entry
                .first("cn")
                .map(str::to_string)
                .or_else(|| entry.dn.rdn_value())
                .unwrap_or_default(),
            base: entry.first_int("ipaBaseID")?,
            size: entry.first_int("ipaIDRangeSize")?,
        })
    }

    /// Last id of the definition, as the containment check counts it
    pub fn limit(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, range: &IdRange) -> bool {
        range.start as u64 >= self.base && range.end as u64 <= self.limit()
    }

    pub fn intersects(&self, range: &IdRange) -> bool {
        overlaps(range.start as u64, range.end as u64, self.base, self.limit())
    }
}

/// Domain ID ranges. `NotFound` when the ranges container is missing.
pub async fn read_domain_ranges(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<IdRangeDef>> {
    let entries = dir
        .search(&layout.ranges(), Scope::OneLevel, Some(&Filter::object_class("ipaDomainIDRange")))
        .await?;
    Ok(entries.iter().filter_map(IdRangeDef::from_entry).collect())
}

/// Trusted domain ID ranges, empty when none exist
pub async fn read_trust_ranges(dir: &mut dyn Directory, layout: &Layout) -> Result<Vec<IdRangeDef>> {
    let entries = dir
        .search_or_empty(
            &layout.ranges(),
            Scope::OneLevel,
            Some(&Filter::object_class("ipaTrustedADDomainRange")),
        )
        .await?;
    Ok(entries.iter().filter_map(IdRangeDef::from_entry).collect())
}

/// A peer whose ranges could not be compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UncheckedPeer {
    pub host: String,
    pub reason: String,
}

/// Result of a range update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetRangeOutcome {
    pub host: String,
    pub kind: RangeKind,
    pub range: IdRange,
    pub write: WriteOutcome,
    /// Peers skipped during the overlap scan
    pub unchecked: Vec<UncheckedPeer>,
}

async fn check_peer(
    ctx: &ClusterContext,
    peer: &str,
    range: &IdRange,
    kinds: &[RangeKind],
    unchecked: &mut Vec<UncheckedPeer>,
) -> Result<()> {
    let mut dir = match ctx.open(peer).await {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!("Connection to {} failed: {}. Overlap not checked.", peer, e);
            unchecked.push(UncheckedPeer {
                host: peer.to_string(),
                reason: e.to_string(),
            });
            return Ok(());
        }
    };
    let result = async {
        for kind in kinds {
            match read(dir.as_mut(), ctx.layout(), *kind).await {
                Ok(Some(existing)) if existing.overlaps(range) => {
                    return Err(Error::RangeOverlap {
                        host: peer.to_string(),
                        kind: kind.label(),
                    })
                }
                Ok(_) => {}
                Err(Error::NotFound(_)) => {
                    tracing::warn!("{}: No permission to read DNA configuration", peer);
                    unchecked.push(UncheckedPeer {
                        host: peer.to_string(),
                        reason: "No permission to read DNA configuration".into(),
                    });
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
    .await;
    dir.unbind().await;
    result
}

async fn check_placement(dir: &mut dyn Directory, layout: &Layout, range: &IdRange) -> Result<()> {
    let domain = read_domain_ranges(dir, layout)
        .await
        .map_err(|e| Error::Internal(format!("Unable to load IPA ranges: {}", e)))?;
    if !domain.iter().any(|d| d.contains(range)) {
        return Err(Error::RangeOutsideDomain);
    }
    if let Some(trust) = read_trust_ranges(dir, layout)
        .await?
        .iter()
        .find(|t| t.intersects(range))
    {
        tracing::debug!("{} intersects trust range {}", range, trust.name);
        return Err(Error::RangeOverlapsTrust);
    }
    Ok(())
}

async fn set_on(
    ctx: &ClusterContext,
    dir: &mut dyn Directory,
    host: &str,
    range: IdRange,
    kind: RangeKind,
) -> Result<SetRangeOutcome> {
    let layout = ctx.layout();
    let mut unchecked = Vec::new();

    if !range.is_empty_marker() {
        let registry = MastersRegistry::read(dir, layout)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read master data from '{}': {}", host, e)))?;
        for master in registry.all() {
            let kinds: &[RangeKind] = match (master.is(host), kind) {
                (true, RangeKind::Current) => &[RangeKind::OnDeck],
                (true, RangeKind::OnDeck) => &[RangeKind::Current],
                (false, _) => &[RangeKind::Current, RangeKind::OnDeck],
            };
            check_peer(ctx, &master.host, &range, kinds, &mut unchecked).await?;
        }
        check_placement(dir, layout, &range).await?;
    }

    let write = match write(dir, layout, kind, range).await {
        Ok(outcome) => outcome,
        Err(Error::NotFound(_)) => {
            return Err(Error::InsufficientPrivilege("No permission to update ranges".into()))
        }
        Err(e) => return Err(e),
    };
    Ok(SetRangeOutcome {
        host: host.to_string(),
        kind,
        range,
        write,
        unchecked,
    })
}

/// Validate and store a range on `host`. Nothing is written unless every
/// reachable peer and the range definitions agree.
pub async fn set_range(ctx: &ClusterContext, host: &str, value: &str, kind: RangeKind) -> Result<SetRangeOutcome> {
    let range = validate(value, kind == RangeKind::OnDeck)?;
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let result = set_on(ctx, dir.as_mut(), host, range, kind).await;
    dir.unbind().await;
    result
}

/// Hand a freed range to the first other master without an on-deck range.
/// Returns the receiving master, `None` when the range is lost.
pub async fn redistribute(
    ctx: &ClusterContext,
    registry: &MastersRegistry,
    freed: IdRange,
    excluding: &str,
) -> Result<Option<String>> {
    for candidate in registry.others(excluding) {
        let mut dir = match ctx.open(&candidate.host).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("Connection failed: {}", e);
                continue;
            }
        };
        let result = async {
            if read_on_deck(dir.as_mut(), ctx.layout()).await?.is_some() {
                return Ok(false);
            }
            write(dir.as_mut(), ctx.layout(), RangeKind::OnDeck, freed).await?;
            Ok::<_, Error>(true)
        }
        .await;
        dir.unbind().await;
        match result {
            Ok(true) => {
                tracing::info!("Saved DNA range {} of {} on {}", freed, excluding, candidate.host);
                return Ok(Some(candidate.host.clone()));
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("{}: {}", candidate.host, e),
        }
    }
    tracing::warn!("Unable to save DNA range {}", freed);
    Ok(None)
}

/// What a master reported for one of its ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RangeStatus {
    Set(IdRange),
    NotSet,
    NoPermission,
    ConnectionFailed(String),
}

/// One line of a range listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    pub host: String,
    pub status: RangeStatus,
}

impl RangeReport {
    pub fn describe(&self, kind: RangeKind) -> String {
        match (&self.status, kind) {
            (RangeStatus::Set(range), _) => format!("{}: {}", self.host, range),
            (RangeStatus::NotSet, RangeKind::Current) => format!("{}: No range set", self.host),
            (RangeStatus::NotSet, RangeKind::OnDeck) => format!("{}: No on-deck range set", self.host),
            (RangeStatus::NoPermission, _) => {
                format!("{}: No permission to read DNA configuration", self.host)
            }
            (RangeStatus::ConnectionFailed(reason), _) => {
                format!("{}: Connection failed: {}", self.host, reason)
            }
        }
    }
}

/// List one kind of range for every master, or only for `only`
pub async fn show(ctx: &ClusterContext, host: &str, only: Option<&str>, kind: RangeKind) -> Result<Vec<RangeReport>> {
    ctx.ensure_resolvable(host).await?;
    if let Some(only) = only {
        ctx.ensure_resolvable(only).await?;
    }
    let mut dir = ctx.open(host).await?;
    let registry = MastersRegistry::read(dir.as_mut(), ctx.layout()).await;
    dir.unbind().await;
    let registry = registry?;

    let mut reports = Vec::new();
    for master in registry.all() {
        if only.map(|o| !master.is(o)).unwrap_or(false) {
            continue;
        }
        let status = match ctx.open(&master.host).await {
            Ok(mut peer) => {
                let result = read(peer.as_mut(), ctx.layout(), kind).await;
                peer.unbind().await;
                match result {
                    Ok(Some(range)) => RangeStatus::Set(range),
                    Ok(None) => RangeStatus::NotSet,
                    Err(Error::NotFound(_)) => RangeStatus::NoPermission,
                    Err(e) => RangeStatus::ConnectionFailed(e.to_string()),
                }
            }
            Err(e) => RangeStatus::ConnectionFailed(e.to_string()),
        };
        reports.push(RangeReport {
            host: master.host.clone(),
            status,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing;
    use crate::directory::{ClusterBuilder, MemoryCluster, WriteOp};

    const BASE: &str = "dc=example,dc=com";

    fn err_text(value: &str, allow_zero: bool) -> String {
        validate(value, allow_zero).unwrap_err().to_string()
    }

    #[test]
    fn test_validate_messages() {
        assert_eq!(err_text("100", false), "Invalid range, must be the form x-y");
        assert_eq!(err_text("a-b", false), "The range must consist of integers");
        assert_eq!(
            err_text("0-100", false),
            "The range must consist of positive integers between 1 and 2147483647"
        );
        assert_eq!(err_text("200-100", false), "Invalid range");
        assert_eq!(err_text("100-100", false), "Invalid range");
        assert_eq!(err_text("0-0", false), format!("The range must consist of positive integers between 1 and {}", MAX_ID));
        assert!(validate("0-0", true).unwrap().is_empty_marker());
        assert_eq!(validate("100-200", false).unwrap(), IdRange::new(100, 200));
        assert!(validate("1-2147483647", false).is_err());
    }

    #[test]
    fn test_domain_containment() {
        let def = IdRangeDef {
            name: "EXAMPLE.COM_id_range".into(),
            base: 1000,
            size: 200000,
        };
        assert!(def.contains(&IdRange::new(1000, 201000)));
        assert!(!def.contains(&IdRange::new(999, 2000)));
        assert!(def.intersects(&IdRange::new(201000, 300000)));
    }

    async fn cluster() -> MemoryCluster {
        ClusterBuilder::new(BASE)
            .master("m.example.com", 4, &[])
            .master("n.example.com", 5, &[])
            .dna_range("n.example.com", 150, 250)
            .domain_range("EXAMPLE.COM_id_range", 1, 200000)
            .trust_range("AD.EXAMPLE.ORG_id_range", 500000, 200000)
            .build()
            .await
    }

    #[tokio::test]
    async fn test_overlap_rejected_without_write() {
        let cluster = cluster().await;
        let (ctx, _) = testing::context(&cluster, true);

        let err = set_range(&ctx, "m.example.com", "100-200", RangeKind::Current)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "New range overlaps the DNA range on n.example.com");
        assert!(cluster.writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_and_unchanged() {
        let cluster = cluster().await;
        let (ctx, _) = testing::context(&cluster, true);

        let outcome = set_range(&ctx, "m.example.com", "300-400", RangeKind::Current)
            .await
            .unwrap();
        assert_eq!(outcome.write, WriteOutcome::Written);
        assert!(outcome.unchecked.is_empty());
        let again = set_range(&ctx, "m.example.com", "300-400", RangeKind::Current)
            .await
            .unwrap();
        assert_eq!(again.write, WriteOutcome::Unchanged);

        // The on-deck range of m must not overlap its own current range
        let err = set_range(&ctx, "m.example.com", "350-450", RangeKind::OnDeck)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "New range overlaps the DNA range on m.example.com");
        set_range(&ctx, "m.example.com", "401-500", RangeKind::OnDeck).await.unwrap();

        // Nor may a new current range overlap its on-deck range
        let err = set_range(&ctx, "m.example.com", "450-480", RangeKind::Current)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "New range overlaps the DNA next range on m.example.com");
        let kept = set_range(&ctx, "m.example.com", "300-400", RangeKind::Current)
            .await
            .unwrap();
        assert_eq!(kept.write, WriteOutcome::Unchanged);

        let reports = show(&ctx, "m.example.com", None, RangeKind::OnDeck).await.unwrap();
        let lines: Vec<String> = reports.iter().map(|r| r.describe(RangeKind::OnDeck)).collect();
        assert_eq!(lines, vec!["m.example.com: 401-500", "n.example.com: No on-deck range set"]);

        let cleared = set_range(&ctx, "m.example.com", "0-0", RangeKind::OnDeck).await.unwrap();
        assert_eq!(cleared.write, WriteOutcome::Written);
        let writes = cluster.writes().await;
        assert!(writes.iter().all(|w| w.op == WriteOp::Modify && w.host == "m.example.com"));
    }

    #[tokio::test]
    async fn test_placement_checks() {
        let cluster = cluster().await;
        let (ctx, _) = testing::context(&cluster, true);

        let err = set_range(&ctx, "m.example.com", "190000-210000", RangeKind::Current)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RangeOutsideDomain));

        let cluster = ClusterBuilder::new(BASE)
            .master("m.example.com", 4, &[])
            .domain_range("EXAMPLE.COM_id_range", 1, 1000000)
            .trust_range("AD.EXAMPLE.ORG_id_range", 500000, 200000)
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);
        let err = set_range(&ctx, "m.example.com", "600000-610000", RangeKind::Current)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RangeOverlapsTrust));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        let cluster = ClusterBuilder::new(BASE)
            .master("m.example.com", 4, &[])
            .master("n.example.com", 5, &[])
            .dna_range("n.example.com", 150, 250)
            .domain_range("EXAMPLE.COM_id_range", 1, 200000)
            .offline("n.example.com")
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);

        let outcome = set_range(&ctx, "m.example.com", "100-200", RangeKind::Current)
            .await
            .unwrap();
        assert_eq!(outcome.unchecked.len(), 1);
        assert_eq!(outcome.unchecked[0].host, "n.example.com");

        let err = set_range(&ctx, "n.example.com", "100-200", RangeKind::Current)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_show_and_redistribute() {
        let cluster = ClusterBuilder::new(BASE)
            .master("a.example.com", 4, &[])
            .master("b.example.com", 5, &[])
            .master("c.example.com", 6, &[])
            .dna_range("a.example.com", 1000, 1999)
            .dna_next_range("b.example.com", 5000, 5999)
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);

        let reports = show(&ctx, "a.example.com", None, RangeKind::Current).await.unwrap();
        assert_eq!(reports[0].status, RangeStatus::Set(IdRange::new(1000, 1999)));
        assert_eq!(reports[1].describe(RangeKind::Current), "b.example.com: No range set");

        let only = show(&ctx, "a.example.com", Some("b.example.com"), RangeKind::OnDeck)
            .await
            .unwrap();
        assert_eq!(only.len(), 1);

        let mut dir = ctx.open("a.example.com").await.unwrap();
        let registry = MastersRegistry::read(dir.as_mut(), ctx.layout()).await.unwrap();
        dir.unbind().await;

        let receiver = redistribute(&ctx, &registry, IdRange::new(1000, 1999), "a.example.com")
            .await
            .unwrap();
        assert_eq!(receiver.as_deref(), Some("c.example.com"));
        let lost = redistribute(&ctx, &registry, IdRange::new(7000, 7999), "a.example.com")
            .await
            .unwrap();
        assert!(lost.is_none());
    }
}
