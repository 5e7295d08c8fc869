//! CLEANALLRUV tasks
//!
//! Cleaning a replica id is a server-side task: an entry is added below
//! `cn=cleanallruv,cn=tasks,cn=config` and the server reports completion by
//! setting `nsTaskExitCode` on it. Aborting works the same way.

use serde::Serialize;

use crate::cluster::{ClusterContext, WaitOutcome};
use crate::directory::layout::Suffix;
use crate::directory::{Directory, Dn, Entry, Layout, Scope};
use crate::error::{Error, Result};

use super::{collect_both, RuvElement};

/// Final state of a server task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    /// `None` when the task entry disappeared before it could be read
    pub exit_code: Option<i32>,
    pub status: Option<String>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }
}

/// A task entry found in one of the task containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub rid: String,
    pub status: Option<String>,
    pub log: Option<String>,
}

/// Active clean and abort tasks on a node. `None` means the container is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskListing {
    pub clean: Option<Vec<TaskInfo>>,
    pub abort: Option<Vec<TaskInfo>>,
}

/// Outcome of a clean or abort request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub rid: u16,
    pub suffix: Suffix,
    /// Origin of the replica id in the update vector
    pub origin: String,
    pub wait: WaitOutcome<TaskResult>,
}

/// Parse an operator-supplied replica id
pub fn parse_rid(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidReplicaId(value.to_string()))
}

/// Add a CLEANALLRUV task entry for `rid` on `suffix`
pub async fn create_clean_task(dir: &mut dyn Directory, layout: &Layout, suffix: Suffix, rid: u16) -> Result<Dn> {
    let dn = layout.clean_task(rid);
    let entry = Entry::new(dn.clone())
        .with("objectClass", ["top", "extensibleObject"])
        .with("cn", [format!("clean {}", rid)])
        .with("replica-base-dn", [layout.suffix(suffix).to_string()])
        .with("replica-id", [rid.to_string()])
        .with("replica-force-cleaning", ["no"]);
    dir.add_entry(entry).await?;
    tracing::info!("Created CLEANALLRUV task for rid {} on {} ({})", rid, dir.host(), suffix);
    Ok(dn)
}

/// Add an abort task for a running CLEANALLRUV of `rid`
pub async fn create_abort_task(
    dir: &mut dyn Directory,
    layout: &Layout,
    suffix: Suffix,
    rid: u16,
    force: bool,
) -> Result<Dn> {
    let dn = layout.abort_task(rid);
    let certify = if force { "no" } else { "yes" };
    let entry = Entry::new(dn.clone())
        .with("objectClass", ["top", "extensibleObject"])
        .with("cn", [format!("abort {}", rid)])
        .with("replica-base-dn", [layout.suffix(suffix).to_string()])
        .with("replica-id", [rid.to_string()])
        .with("replica-certify-all", [certify]);
    dir.add_entry(entry).await?;
    tracing::info!("Created abort CLEANALLRUV task for rid {} on {}", rid, dir.host());
    Ok(dn)
}

/// Poll a task entry until it reports an exit code
pub async fn wait_for_task(ctx: &ClusterContext, dir: &mut dyn Directory, dn: &Dn) -> Result<WaitOutcome<TaskResult>> {
    let deadline = ctx.deadline(ctx.polling().task_timeout());
    loop {
        match dir.get_entry(dn).await {
            Ok(entry) => {
                if let Some(code) = entry.first_int::<i32>("nsTaskExitCode") {
                    return Ok(WaitOutcome::Finished(TaskResult {
                        exit_code: Some(code),
                        status: entry.first("nsTaskStatus").map(str::to_string),
                    }));
                }
                tracing::debug!("Task {} still running: {:?}", dn, entry.first("nsTaskStatus"));
            }
            Err(Error::NotFound(_)) => {
                return Ok(WaitOutcome::Finished(TaskResult {
                    exit_code: None,
                    status: None,
                }))
            }
            Err(e) => return Err(e),
        }
        if let Err(stop) = ctx.tick(deadline).await {
            return Ok(stop.into());
        }
    }
}

/// Run a CLEANALLRUV task on `host` and wait for it
pub async fn run_clean_task(ctx: &ClusterContext, host: &str, suffix: Suffix, rid: u16) -> Result<WaitOutcome<TaskResult>> {
    let mut dir = ctx.open(host).await?;
    let result = async {
        let dn = create_clean_task(dir.as_mut(), ctx.layout(), suffix, rid).await?;
        wait_for_task(ctx, dir.as_mut(), &dn).await
    }
    .await;
    dir.unbind().await;
    result
}

async fn locate_rid(ctx: &ClusterContext, dir: &mut dyn Directory, rid: u16) -> Result<(Suffix, RuvElement)> {
    let ruvs = collect_both(dir, ctx.layout(), false).await?;
    ruvs.find_rid(rid)
        .map(|(suffix, element)| (suffix, element.clone()))
        .ok_or(Error::ReplicaIdNotFound(rid))
}

/// Clean a replica id after locating it in `host`'s update vectors
pub async fn clean_ruv(ctx: &ClusterContext, host: &str, rid: &str, force: bool) -> Result<TaskRun> {
    let rid = parse_rid(rid)?;
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let result = clean_located(ctx, dir.as_mut(), rid, force).await;
    dir.unbind().await;
    result
}

async fn clean_located(ctx: &ClusterContext, dir: &mut dyn Directory, rid: u16, force: bool) -> Result<TaskRun> {
    let (suffix, element) = locate_rid(ctx, dir, rid).await?;
    let confirm = ctx.confirm();
    match suffix {
        Suffix::Ca => confirm.notice(&format!(
            "Clean the Certificate Server Replication Update Vector for {}",
            element.origin
        )),
        Suffix::Domain => confirm.notice(&format!(
            "Clean the Replication Update Vector for {}",
            element.origin
        )),
    }

    if !force {
        confirm.notice(
            "\nCleaning the wrong replica ID will cause that server to no\n\
             longer replicate so it may miss updates while the process\n\
             is running. It would need to be re-initialized to maintain\n\
             consistency. Be very careful.",
        );
        confirm.require("Continue to clean?")?;
    }

    let dn = create_clean_task(dir, ctx.layout(), suffix, rid).await?;
    let wait = wait_for_task(ctx, dir, &dn).await?;
    Ok(TaskRun {
        rid,
        suffix,
        origin: element.origin,
        wait,
    })
}

/// Abort a running CLEANALLRUV of a replica id
pub async fn abort_clean_ruv(ctx: &ClusterContext, host: &str, rid: &str, force: bool) -> Result<TaskRun> {
    let rid = parse_rid(rid)?;
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let result = async {
        let (suffix, element) = locate_rid(ctx, dir.as_mut(), rid).await?;
        ctx.confirm().notice(&format!(
            "Aborting the clean Replication Update Vector task for {}\n",
            element.origin
        ));
        let dn = create_abort_task(dir.as_mut(), ctx.layout(), suffix, rid, force).await?;
        let wait = wait_for_task(ctx, dir.as_mut(), &dn).await?;
        Ok(TaskRun {
            rid,
            suffix,
            origin: element.origin,
            wait,
        })
    }
    .await;
    dir.unbind().await;
    result
}

fn task_infos(entries: Vec<Entry>, prefix: &str) -> Vec<TaskInfo> {
    entries
        .into_iter()
        .map(|entry| {
            let cn = entry
                .first("cn")
                .map(str::to_string)
                .or_else(|| entry.dn.rdn_value())
                .unwrap_or_default();
            TaskInfo {
                rid: cn.strip_prefix(prefix).unwrap_or(&cn).to_string(),
                status: entry.first("nsTaskStatus").map(str::to_string),
                log: entry.first("nsTaskLog").map(str::to_string),
            }
        })
        .collect()
}

/// List clean and abort tasks known to `host`
pub async fn list_clean_tasks(ctx: &ClusterContext, host: &str) -> Result<TaskListing> {
    ctx.ensure_resolvable(host).await?;
    let mut dir = ctx.open(host).await?;
    let result = async {
        let layout = ctx.layout();
        let mut listing = TaskListing::default();
        match dir.search(&layout.cleanallruv_tasks(), Scope::OneLevel, None).await {
            Ok(entries) => listing.clean = Some(task_infos(entries, "clean ")),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match dir.search(&layout.abort_tasks(), Scope::OneLevel, None).await {
            Ok(entries) => listing.abort = Some(task_infos(entries, "abort ")),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(listing)
    }
    .await;
    dir.unbind().await;
    result
}
