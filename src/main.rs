//! replicactl - Replication topology manager
//!
//! Manages replication agreements, replica update vectors and DNA ranges of
//! a multi-master directory cluster from any of its masters.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replicactl::agreement::Agreement;
use replicactl::cluster::{ClusterContext, WaitOutcome};
use replicactl::config::{realm_to_suffix, ReplicaCtlConfig};
use replicactl::directory::{Layout, LdapConnector, LdapSettings};
use replicactl::error::Result;
use replicactl::prompt::{read_password, Interrupt};
use replicactl::range::{self, RangeKind, WriteOutcome};
use replicactl::ruv::task::{self, TaskResult};
use replicactl::ruv::{self, dangling};
use replicactl::topology::{self, LinkRemoval, LinkRequest, Listing, NodeRemoval, WinsyncOptions};

/// replicactl - Manage the replication topology of a directory cluster
#[derive(Parser)]
#[command(name = "replicactl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Starting host (defaults to this machine)
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Directory Manager password
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Provide additional information
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Provide debugging information
    #[arg(short, long, global = true)]
    debug: bool,

    /// Ignore some types of errors and skip confirmations
    #[arg(short, long, global = true)]
    force: bool,

    /// DANGER: clean up references to a ghost master
    #[arg(short, long, global = true)]
    cleanup: bool,

    /// Do not perform DNS lookups
    #[arg(long, global = true)]
    no_lookup: bool,

    /// Path to config file
    #[arg(long, global = true, default_value = "/etc/replicactl/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List masters, or the agreements of one of them
    List {
        replica: Option<String>,
    },
    /// List replica update vectors of the starting host
    ListRuv,
    /// Create a replication agreement
    Connect {
        host1: String,
        host2: Option<String>,

        /// Create a winsync agreement to an Active Directory server
        #[arg(long)]
        winsync: bool,

        /// Bind DN on the Active Directory server
        #[arg(long)]
        binddn: Option<String>,

        /// Password of the bind DN
        #[arg(long)]
        bindpw: Option<String>,

        /// PEM CA certificate of the Active Directory server
        #[arg(long)]
        cacert: Option<PathBuf>,

        /// Subtree of the Active Directory to synchronize
        #[arg(long)]
        win_subtree: Option<String>,

        /// Password for the PassSync user
        #[arg(long)]
        passsync: Option<String>,
    },
    /// Remove a replication agreement
    Disconnect {
        host1: String,
        host2: Option<String>,
    },
    /// Remove a master from the deployment
    Del {
        master: String,
    },
    /// Re-initialize the starting host from another master
    ReInitialize {
        /// Master to pull the data from
        #[arg(long)]
        from: Option<String>,
    },
    /// Push pending changes from another master now
    ForceSync {
        /// Master to push the changes
        #[arg(long)]
        from: Option<String>,
    },
    /// Run CLEANALLRUV for a replica id
    CleanRuv {
        rid: String,
    },
    /// Abort a running CLEANALLRUV
    AbortCleanRuv {
        rid: String,
    },
    /// List CLEANALLRUV and abort tasks
    ListCleanRuv,
    /// Remove update vectors of masters that no longer exist
    CleanDanglingRuv,
    /// Show DNA ranges
    DnarangeShow {
        master: Option<String>,
    },
    /// Show on-deck DNA ranges
    DnanextrangeShow {
        master: Option<String>,
    },
    /// Set the DNA range of a master
    DnarangeSet {
        master: String,
        range: String,
    },
    /// Set the on-deck DNA range of a master
    DnanextrangeSet {
        master: String,
        range: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        config.logging.level.as_str()
    };
    init_logging(level, &config.logging.format);

    let (ctx, host) = match build_context(&cli, &config) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match dispatch(&cli, &ctx, &host).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("{:?}", e);
            if e.exit_code() == 0 {
                println!("{}", e);
            } else {
                eprintln!("{}", e);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if format == "compact" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ReplicaCtlConfig> {
    ReplicaCtlConfig::load_or_default(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

/// Starting host: command line, then config, then the local host name
fn starting_host(cli: &Cli, config: &ReplicaCtlConfig) -> anyhow::Result<String> {
    if let Some(host) = cli.host.clone().or_else(|| config.node.host.clone()) {
        return Ok(host);
    }
    let name = hostname::get().context("Unable to determine the local host name")?;
    Ok(name.to_string_lossy().into_owned())
}

fn base_dn(config: &ReplicaCtlConfig, host: &str) -> anyhow::Result<String> {
    if config.node.basedn.is_some() || config.node.realm.is_some() {
        return Ok(config.basedn()?);
    }
    match host.split_once('.') {
        Some((_, domain)) if !domain.is_empty() => Ok(realm_to_suffix(domain)),
        _ => anyhow::bail!("Cannot derive the base DN from '{}', set node.realm in the configuration", host),
    }
}

fn directory_password(cli: &Cli, config: &ReplicaCtlConfig) -> anyhow::Result<String> {
    if let Some(password) = &cli.password {
        return Ok(password.clone());
    }
    if let Some(password) = config.password_from_file()? {
        return Ok(password);
    }
    let password = read_password("Directory Manager")?;
    if password.is_empty() {
        anyhow::bail!("Directory Manager password required");
    }
    Ok(password)
}

/// Context for the run plus the starting host
fn build_context(cli: &Cli, config: &ReplicaCtlConfig) -> anyhow::Result<(ClusterContext, String)> {
    let host = starting_host(cli, config)?;
    let basedn = base_dn(config, &host)?;
    let password = directory_password(cli, config)?;

    let interrupt = Interrupt::new();
    interrupt.install()?;

    let settings = LdapSettings::from_config(&config.directory, password);
    tracing::debug!("Managing {} from {} with {:?}", basedn, host, settings);
    let ctx = ClusterContext::new(Arc::new(LdapConnector::new(settings)), Layout::new(basedn))
        .with_polling(config.polling.clone())
        .with_interrupt(interrupt)
        .with_lookup(!cli.no_lookup);
    Ok((ctx, host))
}

async fn dispatch(cli: &Cli, ctx: &ClusterContext, host: &str) -> Result<ExitCode> {
    match &cli.command {
        Commands::List { replica } => list(ctx, host, replica.as_deref(), cli.verbose).await?,
        Commands::ListRuv => list_ruv(ctx, host).await?,
        Commands::Connect {
            host1,
            host2,
            winsync,
            binddn,
            bindpw,
            cacert,
            win_subtree,
            passsync,
        } => {
            let (local, remote) = endpoints(host, host1, host2.as_deref());
            let request = if *winsync {
                LinkRequest::winsync(
                    local,
                    remote,
                    WinsyncOptions {
                        bind_dn: binddn.clone(),
                        bind_password: bindpw.clone(),
                        cacert: cacert.clone(),
                        passsync: passsync.clone(),
                        subtree: win_subtree.clone(),
                    },
                )
            } else {
                LinkRequest::ipa(local, remote)
            };
            let is_root = nix::unistd::Uid::effective().is_root();
            let created = topology::add_link(ctx, request, is_root).await?;
            print_wait("Update", &created.init);
            println!("Connected '{}' to '{}'", created.local, created.remote);
        }
        Commands::Disconnect { host1, host2 } => {
            let (from, to) = endpoints(host, host1, host2.as_deref());
            let removal = topology::disconnect(ctx, &from, &to, cli.force).await?;
            print_link_removal(&removal);
        }
        Commands::Del { master } => del(ctx, host, master, cli.force, cli.cleanup).await?,
        Commands::ReInitialize { from } => {
            let Some(from) = from else {
                println!("re-initialize requires the option --from <host name>");
                return Ok(ExitCode::FAILURE);
            };
            let done = topology::reinitialize(ctx, host, from).await?;
            print_wait("Update", &done.init);
            if let Some(memberof) = &done.memberof {
                print_task(memberof);
            }
        }
        Commands::ForceSync { from } => {
            let Some(from) = from else {
                println!("force-sync requires the option --from <host name>");
                return Ok(ExitCode::FAILURE);
            };
            let synced = topology::force_sync(ctx, host, from).await?;
            if let Some(init) = &synced.init {
                print_wait("Update", init);
            }
        }
        Commands::CleanRuv { rid } => {
            let run = task::clean_ruv(ctx, host, rid, cli.force).await?;
            print_task(&run.wait);
            println!("Cleanup task created");
        }
        Commands::AbortCleanRuv { rid } => {
            let run = task::abort_clean_ruv(ctx, host, rid, cli.force).await?;
            print_task(&run.wait);
            println!("Cleanup task stopped");
        }
        Commands::ListCleanRuv => list_clean_ruv(ctx, host, cli.verbose).await?,
        Commands::CleanDanglingRuv => clean_dangling_ruv(ctx, host, cli.force).await?,
        Commands::DnarangeShow { master } => show_ranges(ctx, host, master.as_deref(), RangeKind::Current).await?,
        Commands::DnanextrangeShow { master } => show_ranges(ctx, host, master.as_deref(), RangeKind::OnDeck).await?,
        Commands::DnarangeSet { master, range } => set_range(ctx, master, range, RangeKind::Current).await?,
        Commands::DnanextrangeSet { master, range } => set_range(ctx, master, range, RangeKind::OnDeck).await?,
    }
    Ok(ExitCode::SUCCESS)
}

/// With one host the starting host is the first end
fn endpoints(start: &str, host1: &str, host2: Option<&str>) -> (String, String) {
    match host2 {
        Some(host2) => (host1.to_string(), host2.to_string()),
        None => (start.to_string(), host1.to_string()),
    }
}

// ============ Commands ============

async fn list(ctx: &ClusterContext, host: &str, replica: Option<&str>, verbose: bool) -> Result<()> {
    match topology::list(ctx, host, replica).await? {
        Listing::Peers(peers) => {
            for peer in peers {
                println!("{}: {}", peer.name, peer.kind);
            }
        }
        Listing::UnknownPeer(replica) => println!("Cannot find {} in public server list", replica),
        Listing::Agreements { agreements, .. } => {
            for agreement in &agreements {
                print_agreement(agreement, verbose);
            }
        }
    }
    Ok(())
}

fn print_agreement(agreement: &Agreement, verbose: bool) {
    println!("{}: {}", agreement.remote, agreement.kind);
    if !verbose {
        return;
    }
    let stamp = |t: &Option<chrono::DateTime<chrono::Utc>>| t.map(|t| t.to_string()).unwrap_or_else(|| "None".into());
    println!(
        "  last init status: {}",
        agreement.last_init_status.as_deref().unwrap_or("None")
    );
    println!("  last init ended: {}", stamp(&agreement.last_init_end));
    println!(
        "  last update status: {}",
        agreement.last_update_status.as_deref().unwrap_or("None")
    );
    println!("  last update ended: {}", stamp(&agreement.last_update_end));
}

async fn list_ruv(ctx: &ClusterContext, host: &str) -> Result<()> {
    let ruvs = ruv::collect_from(ctx, host, false).await?;

    println!("Replica Update Vectors:");
    if ruvs.domain.is_empty() {
        println!("\tNo RUVs found.");
    }
    for element in &ruvs.domain {
        println!("\t{}: {}", element.origin, element.rid);
    }

    println!("Certificate Server Replica Update Vectors:");
    if ruvs.ca.is_empty() {
        println!("\tNo CS-RUVs found.");
    }
    for element in &ruvs.ca {
        println!("\t{}: {}", element.origin, element.rid);
    }
    Ok(())
}

fn print_link_removal(removal: &LinkRemoval) {
    for saved in &removal.saved_ranges {
        if saved.kept_by.is_none() {
            println!("Unable to save DNA range {}", saved.range);
        }
    }
    println!("Deleted replication agreement from '{}' to '{}'", removal.from, removal.to);
}

async fn del(ctx: &ClusterContext, host: &str, removing: &str, force: bool, cleanup: bool) -> Result<()> {
    let report = match topology::remove_node(ctx, host, removing, force, cleanup).await? {
        NodeRemoval::Cleaned { host } => {
            tracing::info!("Cleaned up entries of {}", host);
            return Ok(());
        }
        NodeRemoval::Removed(report) => report,
    };

    for link in &report.links {
        match &link.result {
            Ok(removal) => print_link_removal(removal),
            Err(e) => println!(
                "There were issues removing a connection for {} from {}: {}",
                report.host, link.host, e
            ),
        }
    }
    for cleaned in &report.cleaned {
        match &cleaned.result {
            Ok(wait) => print_task(wait),
            Err(e) => println!("Failed to clean {} RUV {} of {}: {}", cleaned.suffix, cleaned.rid, report.host, e),
        }
    }
    if let Some(e) = &report.cleanup_error {
        println!("Failed to cleanup {} entries: {}", report.host, e);
        println!("You may need to manually remove them from the tree");
    }
    if let Some(e) = &report.dns_error {
        println!("Failed to cleanup {} DNS entries: {}", report.host, e);
        println!("You may need to manually remove them from the tree");
    }
    Ok(())
}

async fn list_clean_ruv(ctx: &ClusterContext, host: &str, verbose: bool) -> Result<()> {
    let listing = task::list_clean_tasks(ctx, host).await?;
    let layout = ctx.layout();

    let sections = [
        (
            &listing.clean,
            "No CLEANALLRUV tasks running",
            "CLEANALLRUV tasks",
            layout.cleanallruv_tasks(),
        ),
        (
            &listing.abort,
            "No abort CLEANALLRUV tasks running",
            "Abort CLEANALLRUV tasks",
            layout.abort_tasks(),
        ),
    ];
    for (i, (tasks, none, title, container)) in sections.iter().enumerate() {
        if i > 0 {
            println!();
        }
        let Some(tasks) = tasks else {
            println!("{}", none);
            continue;
        };
        println!("{}", title);
        for info in tasks.iter() {
            println!("RID {}: {}", info.rid, info.status.as_deref().unwrap_or("None"));
            if verbose {
                println!("{}", container);
                println!("{}", info.log.as_deref().unwrap_or("None"));
            }
        }
    }
    Ok(())
}

async fn clean_dangling_ruv(ctx: &ClusterContext, host: &str, force: bool) -> Result<()> {
    let (report, outcomes) = dangling::clean_dangling(ctx, host, force).await?;
    if report.is_empty() {
        println!("No dangling RUVs found");
        return Ok(());
    }
    for outcome in &outcomes {
        match &outcome.result {
            Ok((_, wait)) => print_task(wait),
            Err(e) => println!("Cleaning on {} failed: {}", outcome.host, e),
        }
    }
    Ok(())
}

async fn show_ranges(ctx: &ClusterContext, host: &str, only: Option<&str>, kind: RangeKind) -> Result<()> {
    for report in range::show(ctx, host, only, kind).await? {
        println!("{}", report.describe(kind));
    }
    Ok(())
}

async fn set_range(ctx: &ClusterContext, host: &str, value: &str, kind: RangeKind) -> Result<()> {
    let outcome = range::set_range(ctx, host, value, kind).await?;
    for peer in &outcome.unchecked {
        println!("Connection to {} failed: {}", peer.host, peer.reason);
        println!("Overlap not checked.");
    }
    if outcome.write == WriteOutcome::Unchanged {
        println!("No changes to make");
    }
    Ok(())
}

// ============ Output helpers ============

fn print_wait<T>(what: &str, outcome: &WaitOutcome<T>) {
    match outcome {
        WaitOutcome::Finished(_) => println!("{} succeeded", what),
        WaitOutcome::TimedOut => println!("{} did not finish in time. It will continue to run in the background", what),
        WaitOutcome::Interrupted => {
            println!("Wait for {} interrupted. It will continue to run in the background", what.to_lowercase())
        }
    }
}

fn print_task(outcome: &WaitOutcome<TaskResult>) {
    match outcome {
        WaitOutcome::Finished(result) if result.succeeded() => {
            if let Some(status) = &result.status {
                println!("{}", status);
            }
        }
        WaitOutcome::Finished(result) => println!(
            "Task failed with code {}: {}",
            result.exit_code.unwrap_or_default(),
            result.status.as_deref().unwrap_or("no status")
        ),
        WaitOutcome::TimedOut => println!("Task did not finish in time. It will continue to run in the background"),
        WaitOutcome::Interrupted => println!("Wait for task interrupted. It will continue to run in the background"),
    }
}
