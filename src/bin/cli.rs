//! Hamster CLI - Main entry point for CLI binary
//!
//! This binary provides the `hamster` tool for planning and applying
//! driver updates.

use anyhow::{bail, Context};
use clap::Parser;
use hamster_lib::engine::{
    audit::{DriverBackupStore, RecordJournal},
    catalog::{CatalogResolver, CatalogSource, LocalCatalog, RemoteCatalog},
    cli::{
        formatter::{format_size, CliFormatter},
        CatalogAction, Cli, Commands, OutputFormat,
    },
    config::{Config, Layout},
    installer::{InstallationEngine, SystemInstaller},
    locks::InstallGate,
    model::{load_inventory, CatalogListing, HardwareId},
    platform::{Platform, PowerShellRestorePoints, WindowsHost},
    updater::{Downloader, Progress, VerificationGate},
    version::{compare, DriverVersion},
    PlanSet, RunReport, UpdateOrchestrator,
};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("HAMSTER_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let json = cli.format == OutputFormat::Json;
    let layout = cli.layout()?;

    match cli.command {
        Commands::Compare { a, b } => cmd_compare(&a, &b, json),
        Commands::Plan { inventory } => cmd_plan(&layout, &inventory, json).await,
        Commands::Run { inventory, no_restore_point } => {
            cmd_run(&layout, &inventory, no_restore_point, json).await
        }
        Commands::History { device, attention } => cmd_history(&layout, device.as_deref(), attention, json),
        Commands::Catalog { action } => cmd_catalog(action, &layout, json),
    }
}

fn cmd_compare(a: &str, b: &str, json: bool) -> anyhow::Result<()> {
    let left = DriverVersion::parse(a)?;
    let right = DriverVersion::parse(b)?;
    let ordering = compare(&left, &right);
    let word = match ordering {
        Ordering::Less => "less",
        Ordering::Equal => "equal",
        Ordering::Greater => "greater",
    };

    if json {
        println!(
            "{}",
            serde_json::json!({ "a": left.to_string(), "b": right.to_string(), "ordering": word })
        );
    } else {
        let symbol = match ordering {
            Ordering::Less => "<",
            Ordering::Equal => "=",
            Ordering::Greater => ">",
        };
        println!("{} {} {}", left, symbol, right);
    }
    Ok(())
}

fn load_config(layout: &Layout) -> anyhow::Result<Config> {
    layout.init().context("creating data directory")?;
    Ok(Config::load(layout.base_dir())?)
}

fn build_orchestrator(
    layout: &Layout,
    config: &Config,
    restore_points: bool,
    progress: Progress,
) -> anyhow::Result<UpdateOrchestrator> {
    let local: Arc<dyn CatalogSource> = Arc::new(LocalCatalog::open(&layout.catalog_path(&config.catalog))?);
    let remote = RemoteCatalog::from_config(&config.catalog, &config.download.user_agent)?
        .map(|remote| Arc::new(remote) as Arc<dyn CatalogSource>);
    let resolver = CatalogResolver::new(local, remote);

    let downloader = Downloader::new(config.download.clone())?;
    let verifier = VerificationGate::new(&config.trust)?;

    let backups = Arc::new(DriverBackupStore::new(&layout.backups_dir())?);
    let journal = Arc::new(RecordJournal::new(&layout.journal_path())?);
    let mut engine = InstallationEngine::new(
        Arc::new(WindowsHost::new()),
        Arc::new(SystemInstaller::new()),
        backups,
        journal,
    )
    .with_timeout(Duration::from_secs(config.install.timeout_secs))
    .with_progress(progress.clone());
    if restore_points && config.install.create_restore_point {
        engine = engine.with_restore_points(Arc::new(PowerShellRestorePoints::new()));
    }

    let gate = if config.install.cross_process_lock {
        InstallGate::with_lock_file(&layout.locks_dir(), Duration::from_secs(config.install.lock_wait_secs))
    } else {
        InstallGate::local()
    };

    Ok(UpdateOrchestrator::new(resolver, downloader, verifier, engine, gate, layout.downloads_dir())
        .with_progress(progress))
}

async fn cmd_plan(layout: &Layout, inventory: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(layout)?;
    let devices = load_inventory(inventory).with_context(|| format!("reading {}", inventory.display()))?;
    let orchestrator = build_orchestrator(layout, &config, false, Progress::silent())?;

    let plan = orchestrator.plan(&devices, &config.policy).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn print_plan(plan: &PlanSet) {
    CliFormatter::header("Update plan");
    if plan.plans.is_empty() {
        CliFormatter::success("All devices are up to date");
    }
    for p in &plan.plans {
        let size = p.entry.package.size.map(format_size).unwrap_or_else(|| "unknown size".into());
        CliFormatter::item(&format!(
            "{} ({}): {} from {} [{}, {}]",
            p.device.name, p.device.hardware_id, p.rationale, p.entry.package.provider, p.entry.package.kind, size
        ));
    }
    CliFormatter::kv("Up to date", &plan.up_to_date.len().to_string());
    CliFormatter::kv("No candidates", &plan.no_candidates.len().to_string());
    if plan.filtered_out > 0 {
        CliFormatter::kv("Filtered by class", &plan.filtered_out.to_string());
    }
    for manual in &plan.manual {
        CliFormatter::info(&format!(
            "{}: {} listing(s) need manual selection",
            manual.hardware_id,
            manual.listings.len()
        ));
    }
    for warning in &plan.warnings {
        CliFormatter::warning(warning);
    }
    for issue in &plan.errors {
        CliFormatter::error(&format!("{}: {}", issue.hardware_id, issue.message));
    }
}

async fn cmd_run(layout: &Layout, inventory: &Path, no_restore_point: bool, json: bool) -> anyhow::Result<()> {
    let platform = Platform::current();
    if !platform.supports_install() {
        bail!("driver installation is not supported on {}", platform.name());
    }

    let config = load_config(layout)?;
    let devices = load_inventory(inventory).with_context(|| format!("reading {}", inventory.display()))?;

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = build_orchestrator(layout, &config, !no_restore_point, Progress::new(sender))?;

    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if !json {
                CliFormatter::progress(&event);
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            CliFormatter::warning("Cancelling; a running installer will finish first");
            on_interrupt.cancel();
        }
    });

    let report = orchestrator.run(&devices, &config.policy, &cancel).await;
    // Dropping the orchestrator closes the progress channel
    drop(orchestrator);
    let _ = printer.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    print_plan(&report.plan);
    CliFormatter::header("Results");
    for record in &report.records {
        CliFormatter::record(record);
    }
    let attention = report.needs_attention();
    if !attention.is_empty() {
        CliFormatter::divider();
        CliFormatter::error(&format!("{} device(s) need manual attention", attention.len()));
        for record in attention {
            CliFormatter::item(&record.summary());
        }
    }
}

fn cmd_history(layout: &Layout, device: Option<&str>, attention: bool, json: bool) -> anyhow::Result<()> {
    let journal = RecordJournal::new(&layout.journal_path())?;
    let records = match device {
        Some(id) => journal.for_device(&HardwareId::parse(id)?)?,
        None if attention => journal.needing_attention()?,
        None => journal.read_all()?,
    };
    let records: Vec<_> = records
        .into_iter()
        .filter(|r| !attention || r.needs_attention)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    CliFormatter::header("Installation history");
    if records.is_empty() {
        CliFormatter::info("No records");
    }
    for record in &records {
        CliFormatter::record(record);
    }
    Ok(())
}

fn cmd_catalog(action: CatalogAction, layout: &Layout, json: bool) -> anyhow::Result<()> {
    let config = load_config(layout)?;
    let path = layout.catalog_path(&config.catalog);
    let catalog = LocalCatalog::open(&path)?;

    match action {
        CatalogAction::Import { file } => {
            let content = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let listings: Vec<CatalogListing> = serde_json::from_str(&content)?;
            for listing in &listings {
                listing
                    .parse_version()
                    .with_context(|| format!("listing for {}", listing.package.hardware_id))?;
            }
            let imported = catalog.import_listings(&listings)?;

            if json {
                println!("{}", serde_json::json!({ "imported": imported, "catalog": path.display().to_string() }));
            } else {
                CliFormatter::success(&format!("Imported {} listing(s) into {}", imported, path.display()));
            }
        }
        CatalogAction::Status => {
            let count = catalog.count()?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "catalog": path.display().to_string(),
                        "listings": count,
                        "remote": config.catalog.remote_url,
                    })
                );
            } else {
                CliFormatter::header("Catalog");
                CliFormatter::kv("Local", &path.display().to_string());
                CliFormatter::kv("Listings", &count.to_string());
                CliFormatter::kv("Remote", config.catalog.remote_url.as_deref().unwrap_or("(none)"));
            }
        }
    }
    Ok(())
}
