mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{BackupCommands, Cli, Commands};
use qitlalli_backup::core::archive;
use qitlalli_backup::core::catalog::{self, EntryKind};
use qitlalli_backup::core::restore::{AssumeYes, Confirm, RestoreOptions, StdinConfirm};
use qitlalli_backup::core::snapshot::{Manifest, Provenance};
use qitlalli_backup::core::{
    BackupError, BackupManager, CloudSnapshotBridge, DockerManager, GcloudClient, HealthChecker,
    RestoreMode, RestoreOutcome, RestoreSequencer, Settings,
};
use qitlalli_backup::utils::{
    available_space, format_bytes, format_duration, path_size, sha256_file, ContainerState,
    LOW_SPACE_WARNING_BYTES,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::load(cli.project_root, cli.backup_root)?;

    match cli.command {
        Commands::Status => {
            handle_status(&settings).await?;
        }
        Commands::Backup { command } => {
            handle_backup(&settings, command).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("qitlalli_backup=info")),
        1 => EnvFilter::new("qitlalli_backup=debug"),
        _ => EnvFilter::new("qitlalli_backup=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Race a capture against Ctrl-C. Dropping the capture future drops its
/// staged snapshot, which removes the partial output.
async fn until_interrupted<T>(capture: impl Future<Output = Result<T, BackupError>>) -> Result<T> {
    tokio::select! {
        result = capture => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("backup interrupted, discarding partial output");
            bail!("Backup interrupted; partial output was removed")
        }
    }
}

async fn handle_status(settings: &Settings) -> Result<()> {
    let docker = DockerManager::new(&settings.target)?;
    if !docker.check_docker().await {
        bail!("Docker daemon is not reachable. Is Docker running?");
    }

    let services = docker.list_services().await?;

    println!("QiTlalli Stack Status ({})\n", docker.project_root().display());
    println!(
        "{:<30} {:<12} {:<11} {:<12} {:<30}",
        "Container", "Service", "State", "Health", "Status"
    );
    println!("{}", "-".repeat(98));

    if services.is_empty() {
        println!("No containers found. Start the stack with: docker compose up -d");
    }

    for service in services {
        let health = service.health.as_deref().unwrap_or("N/A");
        let label = service.state.as_str();
        let state = if service.state.is_running() {
            label.green()
        } else if service.state == ContainerState::Restarting {
            label.yellow()
        } else {
            label.red()
        };
        println!(
            "{:<30} {:<12} {:<11} {:<12} {:<30}",
            service.name, service.service, state, health, service.status
        );
    }

    let backups = catalog::list(&settings.backup_root).count();
    println!("\nBackups: {} in {}", backups, settings.backup_root.display());

    Ok(())
}

async fn handle_backup(settings: &Settings, command: BackupCommands) -> Result<()> {
    match command {
        BackupCommands::Create => {
            let docker = DockerManager::new(&settings.target)?;
            docker.ensure_services_defined()?;
            warn_if_low_space(&settings.backup_root);

            let provenance = Provenance::detect(&settings.project_root).await;
            let manager = BackupManager::new(settings.target.clone(), &docker, provenance);

            let pb = spinner("Creating full backup (database, file store, configuration)...");
            let result = until_interrupted(manager.create_full_backup(&settings.backup_root)).await;
            pb.finish_and_clear();

            report_created(&result?);
        }
        BackupCommands::CreateDb => {
            let docker = DockerManager::new(&settings.target)?;
            docker.ensure_services_defined()?;
            warn_if_low_space(&settings.backup_root);

            let provenance = Provenance::detect(&settings.project_root).await;
            let manager = BackupManager::new(settings.target.clone(), &docker, provenance);

            let pb = spinner(format!("Dumping database '{}'...", settings.target.database));
            let result = until_interrupted(manager.create_db_backup(&settings.backup_root)).await;
            pb.finish_and_clear();

            report_created(&result?);
        }
        BackupCommands::CreateProd => {
            let gcp = settings.gcp.clone().context(
                "No Google Cloud project configured. Set GCP_PROJECT_ID in .env \
                 or [gcp] project_id in the config file",
            )?;
            let client = GcloudClient::new(gcp.clone());
            client.check_authentication().await?;

            let provenance = Provenance::detect(&settings.project_root).await;
            let bridge = CloudSnapshotBridge::new(&gcp, &client, &client, provenance);

            let pb = spinner(format!("Backing up production project '{}'...", gcp.project_id));
            let result =
                until_interrupted(bridge.create_production_backup(&settings.backup_root)).await;
            pb.finish_and_clear();

            let path = result?;
            report_created(&path);
            println!(
                "  {} secrets are stored in plain text; keep this snapshot somewhere safe",
                "!".yellow().bold()
            );
        }
        BackupCommands::List => {
            handle_list(&settings.backup_root);
        }
        BackupCommands::Restore { snapshot, yes } => {
            handle_restore(settings, &snapshot, RestoreMode::Full, yes).await?;
        }
        BackupCommands::RestoreDb { snapshot, yes } => {
            handle_restore(settings, &snapshot, RestoreMode::DatabaseOnly, yes).await?;
        }
        BackupCommands::RestoreArchive { archive, yes } => {
            let entry = catalog::resolve_archive(&settings.backup_root, &archive)
                .context("Use `backup restore` for snapshot directories")?;
            handle_restore(settings, &entry.file_name(), RestoreMode::Full, yes).await?;
        }
        BackupCommands::Archive { snapshot, remove_source } => {
            handle_archive(settings, &snapshot, remove_source)?;
        }
        BackupCommands::Delete { snapshot, yes } => {
            handle_delete(settings, &snapshot, yes)?;
        }
        BackupCommands::Verify { snapshot } => {
            handle_verify(settings, &snapshot)?;
        }
    }

    Ok(())
}

fn report_created(path: &Path) {
    let size = path_size(path);
    println!("{} Backup created: {}", "✓".green(), path.display());
    println!("  Size: {}", format_bytes(size));
}

fn warn_if_low_space(backup_root: &Path) {
    // the backup root may not exist yet; measure the nearest existing ancestor
    let existing = backup_root.ancestors().find(|p| p.exists());
    if let Some(available) = existing.and_then(available_space) {
        if available < LOW_SPACE_WARNING_BYTES {
            warn!(
                available = %format_bytes(available),
                root = %backup_root.display(),
                "low disk space on the backup volume"
            );
            println!(
                "{} Only {} free on the backup volume",
                "!".yellow().bold(),
                format_bytes(available)
            );
        }
    }
}

fn handle_list(backup_root: &Path) {
    let snapshots = catalog::list_sorted(backup_root);

    if snapshots.is_empty() {
        println!("No backups found in {}", backup_root.display());
        return;
    }

    println!("Backups in {}\n", backup_root.display());
    println!("{:<40} {:<22} {:>10}  {:<19}", "Name", "Kind", "Size", "Created");
    println!("{}", "-".repeat(95));

    for snapshot in &snapshots {
        let kind = snapshot.kind.label();
        let kind = match snapshot.kind {
            EntryKind::Incomplete(_) => kind.yellow(),
            _ if snapshot.kind.is_restorable() => kind.green(),
            _ => kind.normal(),
        };
        println!(
            "{:<40} {:<22} {:>10}  {:<19}",
            snapshot.file_name(),
            kind,
            format_bytes(snapshot.size_bytes()),
            snapshot.name.timestamp().format("%Y-%m-%d %H:%M:%S")
        );
    }

    let incomplete = snapshots
        .iter()
        .filter(|s| matches!(s.kind, EntryKind::Incomplete(_)))
        .count();
    if incomplete > 0 {
        println!(
            "\n{} {} incomplete snapshot(s): interrupted captures, not restorable",
            "!".yellow().bold(),
            incomplete
        );
        println!("  Remove them with: qitlalli-backup backup delete <name>");
    }
}

async fn handle_restore(settings: &Settings, requested: &str, mode: RestoreMode, yes: bool) -> Result<()> {
    let docker = DockerManager::new(&settings.target)?;
    docker.ensure_services_defined()?;

    let confirm: Box<dyn Confirm> = if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(StdinConfirm)
    };

    let options = RestoreOptions {
        settle: settings.settle,
        ..RestoreOptions::default()
    };
    let sequencer = RestoreSequencer::new(
        &settings.backup_root,
        &settings.target,
        &docker,
        &docker,
        confirm.as_ref(),
    )
    .with_options(options);

    let started = Instant::now();
    let report = match sequencer.run(requested, mode).await? {
        RestoreOutcome::Declined { snapshot } => {
            println!("Restore of {} cancelled. Nothing was changed.", snapshot);
            return Ok(());
        }
        RestoreOutcome::Completed(report) => report,
    };

    if let Some(archive) = &report.extracted_from {
        println!("Extracted {}", archive.display());
    }
    println!(
        "{} Restored {} in {}",
        "✓".green(),
        report.snapshot,
        format_duration(started.elapsed().as_secs())
    );
    println!("  Application: {}", report.access_url);

    let checker = HealthChecker::new()?;
    let pb = spinner("Checking application health...");
    let health = checker.check(&report.access_url).await;
    pb.finish_and_clear();

    if health.healthy {
        println!("  Health: {} ({} ms)", "healthy".green(), health.response_time_ms);
    } else {
        println!(
            "  Health: {} at {} ({}); it may still be starting",
            "not responding".yellow(),
            health.url,
            health.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}

fn handle_archive(settings: &Settings, requested: &str, remove_source: bool) -> Result<()> {
    let snapshot = catalog::resolve(&settings.backup_root, requested)?;

    if !snapshot.is_dir() {
        bail!("{} is not a snapshot directory", snapshot.file_name());
    }
    if let EntryKind::Incomplete(_) = snapshot.kind {
        bail!(
            "{} is incomplete (missing {}); refusing to archive it",
            snapshot.file_name(),
            snapshot.missing.join(", ")
        );
    }

    let pb = spinner(format!("Compressing {}...", snapshot.file_name()));
    let result = archive::compress(&snapshot.path);
    pb.finish_and_clear();
    let archive_path = result?;

    println!("{} Archive created: {}", "✓".green(), archive_path.display());
    println!(
        "  Size: {} (from {})",
        format_bytes(path_size(&archive_path)),
        format_bytes(snapshot.size_bytes())
    );

    if remove_source {
        let files = archive::verify(&archive_path, &snapshot.path)?;
        catalog::delete(&settings.backup_root, &snapshot)
            .with_context(|| format!("Failed to remove {}", snapshot.path.display()))?;
        println!(
            "  Verified {} files and removed {}",
            files,
            snapshot.path.display()
        );
    }

    Ok(())
}

fn handle_delete(settings: &Settings, requested: &str, yes: bool) -> Result<()> {
    let snapshot = catalog::resolve(&settings.backup_root, requested)?;

    let prompt = format!(
        "Delete {} ({}, {})? This cannot be undone.",
        snapshot.path.display(),
        snapshot.kind.label(),
        format_bytes(snapshot.size_bytes())
    );
    let confirmed = if yes {
        AssumeYes.confirm(&prompt)?
    } else {
        StdinConfirm.confirm(&prompt)?
    };
    if !confirmed {
        println!("Cancelled.");
        return Ok(());
    }

    catalog::delete(&settings.backup_root, &snapshot)
        .with_context(|| format!("Failed to delete {}", snapshot.path.display()))?;
    println!("{} Deleted {}", "✓".green(), snapshot.file_name());

    Ok(())
}

fn handle_verify(settings: &Settings, requested: &str) -> Result<()> {
    let snapshot = catalog::resolve(&settings.backup_root, requested)?;

    println!("{} ({})\n", snapshot.file_name(), snapshot.kind.label());

    if snapshot.is_dir() {
        match Manifest::read(&snapshot.path) {
            Ok(manifest) => print!("{}", manifest.render()),
            Err(e) => println!("{} {:#}", "No readable manifest:".yellow(), e),
        }
        if !snapshot.missing.is_empty() {
            println!("\n{} {}", "Missing:".red(), snapshot.missing.join(", "));
        }
        println!();
    }

    for file in artifact_files(&snapshot.path)? {
        let rel = file
            .strip_prefix(&snapshot.path)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(file.file_name().unwrap_or_default()));
        let hash = sha256_file(&file).with_context(|| format!("Failed to hash {}", file.display()))?;
        println!("{}  {}", hash, rel.display());
    }

    Ok(())
}

/// Every regular file of a snapshot, sorted; a flat dump or archive is its own artifact
fn artifact_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
