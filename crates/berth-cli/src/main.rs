//! Berth CLI - staged release management for a single host
//!
//! The `berth` command drives the release lifecycle end to end.
//!
//! ## Commands
//!
//! - `upload`: Register a staged bundle, validate it and archive it
//! - `list`: Show every release with its status
//! - `validate`: Re-run validation for a release
//! - `deps`: Inspect or install missing dependencies
//! - `deploy`: Promote a release behind the health gate
//! - `deactivate`: Stop the service and clear the active pointer
//! - `service`: Query the managed service

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use berth_core::fsutil;
use berth_core::{
    init_tracing, BerthConfig, DeployOutcome, InstallProgress, InstallStatus, PointerState,
    ReleaseEdit, ReleaseManager, SystemdServiceManager, UploadMeta, ValidationReport, METRICS,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, Level};

/// How often `deps install` rereads the progress record.
const INSTALL_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged release validation and health-gated promotion", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs and results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// JSON config file layered over BERTH_* environment settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Release root (overrides BERTH_ROOT and the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List releases with their status
    List,

    /// Register a staged bundle as a new release
    Upload {
        /// Release name (sanitized to [A-Za-z0-9_-])
        name: String,

        /// Directory holding the bundle; moved into place unless --keep is set
        #[arg(long)]
        from: PathBuf,

        /// Human description stored in the manifest
        #[arg(long, default_value = "")]
        description: String,

        /// Port the service listens on
        #[arg(long)]
        port: Option<u16>,

        /// Uploader recorded in the manifest
        #[arg(long, env = "USER", default_value = "unknown")]
        created_by: String,

        /// Copy the bundle instead of moving it
        #[arg(long)]
        keep: bool,
    },

    /// Validate a release and store its report
    Validate {
        /// Release name
        name: String,
    },

    /// Copy a release under the next free `<name>_copy_NNN` name
    Clone {
        /// Source release name
        name: String,
    },

    /// Edit manifest fields of an inactive release
    Edit {
        /// Release name
        name: String,

        /// New description
        #[arg(long)]
        description: Option<String>,

        /// New service port
        #[arg(long)]
        port: Option<u16>,

        /// Replace declared dependencies (repeatable)
        #[arg(long = "dependency")]
        dependencies: Vec<String>,

        /// Remove all declared dependencies
        #[arg(long, conflicts_with = "dependencies")]
        no_dependencies: bool,
    },

    /// Delete an inactive release
    Delete {
        /// Release name
        name: String,
    },

    /// Build (or reuse) the release archive
    Archive {
        /// Release name
        name: String,
    },

    /// Dependency operations
    Deps {
        #[command(subcommand)]
        action: DepsAction,
    },

    /// Promote a release, rolling back if it never turns healthy
    Deploy {
        /// Release name
        name: String,
    },

    /// Stop the service and clear the active pointer
    Deactivate,

    /// Show the active release and the last deploy failure
    Current,

    /// Managed service operations
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum DepsAction {
    /// List dependencies not importable in the release runtime
    Missing {
        /// Release name
        name: String,
    },

    /// Install missing dependencies, following progress until done
    Install {
        /// Release name
        name: String,
    },

    /// Show the last install progress snapshot
    Status {
        /// Release name
        name: String,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// Show the service manager status
    Status,

    /// Show recent service logs
    Logs {
        /// Number of journal lines
        #[arg(long, default_value = "200")]
        lines: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref(), cli.root)?;
    info!(root = %config.root.display(), "berth starting");
    let manager =
        ReleaseManager::from_config(config).context("Failed to set up release manager")?;

    let result = run(&manager, cli.command, cli.json).await;
    METRICS.flush();
    result
}

/// Defaults, then `BERTH_*` env, then the config file, then `--root`.
fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<BerthConfig> {
    let mut config = BerthConfig::from_env();
    if let Some(path) = path {
        config = config
            .merge_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
    }
    if let Some(root) = root {
        config.root = root;
    }
    Ok(config)
}

async fn run(manager: &ReleaseManager, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::List => cmd_list(manager, json),
        Commands::Upload {
            name,
            from,
            description,
            port,
            created_by,
            keep,
        } => {
            let meta = UploadMeta {
                description,
                api_port: port,
                created_by,
            };
            cmd_upload(manager, &name, &from, &meta, keep, json).await
        }
        Commands::Validate { name } => cmd_validate(manager, &name, json).await,
        Commands::Clone { name } => cmd_clone(manager, &name, json),
        Commands::Edit {
            name,
            description,
            port,
            dependencies,
            no_dependencies,
        } => {
            let dependencies = if no_dependencies {
                Some(Vec::new())
            } else if dependencies.is_empty() {
                None
            } else {
                Some(dependencies)
            };
            let edit = ReleaseEdit {
                description,
                api_port: port,
                dependencies,
            };
            cmd_edit(manager, &name, &edit, json).await
        }
        Commands::Delete { name } => cmd_delete(manager, &name, json).await,
        Commands::Archive { name } => cmd_archive(manager, &name, json),
        Commands::Deps { action } => match action {
            DepsAction::Missing { name } => cmd_deps_missing(manager, &name, json).await,
            DepsAction::Install { name } => cmd_deps_install(manager, &name, json).await,
            DepsAction::Status { name } => cmd_deps_status(manager, &name, json),
        },
        Commands::Deploy { name } => cmd_deploy(manager, &name, json).await,
        Commands::Deactivate => cmd_deactivate(manager, json).await,
        Commands::Current => cmd_current(manager, json),
        Commands::Service { action } => match action {
            ServiceAction::Status => cmd_service_status(manager, json).await,
            ServiceAction::Logs { lines } => cmd_service_logs(manager, lines, json).await,
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Truncate a string for display
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len).collect();
        format!("{}...", head)
    }
}

fn print_report(report: &ValidationReport) {
    let verdict = if report.ok { "PASSED" } else { "FAILED" };
    println!("Validation: {} ({})", verdict, report.timestamp.to_rfc3339());
    for error in &report.errors {
        println!("  error: {}", error);
    }
    for (stage, output) in &report.diagnostics {
        println!("  [{}] {}", stage, truncate(output.trim(), 200));
    }
}

// ========== Release Commands ==========

fn cmd_list(manager: &ReleaseManager, json: bool) -> Result<()> {
    let releases = manager.list().context("Failed to list releases")?;
    if json {
        return print_json(&releases);
    }
    if releases.is_empty() {
        println!("No releases.");
        return Ok(());
    }

    println!(
        "{:<28} {:<14} {:<8} DESCRIPTION",
        "NAME", "STATUS", "ARCHIVE"
    );
    for release in &releases {
        let description = release
            .manifest
            .as_ref()
            .map(|m| m.description.as_str())
            .unwrap_or("<unreadable manifest>");
        println!(
            "{:<28} {:<14} {:<8} {}",
            truncate(&release.name, 28),
            release.status.to_string(),
            if release.has_archive { "yes" } else { "no" },
            truncate(description, 48)
        );
    }
    Ok(())
}

async fn cmd_upload(
    manager: &ReleaseManager,
    name: &str,
    from: &Path,
    meta: &UploadMeta,
    keep: bool,
    json: bool,
) -> Result<()> {
    // The copy lives under the root so the final rename stays on one filesystem.
    let scratch = if keep {
        let root = &manager.config().root;
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Some(
            tempfile::Builder::new()
                .prefix(".upload-")
                .tempdir_in(root)
                .context("Failed to create upload scratch directory")?,
        )
    } else {
        None
    };
    let staged = match &scratch {
        Some(dir) => {
            let copy = dir.path().join("bundle");
            fsutil::copy_tree(from, &copy, |_| false)
                .with_context(|| format!("Failed to copy bundle from {}", from.display()))?;
            copy
        }
        None => from.to_path_buf(),
    };

    let ingest = manager
        .ingest(name, &staged, meta)
        .await
        .with_context(|| format!("Failed to upload {}", name))?;

    if json {
        return print_json(&ingest);
    }
    println!("Uploaded {}", ingest.release);
    print_report(&ingest.report);
    println!(
        "Archive: {} ({})",
        ingest.archive.path.display(),
        truncate(&ingest.archive.fingerprint, 12)
    );
    Ok(())
}

async fn cmd_validate(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let report = manager
        .validate(name)
        .await
        .with_context(|| format!("Failed to validate {}", name))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.ok {
        anyhow::bail!("Release {} is invalid", name);
    }
    Ok(())
}

fn cmd_clone(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let clone = manager
        .clone_release(name)
        .with_context(|| format!("Failed to clone {}", name))?;

    if json {
        return print_json(&json!({ "source": name, "release": clone.name }));
    }
    println!("Cloned {} -> {}", name, clone.name);
    println!("Validate it before deploying.");
    Ok(())
}

async fn cmd_edit(
    manager: &ReleaseManager,
    name: &str,
    edit: &ReleaseEdit,
    json: bool,
) -> Result<()> {
    if edit.is_empty() {
        anyhow::bail!("Nothing to edit: pass --description, --port or --dependency");
    }
    let manifest = manager
        .edit(name, edit)
        .await
        .with_context(|| format!("Failed to edit {}", name))?;

    if json {
        return print_json(&manifest);
    }
    println!("Updated {}", name);
    println!("  description: {}", manifest.description);
    println!("  port: {}", manifest.port());
    println!("  dependencies: {}", manifest.dependencies.join(", "));
    println!("Validate it again before deploying.");
    Ok(())
}

async fn cmd_delete(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    manager
        .delete(name)
        .await
        .with_context(|| format!("Failed to delete {}", name))?;

    if json {
        return print_json(&json!({ "deleted": name }));
    }
    println!("Deleted {}", name);
    Ok(())
}

fn cmd_archive(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let archive = manager
        .archive(name)
        .with_context(|| format!("Failed to archive {}", name))?;

    if json {
        return print_json(&archive);
    }
    let verb = if archive.rebuilt { "Built" } else { "Up to date" };
    println!("{}: {}", verb, archive.path.display());
    println!("Fingerprint: {}", archive.fingerprint);
    Ok(())
}

// ========== Dependency Commands ==========

async fn cmd_deps_missing(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let missing = manager
        .missing(name)
        .await
        .with_context(|| format!("Failed to resolve dependencies of {}", name))?;

    if json {
        return print_json(&missing);
    }
    if missing.is_empty() {
        println!("All dependencies of {} are installed.", name);
    } else {
        println!("Missing dependencies of {}:", name);
        for requirement in &missing {
            println!("  {}", requirement);
        }
    }
    Ok(())
}

async fn cmd_deps_install(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let mut shown = manager
        .install(name)
        .await
        .with_context(|| format!("Failed to start install for {}", name))?;
    if !json {
        print_progress(&shown);
    }

    // The run is a task of this process and dies with it, so stay until it ends.
    while manager.install_running(name)? {
        tokio::time::sleep(INSTALL_POLL).await;
        let latest = manager.install_status(name)?;
        if latest != shown {
            if !json {
                print_progress(&latest);
            }
            shown = latest;
        }
    }
    manager.join_install(name).await?;

    let last = manager.install_status(name)?;
    if json {
        print_json(&last)?;
    } else if last != shown {
        print_progress(&last);
    }
    if last.status == InstallStatus::Error {
        anyhow::bail!("Install for {} failed", name);
    }
    Ok(())
}

fn print_progress(progress: &InstallProgress) {
    println!(
        "{} {}% {}",
        progress.status, progress.progress, progress.message
    );
}

fn cmd_deps_status(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let progress = manager
        .install_status(name)
        .with_context(|| format!("Failed to read install status of {}", name))?;

    if json {
        return print_json(&progress);
    }
    println!(
        "{} {}% {}",
        progress.status, progress.progress, progress.message
    );
    if let Some(at) = progress.updated_at {
        println!("Updated: {}", at.to_rfc3339());
    }
    Ok(())
}

// ========== Deploy Commands ==========

async fn cmd_deploy(manager: &ReleaseManager, name: &str, json: bool) -> Result<()> {
    let outcome = manager
        .deploy(name)
        .await
        .with_context(|| format!("Deploy of {} rejected", name))?;

    if json {
        print_json(&outcome)?;
    } else {
        match &outcome {
            DeployOutcome::Committed {
                release,
                attempt_id,
            } => {
                println!("Deployed {} (attempt {})", release, attempt_id);
            }
            DeployOutcome::RolledBack {
                release,
                restored,
                last_error,
                ..
            } => {
                println!("Deploy of {} failed the health gate: {}", release, last_error);
                match restored {
                    Some(previous) => println!("Rolled back to {}", previous),
                    None => println!("No previous release was restored"),
                }
            }
            DeployOutcome::Faulted {
                release,
                error,
                escalated,
                ..
            } => {
                println!("Deploy of {} faulted: {}", release, error);
                if *escalated {
                    println!(
                        "Rollback failed as well; inspect {} by hand",
                        manager.pointer().link_path().display()
                    );
                }
            }
        }
        if !outcome.is_committed() {
            if let Some(record) = manager.last_failure()? {
                println!();
                print!("{}", record);
            }
        }
    }

    if !outcome.is_committed() {
        anyhow::bail!("Deploy of {} did not commit", name);
    }
    Ok(())
}

async fn cmd_deactivate(manager: &ReleaseManager, json: bool) -> Result<()> {
    let deactivation = manager
        .deactivate()
        .await
        .context("Failed to deactivate")?;

    if json {
        return print_json(&deactivation);
    }
    match &deactivation.previous {
        Some(previous) => println!("Deactivated {}", previous),
        None => println!("No release was active"),
    }
    if !deactivation.stop.success {
        println!("Service stop failed: {}", deactivation.stop.output.trim());
    }
    Ok(())
}

fn cmd_current(manager: &ReleaseManager, json: bool) -> Result<()> {
    let state = manager
        .pointer()
        .state()
        .context("Failed to read active pointer")?;
    let (active, pointer) = match &state {
        PointerState::Empty => (None, "empty".to_string()),
        PointerState::Release(name) => (Some(name.to_string()), "release".to_string()),
        PointerState::Dangling(target) => (None, format!("dangling -> {}", target.display())),
        PointerState::RawDirectory => (None, "raw directory".to_string()),
    };
    let last_failure = manager.last_failure()?;

    if json {
        return print_json(&json!({
            "active": active,
            "pointer": pointer,
            "last_failure": last_failure,
        }));
    }
    match active {
        Some(name) => println!("Active: {}", name),
        None => println!("Active: none ({})", pointer),
    }
    if let Some(record) = last_failure {
        println!();
        println!("Last deploy failure:");
        print!("{}", record);
    }
    Ok(())
}

// ========== Service Commands ==========

async fn cmd_service_status(manager: &ReleaseManager, json: bool) -> Result<()> {
    let output = manager.service_status().await;
    if json {
        return print_json(&output);
    }
    println!("{}", output.output.trim_end());
    Ok(())
}

async fn cmd_service_logs(manager: &ReleaseManager, lines: u32, json: bool) -> Result<()> {
    let config = manager.config();
    let service = SystemdServiceManager::new(config.service_name.clone(), config.use_sudo);
    let output = service.journal(lines).await;

    if json {
        print_json(&output)?;
    } else {
        println!("{}", output.output.trim_end());
    }
    if !output.success {
        anyhow::bail!("Failed to read logs for {}", service.service_name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::fakes::{RecordingServiceManager, ScriptedProbe};
    use berth_core::{HealthProbe, ReleaseStatus};
    use berth_env::fakes::MemoryRuntime;
    use clap::CommandFactory;
    use std::sync::Arc;

    fn manager(root: &Path, probe: ScriptedProbe) -> ReleaseManager {
        manager_on(
            root,
            MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]),
            probe,
        )
    }

    fn manager_on(root: &Path, runtime: MemoryRuntime, probe: ScriptedProbe) -> ReleaseManager {
        let mut config = BerthConfig::with_root(root);
        config.health.interval_ms = 1;
        let probe: Arc<dyn HealthProbe> = Arc::new(probe);
        ReleaseManager::with_parts(
            config,
            Arc::new(runtime),
            Arc::new(RecordingServiceManager::new()),
            probe,
        )
    }

    fn bundle(root: &Path, tag: &str) -> PathBuf {
        let dir = root.join("incoming").join(tag);
        std::fs::create_dir_all(dir.join("service")).unwrap();
        std::fs::write(dir.join("service/__init__.py"), "").unwrap();
        std::fs::write(dir.join("service/app.py"), "app = object()\n").unwrap();
        dir
    }

    fn meta() -> UploadMeta {
        UploadMeta {
            description: "cli test".to_string(),
            api_port: Some(8000),
            created_by: "ops".to_string(),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["berth", "deps", "install", "r1", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Deps {
                action: DepsAction::Install { .. }
            }
        ));
    }

    #[test]
    fn test_edit_rejects_conflicting_dependency_flags() {
        let parsed = Cli::try_parse_from([
            "berth",
            "edit",
            "r1",
            "--dependency",
            "numpy",
            "--no-dependencies",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_root_flag_beats_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("berth.json");
        std::fs::write(&file, r#"{"root": "/from/file", "service_name": "svc-file"}"#).unwrap();

        let config = load_config(Some(&file), Some(PathBuf::from("/from/flag"))).unwrap();
        assert_eq!(config.root, PathBuf::from("/from/flag"));
        assert_eq!(config.service_name, "svc-file");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }

    #[tokio::test]
    async fn test_upload_keep_leaves_source_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedProbe::healthy());
        let source = bundle(dir.path(), "a");

        cmd_upload(&manager, "r1", &source, &meta(), true, false)
            .await
            .unwrap();

        assert!(source.join("service/app.py").is_file());
        let rows = manager.list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ReleaseStatus::Valid);
    }

    #[tokio::test]
    async fn test_deploy_commits_and_current_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedProbe::healthy());
        cmd_upload(&manager, "r1", &bundle(dir.path(), "a"), &meta(), false, false)
            .await
            .unwrap();

        cmd_deploy(&manager, "r1", true).await.unwrap();
        cmd_current(&manager, true).unwrap();
        assert_eq!(
            manager.pointer().current().unwrap().map(|n| n.to_string()),
            Some("r1".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_deploy_exits_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedProbe::failing("connection refused"));
        cmd_upload(&manager, "r1", &bundle(dir.path(), "a"), &meta(), false, false)
            .await
            .unwrap();

        let err = cmd_deploy(&manager, "r1", false).await.unwrap_err();
        assert!(err.to_string().contains("did not commit"));
        assert!(manager.last_failure().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_validate_fails_for_invalid_release() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedProbe::healthy());
        let source = bundle(dir.path(), "a");
        std::fs::remove_file(source.join("service/__init__.py")).unwrap();
        cmd_upload(&manager, "broken", &source, &meta(), false, false)
            .await
            .unwrap();

        assert!(cmd_validate(&manager, "broken", false).await.is_err());
    }

    #[tokio::test]
    async fn test_edit_without_fields_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedProbe::healthy());
        let err = cmd_edit(&manager, "r1", &ReleaseEdit::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Nothing to edit"));
    }

    #[tokio::test]
    async fn test_deps_install_finishes_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MemoryRuntime::new().with_install_delay(Duration::from_millis(30));
        let manager = manager_on(dir.path(), runtime, ScriptedProbe::healthy());
        cmd_upload(&manager, "r1", &bundle(dir.path(), "a"), &meta(), false, false)
            .await
            .unwrap();
        assert_eq!(manager.missing("r1").await.unwrap().len(), 2);

        cmd_deps_install(&manager, "r1", true).await.unwrap();

        assert!(!manager.install_running("r1").unwrap());
        let last = manager.install_status("r1").unwrap();
        assert_eq!(last.status, InstallStatus::Done);
        assert_eq!(last.progress, 100);
        assert!(manager.missing("r1").await.unwrap().is_empty());
    }
}
