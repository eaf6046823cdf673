use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_core::fakes::{RecordingServiceManager, ScriptedProbe};
use berth_core::{
    BerthConfig, BerthError, InstallStatus, Manifest, ReleaseEdit, ReleaseManager, ReleaseStatus,
    UploadMeta,
};
use berth_env::fakes::MemoryRuntime;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn manager_with(runtime: MemoryRuntime) -> (TempDir, ReleaseManager, Arc<MemoryRuntime>) {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = BerthConfig::with_root(root.path());
    config.health.interval_ms = 1;
    let runtime = Arc::new(runtime);
    let manager = ReleaseManager::with_parts(
        config,
        runtime.clone(),
        Arc::new(RecordingServiceManager::new()),
        Arc::new(ScriptedProbe::healthy()),
    );
    (root, manager, runtime)
}

/// Another manager over the same root, as a second `berth` process would be.
fn sibling(root: &TempDir, runtime: Arc<MemoryRuntime>) -> ReleaseManager {
    let mut config = BerthConfig::with_root(root.path());
    config.health.interval_ms = 1;
    ReleaseManager::with_parts(
        config,
        runtime,
        Arc::new(RecordingServiceManager::new()),
        Arc::new(ScriptedProbe::healthy()),
    )
}

fn stage(root: &TempDir, tag: &str, manifest: Option<&str>) -> PathBuf {
    let dir = root.path().join("incoming").join(tag);
    fs::create_dir_all(dir.join("service")).expect("mkdir");
    fs::write(dir.join("service/__init__.py"), "").expect("marker");
    fs::write(dir.join("service/app.py"), "app = object()\n").expect("app");
    if let Some(json) = manifest {
        fs::write(dir.join("release.json"), json).expect("manifest");
    }
    dir
}

fn meta() -> UploadMeta {
    UploadMeta {
        description: "uploaded".to_string(),
        api_port: None,
        created_by: "ops".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Upload, listing and manifest defaults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingest_fills_defaults_validates_and_archives() {
    let (root, manager, _rt) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    let staged = stage(&root, "a", Some(r#"{"owner_team":"ml-platform"}"#));

    let ingest = manager.ingest("model v1", &staged, &meta()).await.expect("ingest");
    assert_eq!(ingest.release, "modelv1");
    assert!(ingest.report.ok, "{:?}", ingest.report.errors);
    assert!(ingest.archive.path.is_file());

    let release = manager.get("modelv1").expect("get");
    let manifest = Manifest::load(&release.manifest_path()).expect("manifest");
    assert_eq!(manifest.release_name, "modelv1");
    assert_eq!(manifest.project_name, "generic-service");
    assert_eq!(manifest.service_type, "fastapi");
    assert_eq!(manifest.entrypoint, "service.app:app");
    assert_eq!(manifest.port(), 8000);
    assert_eq!(manifest.healthcheck.path, "/health");
    assert_eq!(manifest.created_by, "ops");
    assert!(manifest.created_at.is_some());
    assert_eq!(manifest.extra["owner_team"], "ml-platform");
}

#[tokio::test]
async fn list_reports_every_status() {
    let (root, manager, _rt) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    manager
        .ingest("b_valid", &stage(&root, "b", None), &meta())
        .await
        .expect("ingest b");
    manager
        .ingest(
            "c_invalid",
            &stage(&root, "c", Some(r#"{"dependencies":["torch"]}"#)),
            &meta(),
        )
        .await
        .expect("ingest c");
    manager
        .ingest("a_live", &stage(&root, "a", None), &meta())
        .await
        .expect("ingest a");
    manager.clone_release("b_valid").expect("clone");
    manager.deploy("a_live").await.expect("deploy");

    let rows: Vec<(String, ReleaseStatus)> = manager
        .list()
        .expect("list")
        .into_iter()
        .map(|r| (r.name, r.status))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("a_live".to_string(), ReleaseStatus::Active),
            ("b_valid".to_string(), ReleaseStatus::Valid),
            ("b_valid_copy_001".to_string(), ReleaseStatus::NotValidated),
            ("c_invalid".to_string(), ReleaseStatus::Invalid),
        ]
    );
}

#[tokio::test]
async fn duplicate_upload_is_rejected() {
    let (root, manager, _rt) = manager_with(MemoryRuntime::new());
    manager
        .ingest("dup", &stage(&root, "one", None), &meta())
        .await
        .expect("first");
    let err = manager
        .ingest("dup", &stage(&root, "two", None), &meta())
        .await
        .expect_err("second");
    assert!(matches!(err, BerthError::ReleaseExists(_)));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revalidation_without_changes_is_stable() {
    let (root, manager, _rt) = manager_with(MemoryRuntime::new().with_packages(["fastapi"]));
    manager
        .ingest("r", &stage(&root, "r", None), &meta())
        .await
        .expect("ingest");

    let first = manager.validate("r").await.expect("validate");
    let second = manager.validate("r").await.expect("validate");
    assert!(!first.ok);
    assert_eq!(first.ok, second.ok);
    assert_eq!(first.errors, second.errors);
    assert_eq!(first.errors, vec!["missing dependencies: uvicorn".to_string()]);
}

#[tokio::test]
async fn runtime_is_created_once_per_release() {
    let (root, manager, runtime) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    manager
        .ingest("r", &stage(&root, "r", None), &meta())
        .await
        .expect("ingest");
    manager.validate("r").await.expect("validate");
    manager.validate("r").await.expect("validate");
    assert_eq!(runtime.created_count(), 1);
}

// ---------------------------------------------------------------------------
// Dependency install
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_fixes_missing_dependencies_and_flips_to_valid() {
    let (root, manager, runtime) = manager_with(
        MemoryRuntime::new()
            .with_packages(["fastapi", "uvicorn"])
            .with_install_delay(Duration::from_millis(5)),
    );
    let manifest = r#"{"dependencies":["numpy>=1.26","Pandas","numpy"]}"#;
    manager
        .ingest("ds", &stage(&root, "ds", Some(manifest)), &meta())
        .await
        .expect("ingest");
    assert_eq!(
        manager.missing("ds").await.expect("missing"),
        vec!["numpy>=1.26", "Pandas"]
    );

    let initial = manager.install("ds").await.expect("install");
    assert_eq!(initial.status, InstallStatus::Running);
    manager.join_install("ds").await.expect("join");

    let last = manager.install_status("ds").expect("status");
    assert_eq!(last.status, InstallStatus::Done);
    assert_eq!(last.progress, 100);
    assert_eq!(runtime.install_log(), vec!["numpy>=1.26", "Pandas"]);
    assert!(manager.missing("ds").await.expect("missing").is_empty());

    let report = manager.validate("ds").await.expect("validate");
    assert!(report.ok);
}

#[tokio::test]
async fn install_status_is_idle_before_any_run() {
    let (root, manager, _rt) = manager_with(MemoryRuntime::new());
    manager
        .ingest("r", &stage(&root, "r", None), &meta())
        .await
        .expect("ingest");
    let status = manager.install_status("r").expect("status");
    assert_eq!(status.status, InstallStatus::Idle);
    assert_eq!(status.progress, 0);
}

#[tokio::test]
async fn delete_is_refused_while_installing() {
    let (root, manager, _rt) = manager_with(
        MemoryRuntime::new().with_install_delay(Duration::from_millis(50)),
    );
    manager
        .ingest("busy", &stage(&root, "busy", None), &meta())
        .await
        .expect("ingest");
    manager.install("busy").await.expect("install");

    let err = manager.delete("busy").await.expect_err("installing");
    assert!(matches!(err, BerthError::InstallInProgress(_)));

    manager.join_install("busy").await.expect("join");
    manager.delete("busy").await.expect("delete");
}

#[tokio::test]
async fn managers_sharing_a_root_never_run_the_same_install_twice() {
    let (root, first, runtime) = manager_with(
        MemoryRuntime::new()
            .with_packages(["fastapi", "uvicorn"])
            .with_install_delay(Duration::from_millis(50)),
    );
    let second = sibling(&root, runtime.clone());
    first
        .ingest("shared", &stage(&root, "shared", Some(r#"{"dependencies":["numpy"]}"#)), &meta())
        .await
        .expect("ingest");

    first.install("shared").await.expect("install");
    assert!(second.install_running("shared").expect("running"));
    let err = second.install("shared").await.expect_err("already installing");
    assert!(matches!(err, BerthError::InstallInProgress(_)));
    let err = second.delete("shared").await.expect_err("still installing");
    assert!(matches!(err, BerthError::InstallInProgress(_)));
    assert_eq!(
        second.install_status("shared").expect("status").status,
        InstallStatus::Running
    );

    first.join_install("shared").await.expect("join");
    assert!(!second.install_running("shared").expect("running"));
    assert_eq!(runtime.install_log(), vec!["numpy"]);
    assert_eq!(
        second.install_status("shared").expect("status").status,
        InstallStatus::Done
    );
}

// ---------------------------------------------------------------------------
// Edit, clone, archive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn edit_changes_manifest_and_requires_revalidation() {
    let (root, manager, _rt) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    manager
        .ingest("r", &stage(&root, "r", None), &meta())
        .await
        .expect("ingest");

    let edit = ReleaseEdit {
        description: Some("tuned".to_string()),
        api_port: Some(8100),
        dependencies: None,
    };
    let manifest = manager.edit("r", &edit).await.expect("edit");
    assert_eq!(manifest.description, "tuned");
    assert_eq!(manifest.port(), 8100);

    let row = manager
        .list()
        .expect("list")
        .into_iter()
        .find(|r| r.name == "r")
        .expect("row");
    assert_eq!(row.status, ReleaseStatus::NotValidated);
}

#[tokio::test]
async fn archive_tracks_release_content() {
    let (root, manager, _rt) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    let ingest = manager
        .ingest("r", &stage(&root, "r", None), &meta())
        .await
        .expect("ingest");

    let again = manager.archive("r").expect("archive");
    assert!(!again.rebuilt);
    assert_eq!(again.fingerprint, ingest.archive.fingerprint);

    manager
        .edit(
            "r",
            &ReleaseEdit {
                description: Some("changed".to_string()),
                ..ReleaseEdit::default()
            },
        )
        .await
        .expect("edit");
    let rebuilt = manager.archive("r").expect("archive");
    assert!(rebuilt.rebuilt);
    assert_ne!(rebuilt.fingerprint, ingest.archive.fingerprint);
}

#[tokio::test]
async fn clones_number_sequentially_and_never_share_runtime() {
    let (root, manager, runtime) =
        manager_with(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
    manager
        .ingest("base", &stage(&root, "base", None), &meta())
        .await
        .expect("ingest");

    let first = manager.clone_release("base").expect("clone 1");
    let second = manager.clone_release("base").expect("clone 2");
    assert_eq!(first.name.as_str(), "base_copy_001");
    assert_eq!(second.name.as_str(), "base_copy_002");
    assert!(!first.dir.join(".venv").exists());

    let report = manager.validate("base_copy_001").await.expect("validate");
    assert!(report.ok);
    assert_eq!(runtime.created_count(), 2);
}
