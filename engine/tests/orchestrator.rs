use bytes::Bytes;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use coldstash_backends::{ArchivalClient, ClientConfig, MemoryVault, RetryConfig};
use coldstash_core::store::AuditFile;
use coldstash_core::{Backup, ErrorKind, Info, ItemStatus, MetadataStore, StoreKind, open_store};
use coldstash_engine::{BackupRequest, Orchestrator, OrchestratorSettings, ReportEntry, ReportLog};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const KEY: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

struct Harness {
    vault: Arc<MemoryVault>,
    orchestrator: Orchestrator<MemoryVault>,
    reports: Arc<ReportLog>,
    store_path: PathBuf,
    cancel: CancellationToken,
    dir: TempDir,
}

impl Harness {
    fn new(vault: Arc<MemoryVault>) -> Self {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("audit.log");
        let restore_root = dir.path().join("restore");
        Self::build(vault, dir, store_path, StoreKind::Audit, Some(restore_root))
    }

    fn build(
        vault: Arc<MemoryVault>,
        dir: TempDir,
        store_path: PathBuf,
        kind: StoreKind,
        restore_root: Option<PathBuf>,
    ) -> Self {
        let config = ClientConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        };
        let client = ArchivalClient::new(vault.clone(), config).unwrap();
        let reports = Arc::new(ReportLog::new());
        let cancel = CancellationToken::new();
        let settings = OrchestratorSettings {
            poll_interval: Duration::from_millis(10),
            restore_root,
        };

        let orchestrator = Orchestrator::new(
            client,
            open_store(kind, &store_path),
            reports.clone(),
            settings,
            cancel.clone(),
        );

        Self {
            vault,
            orchestrator,
            reports,
            store_path,
            cancel,
            dir,
        }
    }

    fn store(&self) -> AuditFile {
        AuditFile::new(&self.store_path)
    }

    fn restored(&self, original: &Path) -> PathBuf {
        let relative: PathBuf = original
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        self.dir.path().join("restore").join(relative)
    }
}

fn request(paths: &[&Path], tolerance: f64) -> BackupRequest {
    BackupRequest {
        paths: paths.iter().map(|p| p.to_path_buf()).collect(),
        key: KEY.to_vec(),
        tolerance,
        ignore_patterns: vec![],
    }
}

fn backup_at(id: &str, day: u32) -> Backup {
    Backup {
        id: id.to_string(),
        vault_name: "vault".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        checksum: String::new(),
        size: 0,
        info: Info::new(),
    }
}

#[tokio::test]
async fn backup_then_retrieve_restores_files() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault").with_job_delay(1)));
    let source = TempDir::new().unwrap();
    let file = source.path().join("report.txt");
    fs::write(&file, "quarterly numbers").unwrap();

    let backup = harness
        .orchestrator
        .backup(&request(&[source.path()], 100.0))
        .await
        .unwrap();
    assert_eq!(backup.info[&file.to_string_lossy().to_string()].status, ItemStatus::New);
    assert_eq!(harness.store().list().unwrap(), vec![backup.clone()]);
    assert_eq!(harness.vault.archive_ids().await, vec![backup.id.clone()]);

    let extracted = harness
        .orchestrator
        .retrieve_backup(&backup.id, KEY, false)
        .await
        .unwrap();
    assert_eq!(extracted.restored.len(), 1);
    assert_eq!(fs::read_to_string(harness.restored(&file)).unwrap(), "quarterly numbers");

    let entries = harness.reports.entries();
    assert_eq!(entries.len(), 2);
    assert!(matches!(entries[0], ReportEntry::Backup(_)));
    assert!(entries.iter().all(|entry| entry.is_success()));
}

#[tokio::test]
async fn unchanged_and_new_files_within_tolerance() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("a"), "a").unwrap();
    fs::write(source.path().join("b"), "b").unwrap();

    harness
        .orchestrator
        .backup(&request(&[source.path()], 50.0))
        .await
        .unwrap();

    let added = source.path().join("c");
    fs::write(&added, "c").unwrap();
    let second = harness
        .orchestrator
        .backup(&request(&[source.path()], 50.0))
        .await
        .unwrap();

    let statuses: Vec<ItemStatus> = second.info.values().map(|item| item.status).collect();
    assert_eq!(
        statuses,
        vec![ItemStatus::Unmodified, ItemStatus::Unmodified, ItemStatus::New]
    );
    assert_eq!(harness.store().list().unwrap().len(), 2);
}

#[tokio::test]
async fn threshold_abort_touches_nothing_remote() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let source = TempDir::new().unwrap();
    let file = source.path().join("a");
    fs::write(&file, "original").unwrap();

    harness
        .orchestrator
        .backup(&request(&[source.path()], 10.0))
        .await
        .unwrap();
    let calls = harness.vault.call_count();

    fs::write(&file, "rewritten").unwrap();
    let err = harness
        .orchestrator
        .backup(&request(&[source.path()], 10.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChangeThresholdExceeded);
    assert_eq!(harness.vault.call_count(), calls);
    assert_eq!(harness.store().list().unwrap().len(), 1);

    let entries = harness.reports.entries();
    assert!(!entries[1].is_success());
}

#[tokio::test]
async fn remove_old_keeps_most_recent() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let store = harness.store();
    for day in 1..=5 {
        let id = format!("archive-{}", day);
        store.save(&backup_at(&id, day)).unwrap();
        harness
            .vault
            .insert_archive(&id, Bytes::from(id.clone()), backup_at(&id, day).created_at)
            .await;
    }

    let removed = harness.orchestrator.remove_old_backups(3).await.unwrap();
    let removed_ids: Vec<_> = removed.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(removed_ids, vec!["archive-2", "archive-1"]);

    let kept: Vec<_> = store.list().unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(kept, vec!["archive-3", "archive-4", "archive-5"]);
    assert_eq!(harness.vault.archive_ids().await, kept);

    let again = harness.orchestrator.remove_old_backups(3).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(store.list().unwrap().len(), 3);
}

#[tokio::test]
async fn remote_listing_reconciles_local_store() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault").with_job_delay(2)));
    let store = harness.store();

    let mut shared = backup_at("shared", 2);
    shared.info.insert(
        "/data/kept.txt".to_string(),
        coldstash_core::ItemInfo::new(ItemStatus::New, None, "abc".to_string()),
    );
    store.save(&backup_at("local-only", 1)).unwrap();
    store.save(&shared).unwrap();

    harness
        .vault
        .insert_archive("shared", Bytes::from_static(b"s"), shared.created_at)
        .await;
    harness
        .vault
        .insert_archive("remote-only", Bytes::from_static(b"r"), Utc::now() - ChronoDuration::hours(1))
        .await;

    let listed = harness.orchestrator.list_backups(true).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["shared", "remote-only"]);
    assert_eq!(listed[0].info, shared.info);
    assert!(listed[1].info.is_empty());
    assert_eq!(listed[1].size, 1);

    assert_eq!(harness.orchestrator.list_backups(false).await.unwrap(), listed);
}

#[tokio::test]
async fn removing_twice_succeeds() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    harness.store().save(&backup_at("gone", 1)).unwrap();
    harness
        .vault
        .insert_archive("gone", Bytes::from_static(b"g"), Utc::now())
        .await;

    let ids = vec!["gone".to_string()];
    harness.orchestrator.remove_backups(&ids).await.unwrap();
    harness.orchestrator.remove_backups(&ids).await.unwrap();

    assert!(harness.store().list().unwrap().is_empty());
    assert!(harness.vault.archive_ids().await.is_empty());
}

#[tokio::test]
async fn remove_stops_at_first_failure() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let store = harness.store();
    store.save(&backup_at("first", 1)).unwrap();
    store.save(&backup_at("second", 2)).unwrap();
    harness.vault.fail_next(10);

    let ids = vec!["first".to_string(), "second".to_string()];
    let err = harness.orchestrator.remove_backups(&ids).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    assert_eq!(store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn cancellation_interrupts_job_wait() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault").with_job_delay(10_000)));

    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = harness.orchestrator.list_backups(true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn failed_job_is_surfaced() {
    let vault = Arc::new(MemoryVault::new("vault"));
    vault.fail_jobs(true);
    let harness = Harness::new(vault);

    let err = harness.orchestrator.list_backups(true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteJobFailed);
}

#[tokio::test]
async fn retrieve_unknown_backup_is_not_found() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let err = harness
        .orchestrator
        .retrieve_backup("missing", KEY, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn retrieve_remote_only_backup_uses_manifest() {
    let vault = Arc::new(MemoryVault::new("vault"));
    let source = TempDir::new().unwrap();
    let file = source.path().join("notes.md");
    fs::write(&file, "remember the milk").unwrap();

    let first = Harness::new(vault.clone());
    let backup = first
        .orchestrator
        .backup(&request(&[source.path()], 100.0))
        .await
        .unwrap();

    // A second machine with an empty key-value store sees only the vault.
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store.db");
    let restore_root = dir.path().join("restore");
    let second = Harness::build(vault, dir, store_path, StoreKind::Kv, Some(restore_root));

    let extracted = second
        .orchestrator
        .retrieve_backup(&backup.id, KEY, false)
        .await
        .unwrap();
    assert_eq!(extracted.restored, vec![second.restored(&file)]);
    assert_eq!(fs::read_to_string(second.restored(&file)).unwrap(), "remember the milk");
}

#[tokio::test]
async fn retrieve_with_wrong_key_yields_no_valid_archive() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("secret"), "s3cr3t").unwrap();

    let backup = harness
        .orchestrator
        .backup(&request(&[source.path()], 100.0))
        .await
        .unwrap();

    let wrong = [7u8; 32];
    let err = harness
        .orchestrator
        .retrieve_backup(&backup.id, &wrong, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveFormat);
}

#[tokio::test]
async fn retrieve_rejects_archive_with_different_checksum() {
    let harness = Harness::new(Arc::new(MemoryVault::new("vault")));
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("ledger.csv"), "1,2,3").unwrap();

    let backup = harness
        .orchestrator
        .backup(&request(&[source.path()], 100.0))
        .await
        .unwrap();

    harness
        .vault
        .insert_archive(&backup.id, Bytes::from_static(b"bytes that were never uploaded"), backup.created_at)
        .await;

    let err = harness
        .orchestrator
        .retrieve_backup(&backup.id, KEY, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    assert!(!harness.dir.path().join("restore").exists());
}

#[tokio::test]
async fn retrieve_in_place_skips_unmodified_files() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("audit.log");
    let harness = Harness::build(Arc::new(MemoryVault::new("vault")), dir, store_path, StoreKind::Audit, None);

    let source = TempDir::new().unwrap();
    let untouched = source.path().join("untouched.txt");
    let edited = source.path().join("edited.txt");
    fs::write(&untouched, "stays the same").unwrap();
    fs::write(&edited, "original text").unwrap();

    let backup = harness
        .orchestrator
        .backup(&request(&[source.path()], 100.0))
        .await
        .unwrap();

    fs::write(&edited, "local changes").unwrap();
    let extracted = harness
        .orchestrator
        .retrieve_backup(&backup.id, KEY, true)
        .await
        .unwrap();

    assert_eq!(extracted.skipped, vec![untouched.clone()]);
    assert_eq!(extracted.restored, vec![edited.clone()]);
    assert_eq!(fs::read_to_string(&edited).unwrap(), "original text");
    assert_eq!(fs::read_to_string(&untouched).unwrap(), "stays the same");
}
