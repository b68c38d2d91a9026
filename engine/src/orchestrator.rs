use crate::report::{
    BackupReport, BackupSummary, ListReport, RemoveOldReport, RemoveReport, ReportEntry, ReportSink,
    RetrieveReport,
};
use chrono::Utc;
use coldstash_backends::{ArchivalClient, VaultApi};
use coldstash_core::archive::{self, ExtractOptions, ExtractReport};
use coldstash_core::{
    ArchiveBuilder, Backup, Envelope, Error, Info, Job, JobId, JobStatus, MetadataStore, Result, treehash,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Pause between two status checks of a remote job.
    pub poll_interval: Duration,
    /// Where retrieved files are written. `None` restores in place.
    pub restore_root: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            restore_root: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub paths: Vec<PathBuf>,
    pub key: Vec<u8>,
    /// Percentage of changed files tolerated against the previous backup.
    pub tolerance: f64,
    pub ignore_patterns: Vec<Regex>,
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::Other(format!("Background task failed: {}", e)))?
}

/// Runs the five user-facing operations. One operation at a time per
/// instance.
pub struct Orchestrator<V: VaultApi> {
    client: ArchivalClient<V>,
    store: Arc<dyn MetadataStore>,
    reports: Arc<dyn ReportSink>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    run_lock: Mutex<()>,
}

impl<V: VaultApi + 'static> Orchestrator<V> {
    pub fn new(
        client: ArchivalClient<V>,
        store: Box<dyn MetadataStore>,
        reports: Arc<dyn ReportSink>,
        settings: OrchestratorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            store: Arc::from(store),
            reports,
            settings,
            cancel,
            run_lock: Mutex::new(()),
        }
    }

    async fn with_store<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&dyn MetadataStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        blocking(move || task(store.as_ref())).await
    }

    /// Archives, encrypts and uploads the requested paths, then records the
    /// backup locally.
    pub async fn backup(&self, request: &BackupRequest) -> Result<Backup> {
        let _running = self.run_lock.lock().await;
        let mut report = BackupReport::new(request.paths.clone());

        let result = self.run_backup(request, &mut report).await;
        match &result {
            Ok(backup) => report.backup = Some(BackupSummary::from(backup)),
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "Backup failed");
                report.errors.push(e.to_string());
            }
        }

        self.reports.add(ReportEntry::Backup(report));
        result
    }

    async fn run_backup(&self, request: &BackupRequest, report: &mut BackupReport) -> Result<Backup> {
        let envelope = Envelope::new(&request.key)?;

        let previous: Option<Info> = self
            .with_store(|store| store.list())
            .await?
            .pop()
            .map(|latest| latest.info);

        let started = Instant::now();
        let builder = ArchiveBuilder::new(request.ignore_patterns.clone()).with_tolerance(request.tolerance);
        let paths = request.paths.clone();
        let built = blocking(move || builder.build(&paths, previous.as_ref())).await?;
        report.durations.build = started.elapsed();
        report.record_stats(&built.stats);

        let info = built.info;
        let container = built.file;
        let started = Instant::now();
        let encrypted = blocking(move || envelope.wrap_file(container.path())).await?;
        report.durations.encrypt = started.elapsed();

        let started = Instant::now();
        let receipt = self.client.upload(encrypted.path()).await?;
        report.durations.upload = started.elapsed();

        let backup = Backup {
            id: receipt.archive_id,
            vault_name: self.client.vault_name().to_string(),
            created_at: receipt.created_at,
            checksum: receipt.checksum,
            size: receipt.size,
            info,
        };

        let record = backup.clone();
        if let Err(e) = self.with_store(move |store| store.save(&record)).await {
            error!(
                id = %backup.id,
                error = %e,
                "Archive uploaded but not recorded locally, a remote listing will recover it"
            );
            return Err(e);
        }

        info!(id = %backup.id, size = backup.size, "Backup complete");
        Ok(backup)
    }

    /// Downloads a backup and restores its files.
    pub async fn retrieve_backup(&self, id: &str, key: &[u8], skip_unmodified: bool) -> Result<ExtractReport> {
        let _running = self.run_lock.lock().await;
        let mut report = RetrieveReport {
            created_at: Utc::now(),
            id: id.to_string(),
            restored: 0,
            skipped: 0,
            wait: Duration::ZERO,
            download: Duration::ZERO,
            extract: Duration::ZERO,
            errors: Vec::new(),
        };

        let result = self.run_retrieve(id, key, skip_unmodified, &mut report).await;
        match &result {
            Ok(extracted) => {
                report.restored = extracted.restored.len();
                report.skipped = extracted.skipped.len();
            }
            Err(e) => {
                error!(id, kind = %e.kind(), error = %e, "Retrieve failed");
                report.errors.push(e.to_string());
            }
        }

        self.reports.add(ReportEntry::Retrieve(report));
        result
    }

    async fn find_backup(&self, id: &str) -> Result<Backup> {
        let wanted = id.to_string();
        let local = self
            .with_store(move |store| Ok(store.list()?.into_iter().find(|b| b.id == wanted)))
            .await?;
        if let Some(backup) = local {
            return Ok(backup);
        }

        debug!(id, "Backup not recorded locally, checking the vault inventory");
        let job_id = self.client.request_inventory().await?;
        self.wait_for_job(&job_id).await?;
        self.client
            .fetch_inventory(&job_id)
            .await?
            .into_iter()
            .find(|archive| archive.archive_id == id)
            .map(|archive| archive.into_backup(self.client.vault_name()))
            .ok_or_else(|| Error::not_found(id))
    }

    async fn run_retrieve(
        &self,
        id: &str,
        key: &[u8],
        skip_unmodified: bool,
        report: &mut RetrieveReport,
    ) -> Result<ExtractReport> {
        let envelope = Envelope::new(key)?;
        let backup = self.find_backup(id).await?;

        let started = Instant::now();
        let job_id = self.client.request_retrieval(&backup.id).await?;
        self.wait_for_job(&job_id).await?;
        report.wait = started.elapsed();

        let started = Instant::now();
        let downloaded = self.client.fetch_archive(&job_id).await?;
        report.download = started.elapsed();

        let started = Instant::now();
        let restore_root = self.settings.restore_root.clone();
        let extracted = blocking(move || {
            if !backup.checksum.is_empty() {
                let actual = treehash::file_tree_hash(downloaded.path())?;
                if actual != backup.checksum {
                    return Err(Error::ChecksumMismatch {
                        local: actual,
                        remote: backup.checksum,
                    });
                }
            }

            let container = envelope.unwrap_file(downloaded.path())?;
            drop(downloaded);

            let recorded = if backup.info.is_empty() {
                archive::read_manifest(container.path())?
            } else {
                backup.info
            };

            archive::extract(
                container.path(),
                &ExtractOptions {
                    restore_root,
                    skip_unmodified,
                    recorded,
                },
            )
        })
        .await?;
        report.extract = started.elapsed();

        info!(
            id,
            restored = extracted.restored.len(),
            skipped = extracted.skipped.len(),
            "Backup retrieved"
        );
        Ok(extracted)
    }

    /// Deletes each backup remotely, then locally. Stops at the first
    /// failure.
    pub async fn remove_backups(&self, ids: &[String]) -> Result<()> {
        let _running = self.run_lock.lock().await;
        let started = Instant::now();
        let mut removed = Vec::new();

        let result = self.remove_each(ids, &mut removed).await;
        let mut report = RemoveReport {
            created_at: Utc::now(),
            requested: ids.to_vec(),
            removed,
            duration: started.elapsed(),
            errors: Vec::new(),
        };
        if let Err(e) = &result {
            error!(kind = %e.kind(), error = %e, "Remove failed");
            report.errors.push(e.to_string());
        }

        self.reports.add(ReportEntry::Remove(report));
        result
    }

    async fn remove_each(&self, ids: &[String], removed: &mut Vec<String>) -> Result<()> {
        for id in ids {
            self.client.delete(id).await?;
            let target = id.clone();
            self.with_store(move |store| store.remove(&target)).await?;
            removed.push(id.clone());
        }
        Ok(())
    }

    /// Lists backups from the local store, optionally reconciling it with
    /// the vault inventory first.
    pub async fn list_backups(&self, remote: bool) -> Result<Vec<Backup>> {
        let _running = self.run_lock.lock().await;
        let started = Instant::now();
        let mut report = ListReport {
            created_at: Utc::now(),
            remote,
            count: 0,
            wait: Duration::ZERO,
            duration: Duration::ZERO,
            errors: Vec::new(),
        };

        let result = self.run_list(remote, &mut report).await;
        report.duration = started.elapsed();
        match &result {
            Ok(backups) => report.count = backups.len(),
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "List failed");
                report.errors.push(e.to_string());
            }
        }

        self.reports.add(ReportEntry::List(report));
        result
    }

    async fn run_list(&self, remote: bool, report: &mut ListReport) -> Result<Vec<Backup>> {
        if !remote {
            return self.with_store(|store| store.list()).await;
        }

        let started = Instant::now();
        let job_id = self.client.request_inventory().await?;
        self.wait_for_job(&job_id).await?;
        report.wait = started.elapsed();

        let archives = self.client.fetch_inventory(&job_id).await?;
        let vault_name = self.client.vault_name().to_string();

        self.with_store(move |store| {
            let remote_ids: HashSet<String> = archives.iter().map(|a| a.archive_id.clone()).collect();
            let local = store.list()?;
            let local_ids: HashSet<String> = local.iter().map(|b| b.id.clone()).collect();

            for backup in &local {
                if !remote_ids.contains(&backup.id) {
                    info!(id = %backup.id, "Forgetting backup missing from the vault");
                    store.remove(&backup.id)?;
                }
            }
            for archive in archives {
                if !local_ids.contains(&archive.archive_id) {
                    info!(id = %archive.archive_id, "Recording backup found in the vault");
                    store.save(&archive.into_backup(&vault_name))?;
                }
            }

            store.list()
        })
        .await
    }

    /// Keeps the `keep` most recent backups and removes the rest.
    pub async fn remove_old_backups(&self, keep: usize) -> Result<Vec<Backup>> {
        let _running = self.run_lock.lock().await;
        let mut report = RemoveOldReport {
            created_at: Utc::now(),
            keep,
            removed: Vec::new(),
            list: Duration::ZERO,
            remove: Duration::ZERO,
            errors: Vec::new(),
        };

        let started = Instant::now();
        let listed = self.with_store(|store| store.list()).await;
        report.list = started.elapsed();

        let result = match listed {
            Ok(mut backups) => {
                backups.reverse();
                let expired: Vec<Backup> = backups.into_iter().skip(keep).collect();
                let ids: Vec<String> = expired.iter().map(|b| b.id.clone()).collect();

                let started = Instant::now();
                let mut removed = Vec::new();
                let outcome = self.remove_each(&ids, &mut removed).await;
                report.remove = started.elapsed();

                let removed: Vec<Backup> = expired
                    .into_iter()
                    .filter(|b| removed.contains(&b.id))
                    .collect();
                report.removed = removed.iter().map(BackupSummary::from).collect();
                outcome.map(|()| removed)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(kind = %e.kind(), error = %e, "Removing old backups failed");
            report.errors.push(e.to_string());
        }

        self.reports.add(ReportEntry::RemoveOld(report));
        result
    }

    /// Polls a remote job until it finishes or the orchestrator is
    /// cancelled.
    pub async fn wait_for_job(&self, job_id: &JobId) -> Result<Job> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let job = self.client.poll_job(job_id).await?;
            match job.status {
                JobStatus::Succeeded => return Ok(job),
                JobStatus::Failed => {
                    warn!(job_id = %job_id, message = ?job.status_message, "Remote job failed");
                    return Err(Error::RemoteJobFailed {
                        job_id: job_id.to_string(),
                        message: job.status_message.unwrap_or_default(),
                    });
                }
                JobStatus::Submitted | JobStatus::InProgress => {
                    debug!(
                        job_id = %job_id,
                        poll_interval_ms = self.settings.poll_interval.as_millis(),
                        "Job still running"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(job_id = %job_id, "Stopped waiting for job");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}
