//! In-memory vault for tests.

use crate::vault::{ArchiveReceipt, JobRequest, VaultApi};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use coldstash_core::treehash::tree_hash_hex;
use coldstash_core::{Error, Job, JobId, JobKind, JobStatus, Result};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredArchive {
    description: String,
    data: Bytes,
    checksum: String,
    created_at: DateTime<Utc>,
}

struct PendingUpload {
    description: String,
    parts: BTreeMap<u64, Bytes>,
}

struct JobState {
    job: Job,
    request: JobRequest,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    archives: BTreeMap<String, StoredArchive>,
    uploads: HashMap<String, PendingUpload>,
    jobs: HashMap<JobId, JobState>,
}

/// Vault kept in memory. Jobs complete after a configurable number of
/// status checks, and a few switches inject the failures a real vault
/// produces.
pub struct MemoryVault {
    name: String,
    state: RwLock<State>,
    job_delay: u32,
    transient_failures: AtomicU32,
    corrupt_checksums: AtomicBool,
    fail_jobs: AtomicBool,
    calls: AtomicU32,
}

impl MemoryVault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(State::default()),
            job_delay: 0,
            transient_failures: AtomicU32::new(0),
            corrupt_checksums: AtomicBool::new(false),
            fail_jobs: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of `describe_job` calls that report `InProgress` before a job
    /// finishes.
    pub fn with_job_delay(mut self, polls: u32) -> Self {
        self.job_delay = polls;
        self
    }

    /// The next `count` calls of any kind fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Report checksums that never match what was sent.
    pub fn corrupt_checksums(&self, enabled: bool) {
        self.corrupt_checksums.store(enabled, Ordering::SeqCst);
    }

    /// Every job started from now on ends up `Failed`.
    pub fn fail_jobs(&self, enabled: bool) {
        self.fail_jobs.store(enabled, Ordering::SeqCst);
    }

    /// Total API calls received, failed ones included.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Places an archive directly in the vault, as if uploaded by another
    /// machine.
    pub async fn insert_archive(&self, id: &str, data: impl Into<Bytes>, created_at: DateTime<Utc>) {
        let data = data.into();
        let archive = StoredArchive {
            description: String::new(),
            checksum: tree_hash_hex(&data),
            data,
            created_at,
        };
        self.state.write().await.archives.insert(id.to_string(), archive);
    }

    pub async fn archive_ids(&self) -> Vec<String> {
        self.state.read().await.archives.keys().cloned().collect()
    }

    pub async fn archive(&self, id: &str) -> Option<Bytes> {
        self.state.read().await.archives.get(id).map(|a| a.data.clone())
    }

    pub async fn pending_uploads(&self) -> usize {
        self.state.read().await.uploads.len()
    }

    fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::RemoteTransient {
                operation: operation.to_string(),
                message: "injected transient failure".to_string(),
            });
        }
        Ok(())
    }

    fn reported_checksum(&self, actual: String) -> String {
        if self.corrupt_checksums.load(Ordering::SeqCst) {
            "0".repeat(64)
        } else {
            actual
        }
    }

    fn inventory_json(&self, state: &State) -> Result<Bytes> {
        let archives: Vec<_> = state
            .archives
            .iter()
            .map(|(id, archive)| {
                json!({
                    "ArchiveId": id,
                    "ArchiveDescription": archive.description,
                    "CreationDate": archive.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "Size": archive.data.len(),
                    "SHA256TreeHash": archive.checksum,
                })
            })
            .collect();

        let inventory = json!({
            "VaultARN": format!("arn:aws:glacier:us-east-1:000000000000:vaults/{}", self.name),
            "InventoryDate": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "ArchiveList": archives,
        });
        Ok(Bytes::from(serde_json::to_vec(&inventory)?))
    }
}

#[async_trait]
impl VaultApi for MemoryVault {
    fn vault_name(&self) -> &str {
        &self.name
    }

    async fn upload_archive(&self, description: &str, checksum: &str, body: Bytes) -> Result<ArchiveReceipt> {
        self.enter("upload_archive")?;

        let actual = tree_hash_hex(&body);
        if actual != checksum {
            return Err(Error::RemoteFailure {
                operation: "upload_archive".to_string(),
                message: format!("checksum {} does not match payload", checksum),
            });
        }

        let archive_id = uuid::Uuid::new_v4().simple().to_string();
        let archive = StoredArchive {
            description: description.to_string(),
            data: body,
            checksum: actual.clone(),
            created_at: Utc::now(),
        };
        self.state.write().await.archives.insert(archive_id.clone(), archive);

        Ok(ArchiveReceipt {
            archive_id,
            checksum: self.reported_checksum(actual),
        })
    }

    async fn initiate_multipart(&self, description: &str, _part_size: u64) -> Result<String> {
        self.enter("initiate_multipart")?;

        let upload_id = uuid::Uuid::new_v4().to_string();
        self.state.write().await.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                description: description.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        start: u64,
        end: u64,
        checksum: &str,
        body: Bytes,
    ) -> Result<String> {
        self.enter("upload_part")?;

        if end + 1 - start != body.len() as u64 {
            return Err(Error::RemoteFailure {
                operation: "upload_part".to_string(),
                message: format!("range {}-{} does not match {} bytes", start, end, body.len()),
            });
        }
        let actual = tree_hash_hex(&body);
        if actual != checksum {
            return Err(Error::RemoteFailure {
                operation: "upload_part".to_string(),
                message: format!("checksum {} does not match part", checksum),
            });
        }

        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::not_found(upload_id))?;
        upload.parts.insert(start, body);

        Ok(self.reported_checksum(actual))
    }

    async fn complete_multipart(&self, upload_id: &str, archive_size: u64, checksum: &str) -> Result<ArchiveReceipt> {
        self.enter("complete_multipart")?;

        let mut state = self.state.write().await;
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::not_found(upload_id))?;

        let mut data = BytesMut::with_capacity(archive_size as usize);
        for (start, part) in upload.parts {
            if start != data.len() as u64 {
                return Err(Error::RemoteFailure {
                    operation: "complete_multipart".to_string(),
                    message: format!("missing bytes before offset {}", start),
                });
            }
            data.extend_from_slice(&part);
        }
        if data.len() as u64 != archive_size {
            return Err(Error::RemoteFailure {
                operation: "complete_multipart".to_string(),
                message: format!("expected {} bytes, received {}", archive_size, data.len()),
            });
        }

        let data = data.freeze();
        let actual = tree_hash_hex(&data);
        if actual != checksum {
            return Err(Error::RemoteFailure {
                operation: "complete_multipart".to_string(),
                message: format!("checksum {} does not match archive", checksum),
            });
        }

        let archive_id = uuid::Uuid::new_v4().simple().to_string();
        state.archives.insert(
            archive_id.clone(),
            StoredArchive {
                description: upload.description,
                data,
                checksum: actual.clone(),
                created_at: Utc::now(),
            },
        );

        Ok(ArchiveReceipt {
            archive_id,
            checksum: self.reported_checksum(actual),
        })
    }

    async fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        self.enter("abort_multipart")?;
        self.state.write().await.uploads.remove(upload_id);
        Ok(())
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<()> {
        self.enter("delete_archive")?;
        match self.state.write().await.archives.remove(archive_id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(archive_id)),
        }
    }

    async fn initiate_job(&self, request: JobRequest) -> Result<JobId> {
        self.enter("initiate_job")?;

        let mut state = self.state.write().await;
        let kind = match &request {
            JobRequest::Inventory => JobKind::InventoryRetrieval,
            JobRequest::Retrieval { archive_id } => {
                if !state.archives.contains_key(archive_id) {
                    return Err(Error::not_found(archive_id.as_str()));
                }
                JobKind::ArchiveRetrieval
            }
        };

        let id = JobId(uuid::Uuid::new_v4().to_string());
        let job = Job {
            id: id.clone(),
            kind,
            status: JobStatus::InProgress,
            created_at: Some(Utc::now()),
            completed_at: None,
            status_message: None,
        };
        state.jobs.insert(
            id.clone(),
            JobState {
                job,
                request,
                polls_left: self.job_delay,
            },
        );
        Ok(id)
    }

    async fn describe_job(&self, job_id: &JobId) -> Result<Job> {
        self.enter("describe_job")?;

        let mut state = self.state.write().await;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::not_found(job_id.as_str()))?;

        if !entry.job.status.is_terminal() {
            if entry.polls_left > 0 {
                entry.polls_left -= 1;
            } else if self.fail_jobs.load(Ordering::SeqCst) {
                entry.job.status = JobStatus::Failed;
                entry.job.status_message = Some("Job failed".to_string());
                entry.job.completed_at = Some(Utc::now());
            } else {
                entry.job.status = JobStatus::Succeeded;
                entry.job.status_message = Some("Succeeded".to_string());
                entry.job.completed_at = Some(Utc::now());
            }
        }
        Ok(entry.job.clone())
    }

    async fn job_output(&self, job_id: &JobId) -> Result<Bytes> {
        self.enter("job_output")?;

        let state = self.state.read().await;
        let entry = state
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::not_found(job_id.as_str()))?;

        if entry.job.status != JobStatus::Succeeded {
            return Err(Error::RemoteFailure {
                operation: "job_output".to_string(),
                message: format!("job {} is not ready", job_id),
            });
        }

        match &entry.request {
            JobRequest::Inventory => self.inventory_json(&state),
            JobRequest::Retrieval { archive_id } => state
                .archives
                .get(archive_id)
                .map(|archive| archive.data.clone())
                .ok_or_else(|| Error::not_found(archive_id.as_str())),
        }
    }
}
