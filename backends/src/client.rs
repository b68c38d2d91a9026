use crate::retry::{RetryConfig, retry_remote};
use crate::vault::{ArchiveReceipt, JobRequest, VaultApi};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use coldstash_core::treehash::{self, CHUNK_SIZE, Hash};
use coldstash_core::{ArchiveDescriptor, Error, Job, JobId, JobStatus, Result};
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Archives larger than this go up in parts.
    pub multipart_threshold: u64,
    /// Power of two between 1 MiB and 4 GiB.
    pub part_size: u64,
    pub max_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 100 * MIB,
            part_size: 4 * MIB,
            max_concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.part_size.is_power_of_two() || self.part_size < MIB || self.part_size > 4096 * MIB {
            return Err(Error::Config(format!(
                "Part size must be a power of two between 1 MiB and 4 GiB, got {}",
                self.part_size
            )));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("Upload concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub archive_id: String,
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inventory {
    #[serde(rename = "VaultARN", default)]
    vault_arn: String,
    #[serde(default)]
    archive_list: Vec<InventoryArchive>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InventoryArchive {
    archive_id: String,
    #[serde(default)]
    archive_description: String,
    creation_date: DateTime<Utc>,
    size: u64,
    #[serde(rename = "SHA256TreeHash")]
    sha256_tree_hash: String,
}

/// Parses a JSON vault inventory, oldest archive first.
pub fn parse_inventory(data: &[u8]) -> Result<Vec<ArchiveDescriptor>> {
    let inventory: Inventory = serde_json::from_slice(data).map_err(|e| Error::RemoteFailure {
        operation: "fetch_inventory".to_string(),
        message: format!("malformed inventory: {}", e),
    })?;
    debug!(vault = %inventory.vault_arn, archives = inventory.archive_list.len(), "Parsed inventory");

    let mut archives: Vec<ArchiveDescriptor> = inventory
        .archive_list
        .into_iter()
        .map(|a| ArchiveDescriptor {
            archive_id: a.archive_id,
            description: a.archive_description,
            created_at: a.creation_date,
            size: a.size,
            checksum: a.sha256_tree_hash,
        })
        .collect();
    archives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.archive_id.cmp(&b.archive_id)));
    Ok(archives)
}

struct Part {
    start: u64,
    end: u64,
    checksum: String,
}

/// Protocol layer over a vault: checksummed uploads, idempotent deletes and
/// the submit/poll/fetch job cycle.
pub struct ArchivalClient<V: VaultApi> {
    vault: Arc<V>,
    config: ClientConfig,
}

impl<V: VaultApi> ArchivalClient<V> {
    pub fn new(vault: Arc<V>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { vault, config })
    }

    pub fn vault_name(&self) -> &str {
        self.vault.vault_name()
    }

    pub async fn upload(&self, path: &Path) -> Result<UploadReceipt> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::path(path, e))?
            .len();

        let leaves_path = path.to_path_buf();
        let leaves = tokio::task::spawn_blocking(move || treehash::file_leaves(&leaves_path))
            .await
            .map_err(|e| Error::Other(format!("Tree hash task failed: {}", e)))??;
        let checksum = hex::encode(treehash::combine(&leaves));

        let created_at = Utc::now();
        let description = format!("coldstash backup {}", created_at.to_rfc3339());

        info!(
            path = %path.display(),
            size,
            checksum = %checksum,
            multipart = size > self.config.multipart_threshold,
            "Uploading archive"
        );

        let receipt = if size > self.config.multipart_threshold {
            self.upload_multipart(path, size, &description, &checksum, &leaves)
                .await?
        } else {
            self.upload_single(path, &description, &checksum).await?
        };

        if receipt.checksum != checksum {
            warn!(
                archive_id = %receipt.archive_id,
                local = %checksum,
                remote = %receipt.checksum,
                "Checksum mismatch, removing uploaded archive"
            );
            if let Err(e) = self.delete(&receipt.archive_id).await {
                warn!(archive_id = %receipt.archive_id, error = %e, "Failed to remove mismatched archive");
            }
            return Err(Error::ChecksumMismatch {
                local: checksum,
                remote: receipt.checksum,
            });
        }

        info!(archive_id = %receipt.archive_id, "Archive uploaded");
        Ok(UploadReceipt {
            archive_id: receipt.archive_id,
            checksum,
            size,
            created_at,
        })
    }

    async fn upload_single(&self, path: &Path, description: &str, checksum: &str) -> Result<ArchiveReceipt> {
        let body = Bytes::from(tokio::fs::read(path).await.map_err(|e| Error::path(path, e))?);

        retry_remote(&self.config.retry, "upload_archive", || {
            self.vault.upload_archive(description, checksum, body.clone())
        })
        .await
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        size: u64,
        description: &str,
        checksum: &str,
        leaves: &[Hash],
    ) -> Result<ArchiveReceipt> {
        let part_size = self.config.part_size;
        let upload_id = retry_remote(&self.config.retry, "initiate_multipart", || {
            self.vault.initiate_multipart(description, part_size)
        })
        .await?;

        let leaves_per_part = (part_size / CHUNK_SIZE as u64) as usize;
        let parts: Vec<Part> = (0..size.div_ceil(part_size))
            .map(|index| {
                let start = index * part_size;
                let end = (start + part_size).min(size) - 1;
                let first = index as usize * leaves_per_part;
                let last = (first + leaves_per_part).min(leaves.len());
                Part {
                    start,
                    end,
                    checksum: hex::encode(treehash::combine(&leaves[first..last])),
                }
            })
            .collect();

        debug!(upload_id = %upload_id, parts = parts.len(), "Multipart upload started");

        let uploaded = stream::iter(parts)
            .map(|part| self.upload_part(path, &upload_id, part))
            .buffer_unordered(self.config.max_concurrency)
            .try_collect::<Vec<()>>()
            .await;

        if let Err(e) = uploaded {
            self.abort(&upload_id).await;
            return Err(e);
        }

        retry_remote(&self.config.retry, "complete_multipart", || {
            self.vault.complete_multipart(&upload_id, size, checksum)
        })
        .await
    }

    async fn upload_part(&self, path: &Path, upload_id: &str, part: Part) -> Result<()> {
        let length = part.end - part.start + 1;
        let mut file = tokio::fs::File::open(path).await.map_err(|e| Error::path(path, e))?;
        file.seek(std::io::SeekFrom::Start(part.start))
            .await
            .map_err(|e| Error::path(path, e))?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await.map_err(|e| Error::path(path, e))?;
        let body = Bytes::from(buffer);

        let remote = retry_remote(&self.config.retry, "upload_part", || {
            self.vault
                .upload_part(upload_id, part.start, part.end, &part.checksum, body.clone())
        })
        .await?;

        if remote != part.checksum {
            return Err(Error::ChecksumMismatch {
                local: part.checksum,
                remote,
            });
        }

        debug!(upload_id, start = part.start, end = part.end, "Part uploaded");
        Ok(())
    }

    async fn abort(&self, upload_id: &str) {
        let result = retry_remote(&self.config.retry, "abort_multipart", || {
            self.vault.abort_multipart(upload_id)
        })
        .await;

        if let Err(e) = result {
            warn!(upload_id, error = %e, "Failed to abort multipart upload");
        }
    }

    /// Removes an archive. An archive that is already gone counts as removed.
    pub async fn delete(&self, archive_id: &str) -> Result<()> {
        let result = retry_remote(&self.config.retry, "delete_archive", || {
            self.vault.delete_archive(archive_id)
        })
        .await;

        match result {
            Ok(()) => {
                info!(archive_id, "Archive deleted");
                Ok(())
            }
            Err(Error::NotFound { .. }) => {
                debug!(archive_id, "Archive already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn request_inventory(&self) -> Result<JobId> {
        let job_id = retry_remote(&self.config.retry, "initiate_job", || {
            self.vault.initiate_job(JobRequest::Inventory)
        })
        .await?;
        info!(job_id = %job_id, "Inventory requested");
        Ok(job_id)
    }

    pub async fn request_retrieval(&self, archive_id: &str) -> Result<JobId> {
        let job_id = retry_remote(&self.config.retry, "initiate_job", || {
            self.vault.initiate_job(JobRequest::Retrieval {
                archive_id: archive_id.to_string(),
            })
        })
        .await?;
        info!(job_id = %job_id, archive_id, "Archive retrieval requested");
        Ok(job_id)
    }

    /// One status check, no waiting.
    pub async fn poll_job(&self, job_id: &JobId) -> Result<Job> {
        retry_remote(&self.config.retry, "describe_job", || self.vault.describe_job(job_id)).await
    }

    async fn ensure_succeeded(&self, job_id: &JobId) -> Result<()> {
        let job = self.poll_job(job_id).await?;
        match job.status {
            JobStatus::Succeeded => Ok(()),
            JobStatus::Failed => Err(Error::RemoteJobFailed {
                job_id: job_id.to_string(),
                message: job.status_message.unwrap_or_default(),
            }),
            JobStatus::Submitted | JobStatus::InProgress => Err(Error::JobNotComplete {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn job_output(&self, job_id: &JobId) -> Result<Bytes> {
        self.ensure_succeeded(job_id).await?;
        retry_remote(&self.config.retry, "job_output", || self.vault.job_output(job_id)).await
    }

    pub async fn fetch_inventory(&self, job_id: &JobId) -> Result<Vec<ArchiveDescriptor>> {
        let data = self.job_output(job_id).await?;
        parse_inventory(&data)
    }

    /// Downloads a retrieved archive into a temporary file.
    pub async fn fetch_archive(&self, job_id: &JobId) -> Result<NamedTempFile> {
        let data = self.job_output(job_id).await?;

        let file = NamedTempFile::new()?;
        let target: PathBuf = file.path().to_path_buf();
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| Error::path(&target, e))?;

        info!(job_id = %job_id, size = data.len(), "Archive downloaded");
        Ok(file)
    }
}
