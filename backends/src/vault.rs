use async_trait::async_trait;
use bytes::Bytes;
use coldstash_core::{Job, JobId, Result};

/// What the vault reports back once an archive exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub archive_id: String,
    /// Tree hash computed by the vault over what it received.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    Inventory,
    Retrieval { archive_id: String },
}

/// Raw vault and job API. Implementations classify failures as
/// `RemoteTransient` (worth retrying), `NotFound` or `RemoteFailure`; the
/// archival client decides what to retry.
#[async_trait]
pub trait VaultApi: Send + Sync {
    fn vault_name(&self) -> &str;

    async fn upload_archive(&self, description: &str, checksum: &str, body: Bytes) -> Result<ArchiveReceipt>;

    async fn initiate_multipart(&self, description: &str, part_size: u64) -> Result<String>;

    /// Uploads bytes `start..=end` of the archive. Returns the checksum the
    /// vault computed for the part.
    async fn upload_part(
        &self,
        upload_id: &str,
        start: u64,
        end: u64,
        checksum: &str,
        body: Bytes,
    ) -> Result<String>;

    async fn complete_multipart(&self, upload_id: &str, archive_size: u64, checksum: &str) -> Result<ArchiveReceipt>;

    async fn abort_multipart(&self, upload_id: &str) -> Result<()>;

    /// Fails with `NotFound` when the archive does not exist.
    async fn delete_archive(&self, archive_id: &str) -> Result<()>;

    async fn initiate_job(&self, request: JobRequest) -> Result<JobId>;

    async fn describe_job(&self, job_id: &JobId) -> Result<Job>;

    async fn job_output(&self, job_id: &JobId) -> Result<Bytes>;
}
