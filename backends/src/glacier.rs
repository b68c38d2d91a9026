use crate::vault::{ArchiveReceipt, JobRequest, VaultApi};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_glacier::Client;
use aws_sdk_glacier::config::Credentials;
use aws_sdk_glacier::config::http::HttpResponse;
use aws_sdk_glacier::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_glacier::primitives::ByteStream;
use aws_sdk_glacier::types::{ActionCode, JobParameters, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use coldstash_core::{Error, Job, JobId, JobKind, JobStatus, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Service error codes that go away on their own.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestTimeoutException",
    "ServiceUnavailableException",
    "SlowDown",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlacierConfig {
    /// AWS account owning the vault, `-` for the caller's account.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    pub region: String,
    pub vault_name: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Custom endpoint, mostly for local emulators.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_account_id() -> String {
    "-".to_string()
}

impl Default for GlacierConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            region: "us-east-1".to_string(),
            vault_name: String::new(),
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
        }
    }
}

pub struct GlacierVault {
    client: Client,
    config: GlacierConfig,
}

impl GlacierVault {
    /// Builds a client from the configuration. Without explicit keys the
    /// default AWS credential chain is used.
    pub async fn new(config: GlacierConfig) -> Result<Self> {
        if config.vault_name.is_empty() {
            return Err(Error::Config("Glacier vault name is required".to_string()));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = Credentials::new(access_key, secret_key, None, None, "coldstash");
            loader = loader.credentials_provider(credentials);
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        debug!(vault = %config.vault_name, region = %config.region, "Glacier client configured");

        Ok(Self {
            client: Client::new(&sdk_config),
            config,
        })
    }
}

fn classify<E>(operation: &str, target: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status >= 500 || status == 429 || err.code().is_some_and(|code| TRANSIENT_CODES.contains(&code))
        }
        _ => false,
    };

    if err.code() == Some("ResourceNotFoundException") {
        return Error::not_found(target);
    }

    let message = DisplayErrorContext(&err).to_string();
    if transient {
        Error::RemoteTransient {
            operation: operation.to_string(),
            message,
        }
    } else {
        Error::RemoteFailure {
            operation: operation.to_string(),
            message,
        }
    }
}

fn missing(operation: &str, field: &str) -> Error {
    Error::RemoteFailure {
        operation: operation.to_string(),
        message: format!("response is missing {}", field),
    }
}

fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|at| at.with_timezone(&Utc))
}

#[async_trait]
impl VaultApi for GlacierVault {
    fn vault_name(&self) -> &str {
        &self.config.vault_name
    }

    async fn upload_archive(&self, description: &str, checksum: &str, body: Bytes) -> Result<ArchiveReceipt> {
        let output = self
            .client
            .upload_archive()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .archive_description(description)
            .checksum(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload_archive", description, e))?;

        Ok(ArchiveReceipt {
            archive_id: output
                .archive_id()
                .ok_or_else(|| missing("upload_archive", "archive id"))?
                .to_string(),
            checksum: output.checksum().unwrap_or_default().to_string(),
        })
    }

    async fn initiate_multipart(&self, description: &str, part_size: u64) -> Result<String> {
        let output = self
            .client
            .initiate_multipart_upload()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .archive_description(description)
            .part_size(part_size.to_string())
            .send()
            .await
            .map_err(|e| classify("initiate_multipart", description, e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| missing("initiate_multipart", "upload id"))
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        start: u64,
        end: u64,
        checksum: &str,
        body: Bytes,
    ) -> Result<String> {
        let output = self
            .client
            .upload_multipart_part()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .upload_id(upload_id)
            .range(format!("bytes {}-{}/*", start, end))
            .checksum(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload_part", upload_id, e))?;

        Ok(output.checksum().unwrap_or_default().to_string())
    }

    async fn complete_multipart(&self, upload_id: &str, archive_size: u64, checksum: &str) -> Result<ArchiveReceipt> {
        let output = self
            .client
            .complete_multipart_upload()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .upload_id(upload_id)
            .archive_size(archive_size.to_string())
            .checksum(checksum)
            .send()
            .await
            .map_err(|e| classify("complete_multipart", upload_id, e))?;

        Ok(ArchiveReceipt {
            archive_id: output
                .archive_id()
                .ok_or_else(|| missing("complete_multipart", "archive id"))?
                .to_string(),
            checksum: output.checksum().unwrap_or_default().to_string(),
        })
    }

    async fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart", upload_id, e))?;
        Ok(())
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<()> {
        self.client
            .delete_archive()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .archive_id(archive_id)
            .send()
            .await
            .map_err(|e| classify("delete_archive", archive_id, e))?;
        Ok(())
    }

    async fn initiate_job(&self, request: JobRequest) -> Result<JobId> {
        let parameters = match &request {
            JobRequest::Inventory => JobParameters::builder()
                .r#type("inventory-retrieval")
                .format("JSON")
                .build(),
            JobRequest::Retrieval { archive_id } => JobParameters::builder()
                .r#type("archive-retrieval")
                .archive_id(archive_id)
                .build(),
        };

        let output = self
            .client
            .initiate_job()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .job_parameters(parameters)
            .send()
            .await
            .map_err(|e| classify("initiate_job", &self.config.vault_name, e))?;

        output
            .job_id()
            .map(JobId::from)
            .ok_or_else(|| missing("initiate_job", "job id"))
    }

    async fn describe_job(&self, job_id: &JobId) -> Result<Job> {
        let output = self
            .client
            .describe_job()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .job_id(job_id.as_str())
            .send()
            .await
            .map_err(|e| classify("describe_job", job_id.as_str(), e))?;

        let kind = match output.action() {
            Some(ActionCode::InventoryRetrieval) => JobKind::InventoryRetrieval,
            _ => JobKind::ArchiveRetrieval,
        };
        let status = match output.status_code() {
            Some(StatusCode::Succeeded) => JobStatus::Succeeded,
            Some(StatusCode::Failed) => JobStatus::Failed,
            Some(StatusCode::InProgress) => JobStatus::InProgress,
            _ => JobStatus::Submitted,
        };

        Ok(Job {
            id: job_id.clone(),
            kind,
            status,
            created_at: parse_date(output.creation_date()),
            completed_at: parse_date(output.completion_date()),
            status_message: output.status_message().map(str::to_string),
        })
    }

    async fn job_output(&self, job_id: &JobId) -> Result<Bytes> {
        let output = self
            .client
            .get_job_output()
            .account_id(&self.config.account_id)
            .vault_name(&self.config.vault_name)
            .job_id(job_id.as_str())
            .send()
            .await
            .map_err(|e| classify("job_output", job_id.as_str(), e))?;

        let data = output.body.collect().await.map_err(|e| Error::RemoteTransient {
            operation: "job_output".to_string(),
            message: e.to_string(),
        })?;
        Ok(data.into_bytes())
    }
}
