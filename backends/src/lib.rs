pub mod client;
pub mod glacier;
pub mod memory;
pub mod retry;
pub mod vault;

pub use client::{ArchivalClient, ClientConfig, UploadReceipt, parse_inventory};
pub use glacier::{GlacierConfig, GlacierVault};
pub use memory::MemoryVault;
pub use retry::{RetryConfig, Retryable, retry_remote, retry_with_backoff};
pub use vault::{ArchiveReceipt, JobRequest, VaultApi};
