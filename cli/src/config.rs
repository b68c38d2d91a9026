use anyhow::{Context, Result, anyhow, bail};
use coldstash_backends::{ClientConfig, GlacierConfig, RetryConfig};
use coldstash_core::StoreKind;
use coldstash_core::envelope::KEY_SIZE;
use coldstash_engine::OrchestratorSettings;
use directories::ProjectDirs;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const HOUR: u64 = 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directories and files packaged on every backup run.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Percentage of changed files tolerated before a run is aborted.
    #[serde(default = "default_tolerance")]
    pub modify_tolerance: f64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
    /// Passphrase for the archive envelope. Prompted for when absent.
    #[serde(default)]
    pub backup_secret: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub glacier: GlacierConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub multipart_threshold_mib: u64,
    pub part_size_mib: u64,
    pub max_concurrency: usize,
    pub max_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_mib: 100,
            part_size_mib: 4,
            max_concurrency: 4,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub poll_interval_secs: u64,
    pub restore_root: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            restore_root: None,
        }
    }
}

/// Fixed intervals for the `start` loop, in hours.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub backup_hours: u64,
    pub remove_old_hours: u64,
    pub list_remote_hours: u64,
    pub report_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backup_hours: 24,
            remove_old_hours: 7 * 24,
            list_remote_hours: 7 * 24,
            report_hours: 7 * 24,
        }
    }
}

impl SchedulerConfig {
    pub fn backup(&self) -> Duration {
        hours(self.backup_hours)
    }

    pub fn remove_old(&self) -> Duration {
        hours(self.remove_old_hours)
    }

    pub fn list_remote(&self) -> Duration {
        hours(self.list_remote_hours)
    }

    pub fn report(&self) -> Duration {
        hours(self.report_hours)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Level used when neither --verbose nor --quiet is given.
    pub level: Option<String>,
}

fn default_tolerance() -> f64 {
    100.0
}

fn default_keep_backups() -> usize {
    10
}

fn default_store_kind() -> StoreKind {
    StoreKind::Audit
}

fn default_store_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("audit.log"))
        .unwrap_or_else(|| PathBuf::from("coldstash-audit.log"))
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.max(1) * HOUR)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "coldstash")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path().ok_or_else(|| anyhow!("Unable to locate a home directory for the configuration"))?,
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.modify_tolerance) {
            bail!("modify_tolerance must be between 0 and 100, got {}", self.modify_tolerance);
        }
        self.ignore_regexes()?;
        Ok(())
    }

    pub fn ignore_regexes(&self) -> Result<Vec<Regex>> {
        self.ignore_patterns
            .iter()
            .map(|pattern| Regex::new(pattern).with_context(|| format!("Invalid ignore pattern {}", pattern)))
            .collect()
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            multipart_threshold: self.upload.multipart_threshold_mib * MIB,
            part_size: self.upload.part_size_mib * MIB,
            max_concurrency: self.upload.max_concurrency,
            retry: RetryConfig {
                max_attempts: self.upload.max_attempts.max(1),
                ..RetryConfig::default()
            },
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(self.jobs.poll_interval_secs.max(1)),
            restore_root: self.jobs.restore_root.clone(),
        }
    }

    /// Resolves the envelope key: the explicit secret first, then the
    /// configured one, then an interactive prompt.
    pub fn backup_key(&self, secret: Option<&str>) -> Result<Vec<u8>> {
        let secret = match secret.or(self.backup_secret.as_deref()) {
            Some(secret) => secret.to_string(),
            None => rpassword::prompt_password("Backup secret: ").context("Failed to read backup secret")?,
        };
        aes_key(&secret)
    }
}

/// Pads the passphrase with `0` or truncates it to an AES-256 key.
pub fn aes_key(secret: &str) -> Result<Vec<u8>> {
    if secret.is_empty() {
        bail!("Backup secret must not be empty");
    }
    let mut key = secret.as_bytes().to_vec();
    key.resize(KEY_SIZE, b'0');
    Ok(key)
}
