pub mod convert;
pub mod get;
pub mod list;
pub mod prune;
pub mod remove;
pub mod start;
pub mod sync;

use crate::config::Config;
use crate::shutdown;
use anyhow::{Context as _, Result};
use coldstash_backends::{ArchivalClient, GlacierVault};
use coldstash_core::open_store;
use coldstash_engine::{BackupRequest, Orchestrator, ReportLog};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a command needs once the configuration is loaded.
pub struct Context {
    pub config: Config,
    pub orchestrator: Orchestrator<GlacierVault>,
    pub reports: Arc<ReportLog>,
    pub cancel: CancellationToken,
    secret: Option<String>,
    quiet: bool,
}

impl Context {
    pub async fn open(cli: &crate::Cli, config: Config) -> Result<Self> {
        let vault = GlacierVault::new(config.glacier.clone())
            .await
            .context("Failed to configure the Glacier vault")?;
        let client = ArchivalClient::new(Arc::new(vault), config.client_config())?;

        info!(
            store = %config.store.path.display(),
            kind = %config.store.kind,
            vault = %config.glacier.vault_name,
            "Opening coldstash"
        );
        let store = open_store(config.store.kind, &config.store.path);

        let reports = Arc::new(ReportLog::new());
        let cancel = CancellationToken::new();
        shutdown::cancel_on_signal(cancel.clone());

        let orchestrator = Orchestrator::new(
            client,
            store,
            reports.clone(),
            config.orchestrator_settings(),
            cancel.clone(),
        );

        Ok(Self {
            config,
            orchestrator,
            reports,
            cancel,
            secret: cli.secret.clone(),
            quiet: cli.quiet,
        })
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        self.config.backup_key(self.secret.as_deref())
    }

    pub fn backup_request(&self) -> Result<BackupRequest> {
        Ok(BackupRequest {
            paths: self.config.paths.clone(),
            key: self.key()?,
            tolerance: self.config.modify_tolerance,
            ignore_patterns: self.config.ignore_regexes()?,
        })
    }

    pub fn spinner(&self, message: &str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }

    /// Prints and drains the collected operation reports.
    pub fn print_reports(&self) {
        if self.quiet {
            self.reports.take();
            return;
        }
        for entry in self.reports.take() {
            print!("{}", entry);
        }
    }
}
