use super::Context;
use anyhow::{Context as _, Result};
use clap::Args;
use coldstash_core::Backup;
use regex::Regex;

#[derive(Args)]
pub struct ListCommand {
    #[arg(long, help = "Reconcile with the remote inventory (slow)")]
    remote: bool,

    #[arg(help = "Only show backups holding a path that matches this regex")]
    pattern: Option<String>,
}

/// Keeps the backups with at least one useful path matching `pattern`.
fn filter_backups(backups: Vec<Backup>, pattern: Option<&Regex>) -> Vec<Backup> {
    match pattern {
        Some(re) => backups
            .into_iter()
            .filter(|backup| backup.useful_paths().any(|path| re.is_match(path)))
            .collect(),
        None => backups,
    }
}

impl ListCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let pattern = self
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid path pattern")?;

        let pb = if self.remote {
            ctx.spinner("Waiting for the inventory job...")
        } else {
            indicatif::ProgressBar::hidden()
        };
        let result = ctx.orchestrator.list_backups(self.remote).await;
        pb.finish_and_clear();

        if self.remote {
            ctx.print_reports();
        } else {
            ctx.reports.take();
        }

        let backups = filter_backups(result?, pattern.as_ref());
        if backups.is_empty() {
            println!("No backups found");
            return Ok(());
        }

        println!("{:<14} {:<20} {:>12} {:>7}  {}", "ID", "Created", "Size", "Files", "Vault");
        println!("{}", "-".repeat(72));
        for backup in &backups {
            println!(
                "{:<14} {:<20} {:>12} {:>7}  {}",
                backup.short_id(),
                backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                backup.size,
                backup.useful_paths().count(),
                backup.vault_name
            );
            if let Some(re) = &pattern {
                for path in backup.useful_paths().filter(|path| re.is_match(path)) {
                    println!("    {}", path);
                }
            }
        }
        println!("\n{} backups", backups.len());
        Ok(())
    }
}
