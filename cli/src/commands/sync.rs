use super::Context;
use anyhow::{Result, bail};
use clap::Args;

#[derive(Args)]
pub struct SyncCommand {
    #[arg(long, help = "Override the configured modify tolerance (percent)")]
    tolerance: Option<f64>,
}

impl SyncCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut request = ctx.backup_request()?;
        if request.paths.is_empty() {
            bail!("No paths configured for backup");
        }
        if let Some(tolerance) = self.tolerance {
            if !(0.0..=100.0).contains(&tolerance) {
                bail!("Tolerance must be between 0 and 100, got {}", tolerance);
            }
            request.tolerance = tolerance;
        }

        let pb = ctx.spinner("Archiving and uploading...");
        let result = ctx.orchestrator.backup(&request).await;
        pb.finish_and_clear();
        ctx.print_reports();

        let backup = result?;
        println!("Backup {} stored", backup.summary());
        Ok(())
    }
}
