use super::Context;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct GetCommand {
    #[arg(help = "Archive ID of the backup to retrieve")]
    pub id: String,

    #[arg(long, help = "Leave files whose content did not change untouched")]
    pub skip_unmodified: bool,

    #[arg(long, help = "Restore under this directory instead of in place")]
    pub restore_root: Option<PathBuf>,
}

impl GetCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let key = ctx.key()?;

        let pb = ctx.spinner("Waiting for the archive retrieval job...");
        let result = ctx
            .orchestrator
            .retrieve_backup(&self.id, &key, self.skip_unmodified)
            .await;
        pb.finish_and_clear();
        ctx.print_reports();

        let report = result?;
        println!(
            "Restored {} files ({} bytes), skipped {} unmodified",
            report.restored.len(),
            report.bytes,
            report.skipped.len()
        );
        Ok(())
    }
}
