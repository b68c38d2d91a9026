use super::Context;
use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct PruneCommand {
    #[arg(long, help = "Number of recent backups to keep (defaults to keep_backups)")]
    keep: Option<usize>,
}

impl PruneCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let keep = self.keep.unwrap_or(ctx.config.keep_backups);

        let result = ctx.orchestrator.remove_old_backups(keep).await;
        ctx.print_reports();

        let removed = result?;
        if removed.is_empty() {
            println!("Nothing to remove, {} or fewer backups stored", keep);
        } else {
            for backup in &removed {
                println!("Removed {}", backup.summary());
            }
        }
        Ok(())
    }
}
