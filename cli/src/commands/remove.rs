use super::Context;
use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct RemoveCommand {
    #[arg(required = true, help = "Archive IDs to remove")]
    ids: Vec<String>,
}

impl RemoveCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let result = ctx.orchestrator.remove_backups(&self.ids).await;
        ctx.print_reports();
        result?;

        println!("Removed {} backups", self.ids.len());
        Ok(())
    }
}
