use anyhow::{Result, anyhow, bail};
use clap::Args;
use coldstash_core::store::convert;
use coldstash_core::{StoreKind, open_store};
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct ConvertStoreCommand {
    #[arg(long, help = "Backend of the input store (kv, audit)")]
    from: StoreKind,

    #[arg(long, help = "Backend of the output store (kv, audit)")]
    to: StoreKind,

    #[arg(long, help = "Path of the output store")]
    output: PathBuf,

    #[arg(help = "Path of the input store")]
    input: PathBuf,
}

impl ConvertStoreCommand {
    pub async fn run(&self) -> Result<()> {
        if self.input == self.output {
            bail!("Input and output stores must be different paths");
        }
        if !self.input.exists() {
            bail!("Input store {} does not exist", self.input.display());
        }

        info!(
            from = %self.from,
            to = %self.to,
            input = %self.input.display(),
            output = %self.output.display(),
            "Converting store"
        );

        let source = open_store(self.from, &self.input);
        let target = open_store(self.to, &self.output);
        let copied = tokio::task::spawn_blocking(move || convert(source.as_ref(), target.as_ref()))
            .await
            .map_err(|e| anyhow!("Conversion task failed: {}", e))??;

        println!("Copied {} backups into {}", copied, self.output.display());
        Ok(())
    }
}
