use clap::Parser;

use dbtap::cmd::{run_job, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_job(&cli).await?;
    Ok(())
}
