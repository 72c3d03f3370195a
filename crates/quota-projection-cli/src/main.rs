use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = quota_projection_cli::Cli::parse();
    quota_projection_cli::run_cli(cli)
}
