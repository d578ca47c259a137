//! dbwarden CLI entry point.

use anyhow::Context;
use dbwarden_lib::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await.context("dbwarden failed")
}
