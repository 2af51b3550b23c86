mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Command, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let Args { settings, command } = args;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let settings = &settings;
        match command {
            Command::Download { editions, publication } => {
                crate::commands::run_downloads(settings, editions, publication).await
            }
            Command::Delete { edition, publication } => {
                crate::commands::delete_edition(settings, edition, publication).await
            }
            Command::List => crate::commands::list_downloads(settings).await,
            Command::Bookmarks { edition, add, remove, sync } => {
                crate::commands::bookmarks(settings, edition, add, remove, sync).await
            }
            Command::Read { edition, pages } => crate::commands::read(settings, edition, pages).await,
            Command::LoginName { username } => crate::commands::set_login_name(settings, username).await,
        }
    })
}
