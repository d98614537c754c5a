mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            service_url,
            proxy_store,
            allow_local_datasources,
        } => {
            commands::run(
                cli.root,
                cli.gadget,
                cli.classic,
                service_url,
                proxy_store,
                allow_local_datasources,
            )
            .await
        }
        Command::Status { json } => commands::status(cli.root, json),
        Command::Unregister {
            no_register_until_reboot,
        } => commands::unregister(cli.root, cli.gadget, cli.classic, no_register_until_reboot).await,
        Command::MarkSeeded => commands::mark_seeded(cli.root, cli.gadget, cli.classic).await,
        Command::AckModel { assertion } => {
            commands::ack_model(cli.root, cli.gadget, cli.classic, assertion).await
        }
    }
}
