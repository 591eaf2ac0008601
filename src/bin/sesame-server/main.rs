// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sesame::{
    config::load_config,
    server::{db, initialize, Config, Server},
    signal_handler,
};
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod cli;
mod management;

use cli::{Cli, Command, ManagementCommands};

// The path, relative to CONFIGURATION_DIRECTORY, of the default config file
// location.
const DEFAULT_CONFIG: &str = "sesame/server.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does
    // not implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SESAME_SERVER_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        Command::Init {} => {
            initialize(&config).await?;
            println!(
                "Server state initialized in {}",
                config.state_directory.display()
            );
        }
        Command::Serve {} => {
            let root_span = tracing::info_span!("server");
            async move {
                let server = Server::new(config).await?;
                let listener = server.run().await?;
                tokio::spawn(signal_handler(listener.halt_token()));

                listener.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        Command::Config {} => {
            println!("# This is the current configuration\n\n{config}");
        }
        Command::Manage(command) => {
            let db_pool = db::pool(
                config
                    .database()
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))?,
            )
            .await?;

            if let ManagementCommands::Migrate {} = command {
                db::migrate(&db_pool).await?;
                return Ok(());
            }

            let mut conn = db_pool.begin().await?;
            match command {
                ManagementCommands::Users(command) => {
                    management::users(&mut conn, command).await?;
                }
                ManagementCommands::Services(command) => {
                    management::services(&mut conn, command).await?;
                }
                ManagementCommands::Invites(command) => {
                    management::invites(&mut conn, command).await?;
                }
                ManagementCommands::Migrate {} => unreachable!("handled above"),
            }
            conn.commit().await?;
        }
    };

    Ok(())
}
