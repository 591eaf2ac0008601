// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sesame::{
    client::{Client, JoinedCredentials},
    config::{load_config, Config},
    server::handlers::{CloseParams, OpenParams},
};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod cli;

use cli::{Cli, Command};

// The path, relative to CONFIGURATION_DIRECTORY, of the default config file
// location.
const DEFAULT_CONFIG: &str = "sesame/client.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SESAME_CLIENT_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;
    let client = Client::new(config.server_address.clone())
        .with_timeouts(config.join_timeout, config.request_timeout);
    let credential_paths = config.credentials(&opts.remote);

    match opts.command {
        Command::Join { token } => {
            let credentials = client
                .join(&token)
                .await
                .context("failed joining the remote node")?;
            credentials
                .save(&credential_paths)
                .await
                .context("failed storing the received credentials")?;
            println!(
                "Joined {}; credentials stored as remote '{}'",
                config.server_address, opts.remote
            );
        }
        Command::Open {
            service,
            clients,
            duration,
        } => {
            let credentials = JoinedCredentials::load(&credential_paths)
                .await
                .context("no stored credentials for this remote; join it first")?;
            client
                .open(
                    &credentials,
                    &OpenParams {
                        clients: clients.clone(),
                        service_name: service.clone(),
                        duration,
                    },
                )
                .await
                .context("the open request failed")?;
            println!(
                "Opened service '{service}' on {} for {}",
                config.server_address,
                clients.join(", ")
            );
        }
        Command::Close { service, clients } => {
            let credentials = JoinedCredentials::load(&credential_paths)
                .await
                .context("no stored credentials for this remote; join it first")?;
            client
                .close(
                    &credentials,
                    &CloseParams {
                        clients: clients.clone(),
                        service_name: service.clone(),
                    },
                )
                .await
                .context("the close request failed")?;
            if clients.is_empty() {
                println!(
                    "Closed service '{service}' on {} for all clients",
                    config.server_address
                );
            } else {
                println!(
                    "Closed service '{service}' on {} for {}",
                    config.server_address,
                    clients.join(", ")
                );
            }
        }
        Command::Config {} => {
            println!("# This is the current configuration\n\n{config}");
        }
    };

    Ok(())
}
