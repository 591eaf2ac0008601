// SPDX-License-Identifier: MIT

//! Define the command-line interface.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

/// The sesame client.
///
/// Redeems invite tokens against remote sesame nodes and, once joined,
/// requests temporary firewall openings from them.
///
/// The remote's address is read from the configuration file; credentials
/// received from a join are stored in the state directory under the name
/// given with --remote, so a single client can talk to several nodes.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the client's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the
    /// configuration, run the `config` subcommand.
    #[arg(long, short, env = "SESAME_CLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    #[arg(long, env = "SESAME_CLIENT_LOG", default_value = "WARN,sesame=INFO")]
    pub log_filter: String,

    /// The name this client uses for the remote node; selects which stored
    /// credentials are used.
    #[arg(long, default_value = "default")]
    pub remote: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Redeem an invite token and store the credentials it yields.
    Join {
        /// The invite token, as printed by the issuing server.
        token: String,
    },

    /// Ask the remote node to open a service for one or more clients.
    Open {
        /// The name of the service on the remote node.
        service: String,
        /// Client addresses to grant access to: single IPs, CIDR blocks, or
        /// start-end ranges.
        #[arg(required = true)]
        clients: Vec<String>,
        /// How long access should last, e.g. "30m". The remote clamps this
        /// to the service's maximum and applies its default when omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Ask the remote node to close a service for one or more clients.
    Close {
        /// The name of the service on the remote node.
        service: String,
        /// Client addresses to deny. With none given, the service is closed
        /// for everyone.
        clients: Vec<String>,
    },

    /// See the current client configuration.
    Config {},
}
