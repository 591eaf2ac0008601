// SPDX-License-Identifier: MIT

//! Define the command-line interface.
//!
//! This is where subcommands, the arguments, and their types are defined.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

/// The sesame server.
///
/// This includes a command to run the service, along with a set of
/// management commands: initializing the state directory, applying database
/// migrations, and managing users, services, and invites.
///
/// To begin, provide a configuration file (the `config` subcommand prints
/// the current one), then run `init` to create the database and the server's
/// TLS identity, create a user with `manage users add`, and mint an invite
/// for it with `manage invites create`.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the server's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service
    /// configuration, run the `config` subcommand.
    #[arg(long, short, env = "SESAME_SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "SESAME_SERVER_LOG", default_value = "WARN,sesame=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Initialize the server state.
    ///
    /// Creates the state directory and database, applies migrations, and
    /// generates the server's TLS identity. Running it again is a no-op.
    Init {},

    /// Run the service.
    Serve {},

    /// See the current server configuration.
    Config {},

    /// Perform management tasks on the server.
    #[command(subcommand)]
    Manage(ManagementCommands),
}

#[derive(clap::Subcommand, Debug)]
pub enum ManagementCommands {
    /// Manage remote users.
    ///
    /// Users authenticate via client TLS certificates whose CommonName field
    /// carries the user name. Certificates are issued when the user's remote
    /// node redeems an invite.
    #[command(subcommand)]
    Users(UserCommands),

    /// Manage the services whose access the firewall controls.
    #[command(subcommand)]
    Services(ServiceCommands),

    /// Manage invites for remote nodes.
    #[command(subcommand)]
    Invites(InviteCommands),

    /// Apply any database migrations.
    ///
    /// This should be run after upgrading to a new version; it is a no-op if
    /// no new migrations are available.
    Migrate {},
}

#[derive(clap::Subcommand, Debug)]
pub enum UserCommands {
    /// Add a new user to the database.
    Add {
        /// The username of the new user. The name must be unique.
        name: String,
    },
    /// Remove a user from the database.
    ///
    /// The user's invites and issued certificate records are removed along
    /// with it, which locks the remote out of privileged operations.
    Remove {
        /// The username of the user to delete.
        name: String,
    },
    /// List all users in the database.
    List {},
}

#[derive(clap::Subcommand, Debug)]
pub enum ServiceCommands {
    /// Add a service.
    Add {
        /// A unique name for the service, used in /open and /close requests.
        name: String,
        /// The TCP port the service listens on.
        port: u16,
        /// The longest access duration clients may be granted, e.g. "1h" or
        /// "30m". Longer requests are clamped to this value.
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        max_access_duration: Duration,
    },
    /// Remove a service.
    Remove {
        /// The name of the service to delete.
        name: String,
    },
    /// List all services.
    List {},
}

#[derive(clap::Subcommand, Debug)]
pub enum InviteCommands {
    /// Create a new invite for a user.
    ///
    /// The invite token is printed exactly once; hand it to the operator of
    /// the remote node over a trusted channel.
    Create {
        /// The name of the user the invite is for.
        user: String,
        /// How long the invite remains redeemable, e.g. "1h" or "2d".
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        expires_in: Duration,
        /// An identifier for the remote site this invite will be used in.
        /// A random identifier is generated if not provided.
        #[arg(long)]
        site_id: Option<String>,
    },
    /// List invites.
    List {
        /// Only show invites with this status.
        #[arg(long, value_enum)]
        status: Option<InviteStatusArg>,
    },
    /// Delete an invite.
    ///
    /// Certificates already issued from the invite are not revoked.
    Delete {
        /// The invite UUID, or an unambiguous prefix of it.
        uuid: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, clap::ValueEnum)]
pub enum InviteStatusArg {
    Active,
    Redeemed,
    Expired,
}

impl From<InviteStatusArg> for sesame::server::db::InviteStatus {
    fn from(value: InviteStatusArg) -> Self {
        match value {
            InviteStatusArg::Active => Self::Active,
            InviteStatusArg::Redeemed => Self::Redeemed,
            InviteStatusArg::Expired => Self::Expired,
        }
    }
}
