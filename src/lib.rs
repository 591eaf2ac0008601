// SPDX-License-Identifier: MIT

/*!
# Sesame

Sesame is a distributed access control plane: it lets an operator
temporarily open host firewall ports to specific remote client IP ranges.

A Sesame node issues cryptographically-bound invitations to other nodes.
Redeeming an invitation over the `/join` handshake yields a mutually
authenticated TLS identity, which is used from then on to request
time-bounded firewall openings for named services via `/open` and `/close`.

## Components

The [`server`] module contains the service itself: the SQLite-backed stores
for users, invites, and issued client certificates, the composable request
pipeline that enforces authentication, serialization, response encryption,
and error sanitization across endpoints, and the hybrid listener that serves
the plain-HTTP join handshake and the mTLS-only privileged endpoints on a
single port.

The [`client`] module is a friendly interface over the HTTP API, used by the
`sesame-client` CLI and by other applications embedding a Sesame client.

The [`firewall`] module abstracts over the concrete firewall backend; an
nftables implementation and an in-memory mock are provided.

## Crate features

* **cli** -
  Build the `sesame-server` and `sesame-client` binaries. This is a default
  feature.
*/

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod firewall;
pub mod server;
pub mod token;

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting
/// new connections. Existing requests will be allowed to complete before the
/// process shuts down.
#[doc(hidden)]
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
