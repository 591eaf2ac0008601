// SPDX-License-Identifier: MIT

//! Implementations of the `manage` subcommands.

use anyhow::Context;
use chrono::Utc;
use sesame::server::db::{
    Invite, InviteSelector, InviteStatus, Service, User, UserSelector,
};
use sqlx::SqliteConnection;

use crate::cli::{InviteCommands, ServiceCommands, UserCommands};

pub async fn users(conn: &mut SqliteConnection, command: UserCommands) -> anyhow::Result<()> {
    match command {
        UserCommands::Add { name } => {
            let user = User::create(conn, &name, Utc::now())
                .await
                .context("failed creating user")?;
            println!("Created user '{}' (ID {})", user.name, user.id);
        }
        UserCommands::Remove { name } => {
            User::delete(conn, &UserSelector::Name(name.clone())).await?;
            println!("Deleted user '{name}'");
        }
        UserCommands::List {} => {
            let users = User::list(conn).await?;
            if users.is_empty() {
                println!("No users found");
                return Ok(());
            }
            println!("{:<6} {:<24} {}", "ID", "NAME", "CREATED");
            for user in users {
                println!(
                    "{:<6} {:<24} {}",
                    user.id,
                    user.name,
                    user.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }

    Ok(())
}

pub async fn services(
    conn: &mut SqliteConnection,
    command: ServiceCommands,
) -> anyhow::Result<()> {
    match command {
        ServiceCommands::Add {
            name,
            port,
            max_access_duration,
        } => {
            let service = Service::create(conn, &name, port, max_access_duration, Utc::now())
                .await
                .context("failed creating service")?;
            println!(
                "Created service '{}' on port {} (max access {})",
                service.name,
                service.port,
                humantime::format_duration(service.max_access_duration)
            );
        }
        ServiceCommands::Remove { name } => {
            Service::delete(conn, &name).await?;
            println!("Deleted service '{name}'");
        }
        ServiceCommands::List {} => {
            let services = Service::list(conn).await?;
            if services.is_empty() {
                println!("No services found");
                return Ok(());
            }
            println!("{:<24} {:<8} {}", "NAME", "PORT", "MAX ACCESS");
            for service in services {
                println!(
                    "{:<24} {:<8} {}",
                    service.name,
                    service.port,
                    humantime::format_duration(service.max_access_duration)
                );
            }
        }
    }

    Ok(())
}

pub async fn invites(
    conn: &mut SqliteConnection,
    command: InviteCommands,
) -> anyhow::Result<()> {
    let now = Utc::now();
    match command {
        InviteCommands::Create {
            user,
            expires_in,
            site_id,
        } => {
            let user = User::load(conn, &UserSelector::Name(user)).await?;
            let expires_at = now
                + chrono::Duration::from_std(expires_in)
                    .context("the expiration is out of range")?;
            let mut invite = Invite::new(user, expires_at, site_id, now)?;
            invite.insert(conn, now).await?;

            println!("Created invite {} for '{}'", invite.uuid, invite.user.name);
            println!("  site id:    {}", invite.site_id);
            println!("  expires at: {}", invite.expires_at.format("%Y-%m-%d %H:%M:%S"));
            println!();
            println!("Invite token (shown once, hand it over a trusted channel):");
            println!();
            println!("  {}", invite.token());
        }
        InviteCommands::List { status } => {
            let invites = Invite::list(conn, status.map(Into::into), now).await?;
            if invites.is_empty() {
                println!("No invites found");
                return Ok(());
            }
            println!(
                "{:<14} {:<16} {:<16} {:<10} {}",
                "UUID", "USER", "SITE", "STATUS", "EXPIRES"
            );
            for invite in invites {
                let expires = match invite.status(now) {
                    InviteStatus::Redeemed => "-".to_string(),
                    _ => invite.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                };
                println!(
                    "{:<14} {:<16} {:<16} {:<10} {}",
                    invite.uuid,
                    invite.user.name,
                    invite.site_id,
                    invite.status(now).to_string(),
                    expires
                );
            }
        }
        InviteCommands::Delete { uuid } => {
            Invite::delete(conn, &InviteSelector::Uuid(uuid.clone()), now).await?;
            println!("Deleted invite {uuid}");
        }
    }

    Ok(())
}
