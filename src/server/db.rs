// SPDX-License-Identifier: MIT

//! The server's persistent state: users, invites, issued client
//! certificates, services, and the singleton meta row holding the server TLS
//! identity.
//!
//! Record lookups accept selectors (id, name, uuid prefix, nonce, ...) and
//! enforce that a selector matches exactly one row; ambiguous selectors fail
//! rather than acting on an arbitrary record.

use std::{str::FromStr, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::SqliteConnectOptions, FromRow, Pool, QueryBuilder, Sqlite, SqliteConnection,
    SqlitePool,
};
use tracing::instrument;

use crate::crypto::{self, KEY_SIZE};

static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/");

/// The schema version recorded in the meta table.
pub const SCHEMA_VERSION: i64 = 1;

// Selectors shorter than this match UUIDs by prefix; selectors of the full
// generated length match exactly.
const UUID_LEN: usize = 12;

/// Ensure the database is migrated to the latest version.
#[instrument(skip_all)]
pub async fn migrate(pool: &Pool<Sqlite>) -> anyhow::Result<()> {
    MIGRATIONS
        .run(pool)
        .await
        .context("Migrations could not be applied")?;
    Ok(())
}

/// Get a database pool.
///
/// Foreign key enforcement is enabled on every connection. In-memory
/// databases pin an idle connection so the database outlives individual
/// connections.
pub async fn pool(db_uri: &str) -> anyhow::Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::from_str(db_uri)
        .context("The database URL couldn't be parsed.")?
        .create_if_missing(true)
        .foreign_keys(true)
        .optimize_on_close(true, Some(400));
    let pool = if db_uri.contains(":memory:") {
        sqlx::pool::PoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
    } else {
        SqlitePool::connect_with(opts).await
    };

    pool.with_context(|| format!("Failed to connect to the database at {db_uri}"))
}

/// Errors returned by the database layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DbError {
    /// No record matched the selector.
    #[error("{model} with {filter} doesn't exist")]
    NoResult { model: &'static str, filter: String },

    /// The selector matched more than one record.
    #[error("filter with {filter} returns {count} results; make the filter more specific")]
    TooManyResults { filter: String, count: i64 },

    /// A write raced with a concurrent writer and lost; for invite
    /// redemption this means another redemption already succeeded.
    #[error("{0}")]
    Conflict(String),

    /// A uniqueness guarantee the schema is supposed to provide was
    /// violated, or stored data is corrupt.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The caller supplied an unusable selector or field combination.
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Selects a single user by id or unique name.
#[derive(Debug, Clone)]
pub enum UserSelector {
    Id(i64),
    Name(String),
}

impl UserSelector {
    fn describe(&self) -> String {
        match self {
            UserSelector::Id(id) => format!("ID {id}"),
            UserSelector::Name(name) => format!("name '{name}'"),
        }
    }
}

impl User {
    #[instrument(skip(conn))]
    pub async fn create(
        conn: &mut SqliteConnection,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<User, DbError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (name, created_at, updated_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(User {
            id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Load a user. The unique constraints on id and name mean a selector can
    /// match at most one row; more than one match indicates schema corruption
    /// and is surfaced as an error, never a panic.
    #[instrument(skip(conn))]
    pub async fn load(
        conn: &mut SqliteConnection,
        selector: &UserSelector,
    ) -> Result<User, DbError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM users WHERE ");
        match selector {
            UserSelector::Id(id) => query.push("id = ").push_bind(*id),
            UserSelector::Name(name) => query.push("name = ").push_bind(name.clone()),
        };

        let mut users = query.build_query_as::<User>().fetch_all(&mut *conn).await?;
        match users.len() {
            0 => Err(DbError::NoResult {
                model: "user",
                filter: selector.describe(),
            }),
            1 => Ok(users.remove(0)),
            n => Err(DbError::Integrity(format!(
                "user query with {} returned {n} rows",
                selector.describe()
            ))),
        }
    }

    #[instrument(skip(conn))]
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<User>, DbError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY name ASC")
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    /// Delete a user. Invites and client certificates owned by the user are
    /// removed by the schema's cascade rules.
    #[instrument(skip(conn))]
    pub async fn delete(
        conn: &mut SqliteConnection,
        selector: &UserSelector,
    ) -> Result<(), DbError> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM users WHERE ");
        match selector {
            UserSelector::Id(id) => query.push("id = ").push_bind(*id),
            UserSelector::Name(name) => query.push("name = ").push_bind(name.clone()),
        };

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoResult {
                model: "user",
                filter: selector.describe(),
            });
        }
        Ok(())
    }
}

/// A computed status of an invite based on its expiration and redemption
/// times. Transitions are monotonic: an invite leaves `Active` for exactly
/// one of the other states and never returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InviteStatus {
    Active,
    Expired,
    Redeemed,
}

impl std::fmt::Display for InviteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InviteStatus::Active => write!(f, "active"),
            InviteStatus::Expired => write!(f, "expired"),
            InviteStatus::Redeemed => write!(f, "redeemed"),
        }
    }
}

/// A single-use claim created by the server for a specific user, allowing a
/// remote node to obtain a TLS client identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Invite {
    pub id: i64,
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub user: User,
    /// A unique identifier of the remote site this invite will be used in.
    pub site_id: String,
    pub nonce: Vec<u8>,
    priv_key: [u8; KEY_SIZE],
}

/// Selects a single invite.
#[derive(Debug, Clone)]
pub enum InviteSelector {
    Id(i64),
    /// A full UUID, or a prefix that matches exactly one record.
    Uuid(String),
    /// The 32-byte nonce; only unexpired invites match.
    Nonce(Vec<u8>),
}

impl InviteSelector {
    fn describe(&self) -> String {
        match self {
            InviteSelector::Id(id) => format!("ID {id}"),
            InviteSelector::Uuid(uuid) if uuid.len() < UUID_LEN => format!("UUID '{uuid}*'"),
            InviteSelector::Uuid(uuid) => format!("UUID '{uuid}'"),
            InviteSelector::Nonce(_) => "nonce".to_string(),
        }
    }

    fn push_filter(&self, query: &mut QueryBuilder<Sqlite>, now: DateTime<Utc>) {
        match self {
            InviteSelector::Id(id) => {
                query.push("inv.id = ").push_bind(*id);
            }
            InviteSelector::Uuid(uuid) if uuid.len() < UUID_LEN => {
                query.push("inv.uuid LIKE ").push_bind(format!("{uuid}%"));
            }
            InviteSelector::Uuid(uuid) => {
                query.push("inv.uuid = ").push_bind(uuid.clone());
            }
            InviteSelector::Nonce(nonce) => {
                query
                    .push("inv.nonce = ")
                    .push_bind(nonce.clone())
                    .push(" AND inv.expires_at > ")
                    .push_bind(now);
            }
        }
    }

    async fn ensure_unique(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM invites inv WHERE ",
        );
        self.push_filter(&mut query, now);
        let count: i64 = query.build_query_scalar().fetch_one(&mut *conn).await?;
        if count > 1 {
            return Err(DbError::TooManyResults {
                filter: self.describe(),
                count,
            });
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct InviteRow {
    id: i64,
    uuid: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    redeemed_at: Option<DateTime<Utc>>,
    site_id: String,
    private_key: Vec<u8>,
    nonce: Vec<u8>,
    user_id: i64,
    user_name: String,
    user_created_at: DateTime<Utc>,
    user_updated_at: DateTime<Utc>,
}

impl TryFrom<InviteRow> for Invite {
    type Error = DbError;

    fn try_from(row: InviteRow) -> Result<Self, Self::Error> {
        let priv_key: [u8; KEY_SIZE] = row.private_key.as_slice().try_into().map_err(|_| {
            DbError::Integrity(format!("invite {} has a malformed private key", row.uuid))
        })?;
        Ok(Invite {
            id: row.id,
            uuid: row.uuid,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            redeemed_at: row.redeemed_at,
            user: User {
                id: row.user_id,
                name: row.user_name,
                created_at: row.user_created_at,
                updated_at: row.user_updated_at,
            },
            site_id: row.site_id,
            nonce: row.nonce,
            priv_key,
        })
    }
}

const INVITE_SELECT: &str = "SELECT
        inv.id, inv.uuid, inv.created_at, inv.updated_at, inv.expires_at, inv.redeemed_at,
        inv.site_id, inv.private_key, inv.nonce,
        u.id AS user_id, u.name AS user_name,
        u.created_at AS user_created_at, u.updated_at AS user_updated_at
    FROM invites inv JOIN users u ON u.id = inv.user_id";

/// Fields of an invite that may change after creation. `updated_at` is
/// refreshed on every update.
#[derive(Debug, Default, Clone)]
pub struct InviteUpdate {
    pub expires_at: Option<DateTime<Utc>>,
    pub site_id: Option<String>,
}

impl Invite {
    /// Create a new invitation for a remote user. The invite carries a fresh
    /// X25519 key and a random nonce; the token derived from them must be
    /// supplied by the invitee when authenticating.
    pub fn new(
        user: User,
        expires_at: DateTime<Utc>,
        site_id: Option<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Invite> {
        if expires_at <= now {
            return Err(anyhow::anyhow!("the expiration time must be in the future"));
        }

        Ok(Invite {
            id: 0,
            uuid: crypto::random_id(),
            created_at: now,
            updated_at: now,
            expires_at,
            redeemed_at: None,
            user,
            site_id: site_id.unwrap_or_else(crypto::random_id),
            nonce: crypto::random_data(KEY_SIZE)?,
            priv_key: crypto::new_x25519_key(),
        })
    }

    /// The invite token published to the invitee: the base58 encoding of the
    /// nonce concatenated with the invite's X25519 public key.
    pub fn token(&self) -> String {
        let nonce: [u8; KEY_SIZE] = self
            .nonce
            .as_slice()
            .try_into()
            .expect("nonces are always KEY_SIZE bytes");
        crate::token::encode_token(&nonce, &crypto::x25519_public_key(&self.priv_key))
    }

    pub fn private_key(&self) -> &[u8; KEY_SIZE] {
        &self.priv_key
    }

    pub fn is_redeemed(&self) -> bool {
        self.redeemed_at.is_some()
    }

    pub fn status(&self, now: DateTime<Utc>) -> InviteStatus {
        if self.redeemed_at.is_some() {
            InviteStatus::Redeemed
        } else if now > self.expires_at {
            InviteStatus::Expired
        } else {
            InviteStatus::Active
        }
    }

    #[instrument(skip(self, conn), fields(uuid = self.uuid))]
    pub async fn insert(
        &mut self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO invites
                (uuid, created_at, updated_at, expires_at, user_id, site_id, private_key, nonce)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&self.uuid)
        .bind(now)
        .bind(now)
        .bind(self.expires_at)
        .bind(self.user.id)
        .bind(&self.site_id)
        .bind(self.priv_key.as_slice())
        .bind(&self.nonce)
        .fetch_one(&mut *conn)
        .await?;

        self.id = id;
        self.created_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Load an invite. Prefix selectors must match exactly one record.
    #[instrument(skip(conn))]
    pub async fn load(
        conn: &mut SqliteConnection,
        selector: &InviteSelector,
        now: DateTime<Utc>,
    ) -> Result<Invite, DbError> {
        selector.ensure_unique(&mut *conn, now).await?;

        let mut query = QueryBuilder::<Sqlite>::new(INVITE_SELECT);
        query.push(" WHERE ");
        selector.push_filter(&mut query, now);
        let row = query
            .build_query_as::<InviteRow>()
            .fetch_optional(&mut *conn)
            .await?;

        row.ok_or_else(|| DbError::NoResult {
            model: "invite",
            filter: selector.describe(),
        })?
        .try_into()
    }

    /// Update an invite's mutable fields. The selector must match exactly one
    /// record.
    #[instrument(skip(conn, update))]
    pub async fn update(
        conn: &mut SqliteConnection,
        selector: &InviteSelector,
        update: &InviteUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        selector.ensure_unique(&mut *conn, now).await?;

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE invites AS inv SET updated_at = ");
        query.push_bind(now);
        if let Some(expires_at) = update.expires_at {
            query.push(", expires_at = ").push_bind(expires_at);
        }
        if let Some(site_id) = &update.site_id {
            query.push(", site_id = ").push_bind(site_id.clone());
        }
        query.push(" WHERE ");
        selector.push_filter(&mut query, now);

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoResult {
                model: "invite",
                filter: selector.describe(),
            });
        }
        Ok(())
    }

    /// Delete an invite. The selector must match exactly one record.
    #[instrument(skip(conn))]
    pub async fn delete(
        conn: &mut SqliteConnection,
        selector: &InviteSelector,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        selector.ensure_unique(&mut *conn, now).await?;

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM invites AS inv WHERE ");
        selector.push_filter(&mut query, now);

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoResult {
                model: "invite",
                filter: selector.describe(),
            });
        }
        Ok(())
    }

    /// Record the time this invite was redeemed at.
    ///
    /// The update is conditional on `redeemed_at` still being NULL, which the
    /// database serializes: of any number of concurrent redemptions, at most
    /// one sees an affected row. The losers get a [`DbError::Conflict`].
    #[instrument(skip(self, conn), fields(uuid = self.uuid))]
    pub async fn redeem(
        &mut self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        if self.is_redeemed() {
            return Err(DbError::InvalidInput(
                "invite is already redeemed".to_string(),
            ));
        }

        let result = sqlx::query(
            "UPDATE invites SET redeemed_at = ?, updated_at = ?
            WHERE id = ? AND redeemed_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(self.id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Conflict("invite already redeemed".to_string()));
        }

        self.redeemed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// List invites, optionally restricted to one status. Active invites come
    /// first ordered by soonest expiration, followed by redeemed and expired
    /// invites ordered by most recent activity.
    #[instrument(skip(conn))]
    pub async fn list(
        conn: &mut SqliteConnection,
        status: Option<InviteStatus>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invite>, DbError> {
        let mut invites = vec![];
        let statuses = match status {
            Some(status) => vec![status],
            None => vec![
                InviteStatus::Active,
                InviteStatus::Redeemed,
                InviteStatus::Expired,
            ],
        };

        for status in statuses {
            let rows = match status {
                InviteStatus::Active => {
                    let query = format!(
                        "{INVITE_SELECT} WHERE inv.expires_at > ? AND inv.redeemed_at IS NULL
                        ORDER BY inv.expires_at ASC"
                    );
                    sqlx::query_as::<_, InviteRow>(&query)
                        .bind(now)
                        .fetch_all(&mut *conn)
                        .await?
                }
                InviteStatus::Redeemed => {
                    let query = format!(
                        "{INVITE_SELECT} WHERE inv.redeemed_at IS NOT NULL
                        ORDER BY inv.redeemed_at DESC"
                    );
                    sqlx::query_as::<_, InviteRow>(&query)
                        .fetch_all(&mut *conn)
                        .await?
                }
                InviteStatus::Expired => {
                    let query = format!(
                        "{INVITE_SELECT} WHERE inv.expires_at <= ? AND inv.redeemed_at IS NULL
                        ORDER BY inv.expires_at DESC"
                    );
                    sqlx::query_as::<_, InviteRow>(&query)
                        .bind(now)
                        .fetch_all(&mut *conn)
                        .await?
                }
            };
            for row in rows {
                invites.push(row.try_into()?);
            }
        }

        Ok(invites)
    }
}

/// A record of a TLS client certificate issued for a remote Sesame user.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCertificate {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hex representation of the certificate's serial number; unique within
    /// this server.
    pub serial_number: String,
    pub user: User,
    /// A unique identifier of the remote site this certificate is used in.
    pub site_id: String,
    /// Used for renewing a certificate that has already expired, to avoid
    /// sending users through the invitation process again.
    pub renewal_token: Vec<u8>,
    /// Always at or beyond `expires_at`. Once the renewal token also
    /// expires, the user has to go through the invitation process again.
    pub renewal_token_expires_at: DateTime<Utc>,
}

/// Selects a single client certificate record.
#[derive(Debug, Clone)]
pub enum ClientCertSelector {
    Id(i64),
    Serial(String),
    /// The 32-byte renewal token; only unexpired tokens match.
    RenewalToken(Vec<u8>),
}

impl ClientCertSelector {
    fn describe(&self) -> String {
        match self {
            ClientCertSelector::Id(id) => format!("ID {id}"),
            ClientCertSelector::Serial(serial) => format!("serial number '{serial}'"),
            ClientCertSelector::RenewalToken(_) => "renewal token".to_string(),
        }
    }

    fn push_filter(&self, query: &mut QueryBuilder<Sqlite>, now: DateTime<Utc>) {
        match self {
            ClientCertSelector::Id(id) => {
                query.push("cc.id = ").push_bind(*id);
            }
            ClientCertSelector::Serial(serial) => {
                query.push("cc.serial_number = ").push_bind(serial.clone());
            }
            ClientCertSelector::RenewalToken(token) => {
                query
                    .push("cc.renewal_token = ")
                    .push_bind(token.clone())
                    .push(" AND cc.renewal_token_expires_at > ")
                    .push_bind(now);
            }
        }
    }
}

#[derive(Debug, FromRow)]
struct ClientCertRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    serial_number: String,
    site_id: String,
    renewal_token: Vec<u8>,
    renewal_token_expires_at: DateTime<Utc>,
    user_id: i64,
    user_name: String,
    user_created_at: DateTime<Utc>,
    user_updated_at: DateTime<Utc>,
}

impl From<ClientCertRow> for ClientCertificate {
    fn from(row: ClientCertRow) -> Self {
        ClientCertificate {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            serial_number: row.serial_number,
            user: User {
                id: row.user_id,
                name: row.user_name,
                created_at: row.user_created_at,
                updated_at: row.user_updated_at,
            },
            site_id: row.site_id,
            renewal_token: row.renewal_token,
            renewal_token_expires_at: row.renewal_token_expires_at,
        }
    }
}

const CLIENT_CERT_SELECT: &str = "SELECT
        cc.id, cc.created_at, cc.updated_at, cc.expires_at, cc.serial_number, cc.site_id,
        cc.renewal_token, cc.renewal_token_expires_at,
        u.id AS user_id, u.name AS user_name,
        u.created_at AS user_created_at, u.updated_at AS user_updated_at
    FROM client_certs cc JOIN users u ON u.id = cc.user_id";

impl ClientCertificate {
    /// Build a new record for an issued certificate. A fresh renewal token is
    /// generated; it expires `renewal_window` beyond the certificate itself,
    /// so `renewal_token_expires_at >= expires_at` holds by construction.
    pub fn new(
        user: User,
        site_id: String,
        renewal_window: Duration,
        cert: &crypto::CertInfo,
    ) -> anyhow::Result<ClientCertificate> {
        let renewal_token =
            crypto::random_data(KEY_SIZE).context("failed generating renewal token")?;
        let renewal_token_expires_at = cert.not_after
            + chrono::Duration::from_std(renewal_window)
                .context("renewal window is out of range")?;

        Ok(ClientCertificate {
            id: 0,
            created_at: cert.not_before,
            updated_at: cert.not_before,
            expires_at: cert.not_after,
            serial_number: cert.serial_number.clone(),
            user,
            site_id,
            renewal_token,
            renewal_token_expires_at,
        })
    }

    #[instrument(skip(self, conn), fields(serial = self.serial_number))]
    pub async fn insert(
        &mut self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO client_certs
                (created_at, updated_at, expires_at, serial_number, user_id, site_id,
                renewal_token, renewal_token_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(now)
        .bind(now)
        .bind(self.expires_at)
        .bind(&self.serial_number)
        .bind(self.user.id)
        .bind(&self.site_id)
        .bind(&self.renewal_token)
        .bind(self.renewal_token_expires_at)
        .fetch_one(&mut *conn)
        .await?;

        self.id = id;
        self.created_at = now;
        self.updated_at = now;
        Ok(())
    }

    #[instrument(skip(conn))]
    pub async fn load(
        conn: &mut SqliteConnection,
        selector: &ClientCertSelector,
        now: DateTime<Utc>,
    ) -> Result<ClientCertificate, DbError> {
        let mut query = QueryBuilder::<Sqlite>::new(CLIENT_CERT_SELECT);
        query.push(" WHERE ");
        selector.push_filter(&mut query, now);

        let mut rows = query
            .build_query_as::<ClientCertRow>()
            .fetch_all(&mut *conn)
            .await?;
        match rows.len() {
            0 => Err(DbError::NoResult {
                model: "client certificate",
                filter: selector.describe(),
            }),
            1 => Ok(rows.remove(0).into()),
            count => Err(DbError::TooManyResults {
                filter: selector.describe(),
                count: count as i64,
            }),
        }
    }

    /// Update the site id of a certificate record. The selector must match
    /// exactly one row; zero affected rows surfaces as
    /// [`DbError::NoResult`].
    #[instrument(skip(conn))]
    pub async fn update_site_id(
        conn: &mut SqliteConnection,
        selector: &ClientCertSelector,
        site_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE client_certs AS cc SET updated_at = ");
        query.push_bind(now);
        query.push(", site_id = ").push_bind(site_id.to_string());
        query.push(" WHERE ");
        selector.push_filter(&mut query, now);

        let result = query.build().execute(&mut *conn).await?;
        match result.rows_affected() {
            0 => Err(DbError::NoResult {
                model: "client certificate",
                filter: selector.describe(),
            }),
            1 => Ok(()),
            n => Err(DbError::Integrity(format!(
                "updated {n} client certificates"
            ))),
        }
    }

    #[instrument(skip(conn))]
    pub async fn delete(
        conn: &mut SqliteConnection,
        selector: &ClientCertSelector,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM client_certs AS cc WHERE ");
        selector.push_filter(&mut query, now);

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoResult {
                model: "client certificate",
                filter: selector.describe(),
            });
        }
        Ok(())
    }

    #[instrument(skip(conn))]
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<ClientCertificate>, DbError> {
        let query = format!("{CLIENT_CERT_SELECT} ORDER BY cc.expires_at ASC");
        let rows = sqlx::query_as::<_, ClientCertRow>(&query)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// A system service whose access can be managed by the firewall.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub port: u16,
    /// The longest access duration a client may be granted for this service.
    pub max_access_duration: Duration,
}

#[derive(Debug, FromRow)]
struct ServiceRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    name: String,
    port: i64,
    max_access_duration: i64,
}

impl TryFrom<ServiceRow> for Service {
    type Error = DbError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| {
            DbError::Integrity(format!("service '{}' has invalid port {}", row.name, row.port))
        })?;
        let max_access_duration = u64::try_from(row.max_access_duration)
            .map(Duration::from_secs)
            .map_err(|_| {
                DbError::Integrity(format!(
                    "service '{}' has a negative max access duration",
                    row.name
                ))
            })?;
        Ok(Service {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            name: row.name,
            port,
            max_access_duration,
        })
    }
}

impl Service {
    #[instrument(skip(conn))]
    pub async fn create(
        conn: &mut SqliteConnection,
        name: &str,
        port: u16,
        max_access_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Service, DbError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO services (created_at, updated_at, name, port, max_access_duration)
            VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(i64::from(port))
        .bind(max_access_duration.as_secs() as i64)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Service {
            id,
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            port,
            max_access_duration,
        })
    }

    #[instrument(skip(conn))]
    pub async fn load(conn: &mut SqliteConnection, name: &str) -> Result<Service, DbError> {
        let mut rows =
            sqlx::query_as::<_, ServiceRow>("SELECT * FROM services WHERE name = ?")
                .bind(name)
                .fetch_all(&mut *conn)
                .await?;
        match rows.len() {
            0 => Err(DbError::NoResult {
                model: "service",
                filter: format!("name '{name}'"),
            }),
            1 => rows.remove(0).try_into(),
            n => Err(DbError::Integrity(format!(
                "service query with name '{name}' returned {n} rows"
            ))),
        }
    }

    #[instrument(skip(conn))]
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Service>, DbError> {
        let rows = sqlx::query_as::<_, ServiceRow>("SELECT * FROM services ORDER BY name ASC")
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(conn))]
    pub async fn delete(conn: &mut SqliteConnection, name: &str) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM services WHERE name = ?")
            .bind(name)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NoResult {
                model: "service",
                filter: format!("name '{name}'"),
            });
        }
        Ok(())
    }
}

/// Access to the singleton meta row holding the schema version and the
/// server's TLS identity.
pub struct Meta;

impl Meta {
    /// The server's PEM-serialized TLS identity, if the server has been
    /// initialized.
    #[instrument(skip(conn))]
    pub async fn server_credential(
        conn: &mut SqliteConnection,
    ) -> Result<Option<String>, DbError> {
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT server_tls_cert FROM meta WHERE id = 1")
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.flatten())
    }

    /// Store the server's TLS identity, creating the meta row if needed.
    #[instrument(skip(conn, credential))]
    pub async fn set_server_credential(
        conn: &mut SqliteConnection,
        credential: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO meta (id, version, server_tls_cert) VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET server_tls_cert = excluded.server_tls_cert",
        )
        .bind(SCHEMA_VERSION)
        .bind(credential)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    async fn test_pool() -> Result<Pool<Sqlite>> {
        let db_pool = pool("sqlite::memory:").await?;
        migrate(&db_pool).await?;
        Ok(db_pool)
    }

    #[tokio::test]
    async fn create_load_delete_user() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let by_name = User::load(&mut conn, &UserSelector::Name("alice".into())).await?;
        let by_id = User::load(&mut conn, &UserSelector::Id(user.id)).await?;
        assert_eq!(user, by_name);
        assert_eq!(user, by_id);

        User::delete(&mut conn, &UserSelector::Name("alice".into())).await?;
        let result = User::load(&mut conn, &UserSelector::Name("alice".into())).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));
        let result = User::delete(&mut conn, &UserSelector::Name("alice".into())).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn user_names_are_unique() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        User::create(&mut conn, "alice", now).await?;
        let result = User::create(&mut conn, "alice", now).await;
        assert!(matches!(result, Err(DbError::Sqlx(_))));

        Ok(())
    }

    #[tokio::test]
    async fn invite_roundtrip_and_token() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let mut invite = Invite::new(
            user,
            now + chrono::Duration::hours(1),
            Some("home".into()),
            now,
        )?;
        invite.insert(&mut conn, now).await?;
        assert_ne!(0, invite.id);

        let loaded =
            Invite::load(&mut conn, &InviteSelector::Nonce(invite.nonce.clone()), now).await?;
        assert_eq!(invite.uuid, loaded.uuid);
        assert_eq!(invite.site_id, loaded.site_id);
        assert_eq!(invite.private_key(), loaded.private_key());
        assert_eq!(invite.token(), loaded.token());
        assert_eq!(InviteStatus::Active, loaded.status(now));

        Ok(())
    }

    #[tokio::test]
    async fn invite_expiration_must_be_in_the_future() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();
        let user = User::create(&mut conn, "alice", now).await?;

        assert!(Invite::new(user, now - chrono::Duration::seconds(1), None, now).is_err());

        Ok(())
    }

    // A nonce lookup is filtered on the expiration time, so expired invites
    // are invisible to the authentication path.
    #[tokio::test]
    async fn expired_invites_do_not_load_by_nonce() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let mut invite =
            Invite::new(user, now + chrono::Duration::seconds(1), None, now)?;
        invite.insert(&mut conn, now).await?;

        let later = now + chrono::Duration::hours(1);
        let result =
            Invite::load(&mut conn, &InviteSelector::Nonce(invite.nonce.clone()), later).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));
        assert_eq!(InviteStatus::Expired, invite.status(later));

        Ok(())
    }

    #[tokio::test]
    async fn invite_uuid_prefix_must_be_unambiguous() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();
        let expires = now + chrono::Duration::hours(1);

        let user = User::create(&mut conn, "alice", now).await?;
        let mut first = Invite::new(user.clone(), expires, None, now)?;
        first.uuid = "AAAAbbbbcccc".to_string();
        first.insert(&mut conn, now).await?;
        let mut second = Invite::new(user, expires, None, now)?;
        second.uuid = "AAAAddddeeee".to_string();
        second.insert(&mut conn, now).await?;

        // An ambiguous prefix fails with the match count.
        let result = Invite::load(&mut conn, &InviteSelector::Uuid("AAAA".into()), now).await;
        assert!(matches!(
            result,
            Err(DbError::TooManyResults { count: 2, .. })
        ));

        // An unambiguous prefix and the full UUID both work.
        let loaded = Invite::load(&mut conn, &InviteSelector::Uuid("AAAAb".into()), now).await?;
        assert_eq!(first.uuid, loaded.uuid);
        let loaded =
            Invite::load(&mut conn, &InviteSelector::Uuid("AAAAddddeeee".into()), now).await?;
        assert_eq!(second.uuid, loaded.uuid);

        Ok(())
    }

    // Exactly one of any number of redemptions may succeed, enforced by the
    // conditional UPDATE.
    #[tokio::test]
    async fn invite_redeems_only_once() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let mut invite = Invite::new(user, now + chrono::Duration::hours(1), None, now)?;
        invite.insert(&mut conn, now).await?;

        invite.redeem(&mut conn, now).await?;
        assert!(invite.is_redeemed());
        assert_eq!(InviteStatus::Redeemed, invite.status(now));

        // The in-memory record refuses immediately.
        let result = invite.redeem(&mut conn, now).await;
        assert!(matches!(result, Err(DbError::InvalidInput(_))));

        // A stale copy loses the conditional update.
        let mut stale =
            Invite::load(&mut conn, &InviteSelector::Id(invite.id), now).await?;
        stale.redeemed_at = None;
        let result = stale.redeem(&mut conn, now).await;
        assert!(matches!(result, Err(DbError::Conflict(_))));

        Ok(())
    }

    #[tokio::test]
    async fn invite_update_and_delete() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let mut invite = Invite::new(user, now + chrono::Duration::hours(1), None, now)?;
        invite.insert(&mut conn, now).await?;

        let new_expiry = now + chrono::Duration::hours(12);
        Invite::update(
            &mut conn,
            &InviteSelector::Uuid(invite.uuid.clone()),
            &InviteUpdate {
                expires_at: Some(new_expiry),
                site_id: Some("lab".into()),
            },
            now,
        )
        .await?;

        let loaded = Invite::load(&mut conn, &InviteSelector::Id(invite.id), now).await?;
        assert_eq!("lab", loaded.site_id);
        assert!((loaded.expires_at - new_expiry).num_seconds().abs() < 1);

        Invite::delete(&mut conn, &InviteSelector::Uuid(invite.uuid.clone()), now).await?;
        let result = Invite::load(&mut conn, &InviteSelector::Id(invite.id), now).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_user_cascades() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let user = User::create(&mut conn, "alice", now).await?;
        let mut invite =
            Invite::new(user.clone(), now + chrono::Duration::hours(1), None, now)?;
        invite.insert(&mut conn, now).await?;

        let cert_info = crypto::CertInfo {
            serial_number: "ab01".to_string(),
            common_name: "alice".to_string(),
            dns_names: vec![],
            not_before: now,
            not_after: now + chrono::Duration::days(30),
            is_ca: false,
        };
        let mut record = ClientCertificate::new(
            user.clone(),
            "home".to_string(),
            Duration::from_secs(3600),
            &cert_info,
        )?;
        record.insert(&mut conn, now).await?;

        User::delete(&mut conn, &UserSelector::Id(user.id)).await?;

        let result = Invite::load(&mut conn, &InviteSelector::Id(invite.id), now).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));
        let result =
            ClientCertificate::load(&mut conn, &ClientCertSelector::Id(record.id), now).await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn client_cert_serial_is_unique() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();
        let user = User::create(&mut conn, "alice", now).await?;

        let cert_info = crypto::CertInfo {
            serial_number: "ab01".to_string(),
            common_name: "alice".to_string(),
            dns_names: vec![],
            not_before: now,
            not_after: now + chrono::Duration::days(30),
            is_ca: false,
        };
        let mut record = ClientCertificate::new(
            user.clone(),
            "home".to_string(),
            Duration::from_secs(3600),
            &cert_info,
        )?;
        record.insert(&mut conn, now).await?;
        assert!(record.renewal_token_expires_at >= record.expires_at);

        let mut duplicate = ClientCertificate::new(
            user,
            "home".to_string(),
            Duration::from_secs(3600),
            &cert_info,
        )?;
        let result = duplicate.insert(&mut conn, now).await;
        assert!(matches!(result, Err(DbError::Sqlx(_))));

        Ok(())
    }

    #[tokio::test]
    async fn client_cert_loads_by_serial_and_renewal_token() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();
        let user = User::create(&mut conn, "alice", now).await?;

        let cert_info = crypto::CertInfo {
            serial_number: "cd02".to_string(),
            common_name: "alice".to_string(),
            dns_names: vec![],
            not_before: now,
            not_after: now + chrono::Duration::days(30),
            is_ca: false,
        };
        let mut record = ClientCertificate::new(
            user,
            "home".to_string(),
            Duration::from_secs(3600),
            &cert_info,
        )?;
        record.insert(&mut conn, now).await?;

        let by_serial = ClientCertificate::load(
            &mut conn,
            &ClientCertSelector::Serial("cd02".into()),
            now,
        )
        .await?;
        assert_eq!(record.id, by_serial.id);
        assert_eq!("alice", by_serial.user.name);

        let by_token = ClientCertificate::load(
            &mut conn,
            &ClientCertSelector::RenewalToken(record.renewal_token.clone()),
            now,
        )
        .await?;
        assert_eq!(record.id, by_token.id);

        // The renewal token stops matching once it expires.
        let long_after = record.renewal_token_expires_at + chrono::Duration::seconds(1);
        let result = ClientCertificate::load(
            &mut conn,
            &ClientCertSelector::RenewalToken(record.renewal_token.clone()),
            long_after,
        )
        .await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn client_cert_update_requires_a_match() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let result = ClientCertificate::update_site_id(
            &mut conn,
            &ClientCertSelector::Serial("missing".into()),
            "elsewhere",
            now,
        )
        .await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn service_roundtrip() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;
        let now = Utc::now();

        let service =
            Service::create(&mut conn, "web", 8080, Duration::from_secs(3600), now).await?;
        let loaded = Service::load(&mut conn, "web").await?;
        assert_eq!(service, loaded);
        assert_eq!(8080, loaded.port);
        assert_eq!(Duration::from_secs(3600), loaded.max_access_duration);

        let result = Service::load(&mut conn, "missing").await;
        assert!(matches!(result, Err(DbError::NoResult { .. })));

        assert_eq!(1, Service::list(&mut conn).await?.len());
        Service::delete(&mut conn, "web").await?;
        assert!(Service::list(&mut conn).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn meta_stores_the_server_credential() -> Result<()> {
        let db_pool = test_pool().await?;
        let mut conn = db_pool.acquire().await?;

        assert_eq!(None, Meta::server_credential(&mut conn).await?);

        Meta::set_server_credential(&mut conn, "PEM DATA").await?;
        assert_eq!(
            Some("PEM DATA".to_string()),
            Meta::server_credential(&mut conn).await?
        );

        // Setting it again replaces the stored value.
        Meta::set_server_credential(&mut conn, "NEW PEM DATA").await?;
        assert_eq!(
            Some("NEW PEM DATA".to_string()),
            Meta::server_credential(&mut conn).await?
        );

        Ok(())
    }
}
