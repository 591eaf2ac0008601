// SPDX-License-Identifier: MIT

//! Authenticators for the two trust domains the server speaks to: peers with
//! an established mTLS identity, and unauthenticated peers redeeming an
//! invite token.

use async_trait::async_trait;
use chrono::Utc;
use http::header;
use sqlx::{Pool, Sqlite};

use crate::{
    crypto::{self, KEY_SIZE},
    error::ApiError,
    server::db::{DbError, Invite, InviteSelector, User, UserSelector},
    server::pipeline::{ApiRequest, Authenticator, RequestContext},
    token,
};

/// Context-binding label for the HMAC key derived from the ECDH shared
/// secret. Both sides of the handshake must use the same value.
pub const HMAC_KEY_INFO: &[u8] = b"HMAC key derivation";

/// Authenticates requests arriving over mutual TLS.
///
/// The listener verifies the client certificate chain against the server CA
/// during the handshake and lifts the leaf's Subject Common Name into the
/// request; this authenticator requires that identity to map to a known
/// user. Endpoints that demand TLS enforce it here, never at the listener.
pub struct MtlsAuth {
    db: Pool<Sqlite>,
}

impl MtlsAuth {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl<Req: ApiRequest> Authenticator<Req> for MtlsAuth {
    async fn authenticate(
        &self,
        _cx: &mut RequestContext,
        req: &mut Req,
    ) -> Result<(), ApiError> {
        let Some(peer) = req.parts().peer.clone() else {
            return Err(ApiError::unauthorized("failed TLS authentication"));
        };

        let mut conn = self
            .db
            .acquire()
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;
        let user = User::load(&mut conn, &UserSelector::Name(peer.common_name))
            .await
            .map_err(|error| match error {
                DbError::NoResult { .. } => ApiError::unauthorized(
                    "failed loading user identified in the client TLS certificate",
                ),
                error => ApiError::internal(error.to_string()),
            })?;

        tracing::debug!(user = user.name, "authenticated mTLS peer");
        req.set_user(user);

        Ok(())
    }
}

/// Authenticates a /join request with a single-use invite token over plain
/// HTTP.
///
/// The Authorization header carries `Bearer <token>;<clientPubKey>`, both
/// halves base58. The token splits into the invite nonce and an HMAC keyed
/// on a key derived from the ECDH shared secret, which proves the sender
/// holds both the invite token and the private half of the offered public
/// key. On success the invite is atomically redeemed, and the shared key is
/// deposited in the request context for response encryption.
pub struct InviteTokenAuth {
    db: Pool<Sqlite>,
}

impl InviteTokenAuth {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl<Req: ApiRequest> Authenticator<Req> for InviteTokenAuth {
    async fn authenticate(
        &self,
        cx: &mut RequestContext,
        req: &mut Req,
    ) -> Result<(), ApiError> {
        let invalid = || ApiError::unauthorized("invalid invite token");

        // 1. Extract the token and the client's public key from the
        //    Authorization header.
        let bearer = req
            .parts()
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(invalid)?;
        let (token, client_pub_key) = bearer.split_once(';').ok_or_else(invalid)?;
        if token.is_empty() || client_pub_key.is_empty() {
            return Err(invalid());
        }

        let (nonce, mac) = token::decode_token(token).map_err(|_| invalid())?;

        // 2. Look up the invite by its nonce; expired invites never match.
        let now = Utc::now();
        let mut conn = self
            .db
            .acquire()
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;
        let mut invite = Invite::load(&mut conn, &InviteSelector::Nonce(nonce.to_vec()), now)
            .await
            .map_err(|error| match error {
                DbError::NoResult { .. } => ApiError::unauthorized("invite not found"),
                error @ (DbError::TooManyResults { .. }
                | DbError::Integrity(_)
                | DbError::InvalidInput(_)) => ApiError::bad_request(error.to_string()),
                error => ApiError::internal(error.to_string()),
            })?;

        // 3. Decode the client's X25519 public key.
        let client_pub_key = bs58::decode(client_pub_key)
            .into_vec()
            .map_err(|error| ApiError::bad_request(format!("invalid public key: {error}")))?;
        if client_pub_key.len() != KEY_SIZE {
            return Err(ApiError::bad_request(format!(
                "public keys must be {KEY_SIZE} bytes"
            )));
        }

        // 4. Run the ECDH exchange against the invite's private key and
        //    derive the HMAC key from the shared secret.
        let (shared_key, _) = crypto::ecdh_exchange(&client_pub_key, Some(invite.private_key()))
            .map_err(|error| ApiError::internal(error.to_string()))?;
        let hmac_key = crypto::derive_hmac_key(shared_key.as_ref(), HMAC_KEY_INFO)
            .map_err(|error| ApiError::internal(error.to_string()))?;

        // 5. Verify the HMAC over the nonce. The comparison is constant
        //    time, so the response does not reveal how far verification got.
        if !crypto::check_hmac(&invite.nonce, &mac, &hmac_key) {
            return Err(invalid());
        }

        // 6. The client is authenticated; redeem the invite so it can never
        //    be used again. The conditional update serializes concurrent
        //    attempts, so at most one of them gets past this point.
        invite
            .redeem(&mut conn, now)
            .await
            .map_err(|error| match error {
                DbError::Conflict(_) | DbError::InvalidInput(_) => {
                    ApiError::unauthorized("invite already redeemed")
                }
                error => ApiError::internal(error.to_string()),
            })?;

        tracing::info!(
            user = invite.user.name,
            invite = invite.uuid,
            site_id = invite.site_id,
            "invite redeemed"
        );

        req.set_user(invite.user.clone());
        req.set_site_id(invite.site_id.clone());

        // The shared key is needed again when the response is encrypted.
        cx.set_shared_key(shared_key);

        Ok(())
    }
}
