// SPDX-License-Identifier: MIT

//! A friendly interface over the Sesame HTTP API.
//!
//! [`Client::join`] performs the invite handshake over plain HTTP and yields
//! the TLS credentials for this node; [`Client::open`] and [`Client::close`]
//! use those credentials to call the privileged endpoints over mutual TLS.

use std::time::Duration;

use http::StatusCode;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::{
    config::Credentials,
    crypto::{self, KEY_SIZE},
    error::ClientError,
    server::handlers::{CloseParams, JoinData, OpenParams},
    token,
};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The credentials received from a successful join.
#[derive(Debug, Clone)]
pub struct JoinedCredentials {
    /// The remote node's CA certificate, PEM-encoded. Used to pin the remote
    /// for all later requests.
    pub ca_certificate: String,
    /// This node's client credential: certificate chain and private key in a
    /// single PEM bundle.
    pub credential: String,
}

impl JoinedCredentials {
    /// Persist the credentials to the paths in `credentials`.
    pub async fn save(&self, credentials: &Credentials) -> Result<(), ClientError> {
        if let Some(parent) = credentials.credential.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&credentials.ca_certificate, &self.ca_certificate).await?;
        tokio::fs::write(&credentials.credential, &self.credential).await?;
        Ok(())
    }

    /// Load previously saved credentials.
    pub async fn load(credentials: &Credentials) -> Result<JoinedCredentials, ClientError> {
        Ok(JoinedCredentials {
            ca_certificate: tokio::fs::read_to_string(&credentials.ca_certificate).await?,
            credential: tokio::fs::read_to_string(&credentials.credential).await?,
        })
    }

    // The remote's identifier: the first DNS SAN of its CA certificate. The
    // server's certificate carries no public hostname, so TLS verification
    // pins this name instead.
    fn server_id(&self) -> Result<String, ClientError> {
        let mut reader = std::io::Cursor::new(self.ca_certificate.as_bytes());
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| ClientError::Decode("no CA certificate block found".to_string()))?
            .map_err(|error| ClientError::Decode(error.to_string()))?;
        let info = crypto::cert_info(&der)?;
        info.dns_names
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Decode("the CA certificate has no DNS SAN".to_string()))
    }
}

/// The wire form of the server's response envelope.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct WireEnvelope<T> {
    status_code: u16,
    #[serde(default)]
    status: String,
    error: Option<WireError>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

/// A client for one remote Sesame node.
#[derive(Debug, Clone)]
pub struct Client {
    address: String,
    join_timeout: Duration,
    request_timeout: Duration,
}

impl Client {
    /// Create a client for the node at `address` (host:port).
    pub fn new(address: impl Into<String>) -> Client {
        Client {
            address: address.into(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, join: Duration, request: Duration) -> Client {
        self.join_timeout = join;
        self.request_timeout = request;
        self
    }

    /// Redeem an invite token and obtain TLS credentials for this node.
    ///
    /// The exchange runs over plain HTTP: the invite token proves the server
    /// is the one that minted the invite (only it holds the invite private
    /// key), the HMAC proves this client holds the token, and the response
    /// is encrypted under the shared key so nobody else can read the issued
    /// credential.
    pub async fn join(&self, invite_token: &str) -> Result<JoinedCredentials, ClientError> {
        let (bearer, shared_key) = join_bearer(invite_token)?;

        let http = reqwest::Client::builder()
            .timeout(self.join_timeout)
            .build()?;
        let response = http
            .post(format!("http://{}/api/v1/join", self.address))
            .header(http::header::AUTHORIZATION, format!("Bearer {bearer}"))
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(join_error(status, &body));
        }

        // The payload is base58( encrypt( json( envelope ) ) ).
        let armored = std::str::from_utf8(&body)
            .map_err(|_| ClientError::Decode("response body is not UTF-8".to_string()))?;
        let ciphertext = bs58::decode(armored.trim())
            .into_vec()
            .map_err(|error| ClientError::Decode(format!("invalid base58 framing: {error}")))?;
        let plaintext = crypto::decrypt_sym(&ciphertext, &shared_key)
            .map_err(|error| ClientError::Decode(format!("{error:#}")))?;

        let envelope: WireEnvelope<JoinData> = serde_json::from_slice(&plaintext)
            .map_err(|error| ClientError::Decode(format!("malformed response envelope: {error}")))?;
        let data = envelope
            .data
            .ok_or_else(|| ClientError::Decode("response envelope has no data".to_string()))?;

        let ca_pem = pem::encode(&pem::Pem::new("CERTIFICATE", data.tls_ca_cert));
        let credential = String::from_utf8(data.tls_client_cert)
            .map_err(|_| ClientError::Decode("credential bundle is not UTF-8".to_string()))?;

        Ok(JoinedCredentials {
            ca_certificate: ca_pem,
            credential,
        })
    }

    /// Grant clients access to a service on the remote node.
    pub async fn open(
        &self,
        credentials: &JoinedCredentials,
        params: &OpenParams,
    ) -> Result<(), ClientError> {
        self.privileged_request(credentials, "open", params).await
    }

    /// Deny clients access to a service on the remote node.
    pub async fn close(
        &self,
        credentials: &JoinedCredentials,
        params: &CloseParams,
    ) -> Result<(), ClientError> {
        self.privileged_request(credentials, "close", params).await
    }

    async fn privileged_request<B: serde::Serialize>(
        &self,
        credentials: &JoinedCredentials,
        endpoint: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let server_id = credentials.server_id()?;
        let addr = tokio::net::lookup_host(&self.address)
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("could not resolve {}", self.address),
                )
            })?;

        let identity = reqwest::Identity::from_pem(credentials.credential.as_bytes())?;
        let ca = reqwest::Certificate::from_pem(credentials.ca_certificate.as_bytes())?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            // The remote's certificate names its site identifier rather than
            // a hostname; dial the configured address but verify against the
            // pinned identifier.
            .resolve(&server_id, addr)
            .timeout(self.request_timeout)
            .build()?;

        let response = http
            .post(format!("https://{server_id}:{}/api/v1/{endpoint}", addr.port()))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        Ok(())
    }
}

/// Build the Authorization bearer payload for a /join request, returning it
/// together with the derived shared key.
fn join_bearer(
    invite_token: &str,
) -> Result<(String, Zeroizing<[u8; KEY_SIZE]>), ClientError> {
    let (nonce, invite_pub_key) = token::decode_token(invite_token)?;
    let (shared_key, pub_key) = crypto::ecdh_exchange(&invite_pub_key, None)?;
    let hmac_key = crypto::derive_hmac_key(shared_key.as_ref(), crate::server::auth::HMAC_KEY_INFO)?;
    let mac = crypto::generate_hmac(&nonce, &hmac_key);

    let bearer = format!(
        "{};{}",
        token::encode_token(&nonce, &mac),
        bs58::encode(pub_key).into_string()
    );
    Ok((bearer, shared_key))
}

// Error responses carry either a JSON envelope (mTLS endpoints) or a bare
// sanitized message; surface whichever is there.
fn api_error(status: StatusCode, body: &[u8]) -> ClientError {
    let message = serde_json::from_slice::<WireEnvelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.error.map(|error| error.message))
        .unwrap_or_else(|| String::from_utf8_lossy(body).to_string());
    ClientError::Api { status, message }
}

// /join error responses go through the same response processors as its
// successes, so the envelope arrives base58-armored (but unencrypted, since
// no key exchange completed). Unwrap that framing when it's present.
fn join_error(status: StatusCode, body: &[u8]) -> ClientError {
    let decoded = std::str::from_utf8(body)
        .ok()
        .and_then(|armored| bs58::decode(armored.trim()).into_vec().ok());
    match decoded {
        Some(envelope) => api_error(status, &envelope),
        None => api_error(status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::HMAC_KEY_INFO;

    // The bearer the client builds must verify against the invite's private
    // key the way the server checks it.
    #[test]
    fn join_bearer_verifies_server_side() {
        let invite_priv = crypto::new_x25519_key();
        let nonce = [0x21u8; KEY_SIZE];
        let invite_token =
            token::encode_token(&nonce, &crypto::x25519_public_key(&invite_priv));

        let (bearer, client_shared) = join_bearer(&invite_token).unwrap();

        let (token_part, pub_part) = bearer.split_once(';').unwrap();
        let (recv_nonce, recv_mac) = token::decode_token(token_part).unwrap();
        assert_eq!(nonce, recv_nonce);

        let client_pub = bs58::decode(pub_part).into_vec().unwrap();
        let (server_shared, _) =
            crypto::ecdh_exchange(&client_pub, Some(&invite_priv)).unwrap();
        assert_eq!(*client_shared, *server_shared);

        let hmac_key = crypto::derive_hmac_key(server_shared.as_ref(), HMAC_KEY_INFO).unwrap();
        assert!(crypto::check_hmac(&recv_nonce, &recv_mac, &hmac_key));
    }

    #[test]
    fn join_bearer_rejects_bad_tokens() {
        assert!(matches!(
            join_bearer(""),
            Err(ClientError::Token(_))
        ));
        let short = bs58::encode([1u8; 10]).into_string();
        assert!(matches!(join_bearer(&short), Err(ClientError::Token(_))));
    }

    #[test]
    fn api_error_prefers_the_envelope_message() {
        let body = br#"{"status_code":400,"status":"Bad Request","error":{"message":"unknown service 'x'"}}"#;
        let error = api_error(StatusCode::BAD_REQUEST, body);
        match error {
            ClientError::Api { status, message } => {
                assert_eq!(StatusCode::BAD_REQUEST, status);
                assert_eq!("unknown service 'x'", message);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_the_raw_body() {
        let error = api_error(StatusCode::UNAUTHORIZED, b"authentication failed");
        match error {
            ClientError::Api { message, .. } => assert_eq!("authentication failed", message),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn server_id_comes_from_the_ca_san() {
        let ca = crypto::new_tls_cert(
            "JxF12TrwUP45BMd",
            &["JxF12TrwUP45BMd".to_string()],
            chrono::Utc::now(),
            Duration::from_secs(3600),
            None,
        )
        .unwrap();
        let creds = JoinedCredentials {
            ca_certificate: pem::encode(&pem::Pem::new(
                "CERTIFICATE",
                ca.leaf_der().unwrap().to_vec(),
            )),
            credential: String::new(),
        };
        assert_eq!("JxF12TrwUP45BMd", creds.server_id().unwrap());
    }
}
