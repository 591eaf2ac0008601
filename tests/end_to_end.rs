// SPDX-License-Identifier: MIT

//! End-to-end tests driving a real listener over the loopback interface:
//! the plain-HTTP join handshake and the mTLS privileged endpoints share
//! one port, backed by a temporary state directory and a mock firewall.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use http::StatusCode;
use sesame::{
    client::Client,
    crypto,
    error::{ClientError, ErrorLevel},
    firewall::{IpRange, Mock},
    server::{
        self,
        db::{self, Invite, InviteSelector, InviteStatus, Service, User},
        handlers::{CloseParams, OpenParams},
        Config, Server,
    },
    token,
};
use sqlx::{Pool, Sqlite};

const HOUR: Duration = Duration::from_secs(3600);

struct Instance {
    listener: server::Listener,
    address: String,
    pool: Pool<Sqlite>,
    firewall: Arc<Mock>,
    // Dropping TempDir cleans up the directory, but it needs to live to the
    // end of the test.
    _state_dir: tempfile::TempDir,
}

impl Instance {
    async fn start(error_level: ErrorLevel) -> Result<Instance> {
        let state_dir = tempfile::TempDir::new()?;
        let config = Config {
            state_directory: state_dir.path().into(),
            listen_address: "127.0.0.1:0".to_string(),
            error_level,
            ..Config::default()
        };

        server::initialize(&config).await?;

        let pool = db::pool(config.database().to_str().unwrap()).await?;

        let firewall = Arc::new(Mock::default());
        let server = Server::with_firewall(config, firewall.clone()).await?;
        let listener = server.run().await?;
        let address = format!("127.0.0.1:{}", listener.local_addr().port());

        Ok(Instance {
            listener,
            address,
            pool,
            firewall,
            _state_dir: state_dir,
        })
    }

    async fn create_user(&self, name: &str) -> Result<User> {
        let mut conn = self.pool.acquire().await?;
        Ok(User::create(&mut conn, name, Utc::now()).await?)
    }

    async fn create_service(&self, name: &str, port: u16, max_access: Duration) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Service::create(&mut conn, name, port, max_access, Utc::now()).await?;
        Ok(())
    }

    async fn create_invite(&self, user: User, site_id: &str) -> Result<Invite> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;
        let mut invite = Invite::new(
            user,
            now + chrono::Duration::hours(1),
            Some(site_id.to_string()),
            now,
        )?;
        invite.insert(&mut conn, now).await?;
        Ok(invite)
    }

    async fn invite_status(&self, invite: &Invite) -> Result<InviteStatus> {
        let mut conn = self.pool.acquire().await?;
        let invite = Invite::load(&mut conn, &InviteSelector::Id(invite.id), Utc::now()).await?;
        Ok(invite.status(Utc::now()))
    }

    fn client(&self) -> Client {
        Client::new(self.address.clone())
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(60))
    }

    async fn halt(self) -> Result<()> {
        self.listener.halt().await
    }
}

// A full happy path: redeem an invite over plain HTTP, recover a valid
// client certificate, then open a service over mTLS on the same port and
// observe the firewall entry.
#[tokio::test]
async fn join_then_open() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;
    let user = instance.create_user("alice").await?;
    instance.create_service("python", 8080, HOUR).await?;
    let invite = instance.create_invite(user, "home").await?;

    let client = instance.client();
    let credentials = client.join(&invite.token()).await?;

    // The recovered credential is a valid certificate with the user's CN.
    let credential = crypto::deserialize_tls_cert(&credentials.credential)?;
    let info = credential.leaf_info()?;
    assert_eq!("alice", info.common_name);
    assert!(!info.is_ca);

    assert_eq!(
        InviteStatus::Redeemed,
        instance.invite_status(&invite).await?
    );

    // Privileged request over mTLS with the fresh credentials.
    client
        .open(
            &credentials,
            &OpenParams {
                clients: vec!["10.0.0.10".to_string()],
                service_name: "python".to_string(),
                duration: Some(HOUR),
            },
        )
        .await?;

    let range = IpRange::parse("10.0.0.10")?;
    assert_eq!(Some(HOUR), instance.firewall.allowed(&range, 8080));

    // And close it again.
    client
        .close(
            &credentials,
            &CloseParams {
                clients: vec!["10.0.0.10".to_string()],
                service_name: "python".to_string(),
            },
        )
        .await?;
    assert_eq!(None, instance.firewall.allowed(&range, 8080));

    instance.halt().await
}

// Replaying a redeemed invite token must fail with 401 and leave the
// firewall untouched.
#[tokio::test]
async fn join_rejects_double_redeem() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;
    let user = instance.create_user("alice").await?;
    let invite = instance.create_invite(user, "home").await?;

    let client = instance.client();
    client.join(&invite.token()).await?;

    let error = client.join(&invite.token()).await.unwrap_err();
    match error {
        ClientError::Api { status, message } => {
            assert_eq!(StatusCode::UNAUTHORIZED, status);
            // The body conforms to the configured error level.
            assert!(message.contains("authentication failed"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(instance.firewall.entries().is_empty());

    instance.halt().await
}

// A tampered HMAC is rejected and the invite stays redeemable.
#[tokio::test]
async fn join_rejects_tampered_hmac() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Full).await?;
    let user = instance.create_user("alice").await?;
    let invite = instance.create_invite(user, "home").await?;

    // Build the bearer by hand, with a corrupted HMAC.
    let (nonce, invite_pub) = token::decode_token(&invite.token())?;
    let (_, client_pub) = crypto::ecdh_exchange(&invite_pub, None)?;
    let bearer = format!(
        "Bearer {};{}",
        token::encode_token(&nonce, &[0x5au8; 32]),
        bs58::encode(client_pub).into_string()
    );

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/v1/join", instance.address))
        .header(http::header::AUTHORIZATION, bearer)
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, response.status());

    // The failed attempt must not redeem the invite.
    assert_eq!(InviteStatus::Active, instance.invite_status(&invite).await?);

    instance.halt().await
}

// Expired invites are invisible to the authentication path.
#[tokio::test]
async fn join_rejects_expired_invites() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Full).await?;
    let user = instance.create_user("alice").await?;
    let invite = instance.create_invite(user, "home").await?;

    // Backdate the expiration.
    let now = Utc::now();
    let mut conn = instance.pool.acquire().await?;
    Invite::update(
        &mut conn,
        &InviteSelector::Id(invite.id),
        &db::InviteUpdate {
            expires_at: Some(now - chrono::Duration::seconds(1)),
            site_id: None,
        },
        now,
    )
    .await?;
    drop(conn);

    let error = instance.client().join(&invite.token()).await.unwrap_err();
    match error {
        ClientError::Api { status, message } => {
            assert_eq!(StatusCode::UNAUTHORIZED, status);
            assert!(message.contains("invite not found"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    instance.halt().await
}

// Opening an unknown service fails with 400 and never reaches the firewall.
#[tokio::test]
async fn open_rejects_unknown_services() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;
    let user = instance.create_user("alice").await?;
    let invite = instance.create_invite(user, "home").await?;

    let client = instance.client();
    let credentials = client.join(&invite.token()).await?;

    let error = client
        .open(
            &credentials,
            &OpenParams {
                clients: vec!["1.2.3.4".to_string()],
                service_name: "nonexistent".to_string(),
                duration: None,
            },
        )
        .await
        .unwrap_err();
    match error {
        ClientError::Api { status, message } => {
            assert_eq!(StatusCode::BAD_REQUEST, status);
            // mTLS endpoints always respond with full error detail.
            assert!(message.contains("unknown service"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(instance.firewall.entries().is_empty());

    instance.halt().await
}

// Requested durations beyond the service maximum are clamped.
#[tokio::test]
async fn open_clamps_durations() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;
    let user = instance.create_user("alice").await?;
    instance.create_service("web", 443, HOUR).await?;
    let invite = instance.create_invite(user, "home").await?;

    let client = instance.client();
    let credentials = client.join(&invite.token()).await?;

    client
        .open(
            &credentials,
            &OpenParams {
                clients: vec!["10.0.0.0/24".to_string()],
                service_name: "web".to_string(),
                duration: Some(2 * HOUR),
            },
        )
        .await?;

    let range = IpRange::parse("10.0.0.0/24")?;
    assert_eq!(Some(HOUR), instance.firewall.allowed(&range, 443));

    instance.halt().await
}

// Without a verified client certificate, the privileged endpoints are
// unreachable: the TLS handshake itself fails.
#[tokio::test]
async fn open_requires_a_client_certificate() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;
    let user = instance.create_user("alice").await?;
    instance.create_service("web", 443, HOUR).await?;
    let invite = instance.create_invite(user, "home").await?;

    let credentials = instance.client().join(&invite.token()).await?;

    // Talk TLS to the hybrid port without presenting an identity.
    let ca = reqwest::Certificate::from_pem(credentials.ca_certificate.as_bytes())?;
    let http = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .build()?;
    let result = http
        .post(format!("https://{}/api/v1/open", instance.address))
        .json(&OpenParams {
            clients: vec!["10.0.0.1".to_string()],
            service_name: "web".to_string(),
            duration: None,
        })
        .send()
        .await;
    assert!(result.is_err());
    assert!(instance.firewall.entries().is_empty());

    instance.halt().await
}

// Unknown paths get a plain 404 regardless of framing.
#[tokio::test]
async fn unknown_paths_are_not_found() -> Result<()> {
    let instance = Instance::start(ErrorLevel::Minimal).await?;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/v1/missing", instance.address))
        .send()
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, response.status());

    instance.halt().await
}
