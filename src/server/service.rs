// SPDX-License-Identifier: MIT

//! The Sesame web service.
//!
//! A single TCP port serves two trust domains: the unauthenticated /join
//! handshake over plain HTTP, and the privileged endpoints over mutual TLS.
//! The listener peeks at the first bytes of each connection to pick the
//! framing; TLS requirements are enforced by the endpoint authenticators,
//! never by the framing choice, which adds no security of its own.

use std::{collections::HashMap, future::Future, net::SocketAddr, pin::Pin, sync::Arc};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use http::{header, HeaderValue, Method, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::{server::WebPkiClientVerifier, RootCertStore};
use sqlx::{Pool, Sqlite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    crypto::{self, TlsCredential},
    error::ErrorLevel,
    firewall::{Firewall, Manager, Mock, NfTables},
    server::{
        auth::{InviteTokenAuth, MtlsAuth},
        config::{Config, FirewallBackend},
        db::{self, Meta},
        handlers::{Api, CloseRequest, JoinData, JoinRequest, OpenRequest},
        pipeline::{
            EncodeBase58, Encrypt, Json, PeerIdentity, Pipeline, RequestParts, WireResponse,
            MAX_BODY_SIZE,
        },
    },
};

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BODY_TIMEOUT: Duration = Duration::from_secs(30);
// Handlers get the same deadline as the response write.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Prepare the server's state directory for first use.
///
/// Creates the database, applies migrations, and generates the server's TLS
/// identity: a self-signed CA whose subject CN and first DNS SAN are a
/// random 128-bit base58 identifier. Running it again is a no-op.
pub async fn initialize(config: &Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.state_directory)
        .await
        .context("failed creating the state directory")?;

    let db_pool = db::pool(database_uri(config)?.as_str()).await?;
    db::migrate(&db_pool).await?;

    let mut conn = db_pool.acquire().await?;
    if Meta::server_credential(&mut conn).await?.is_some() {
        tracing::info!("server is already initialized");
        return Ok(());
    }

    let server_id = bs58::encode(crypto::random_data(16)?).into_string();
    let credential = crypto::new_tls_cert(
        &server_id,
        &[server_id.clone()],
        Utc::now(),
        config.server_cert_lifetime,
        None,
    )?;
    Meta::set_server_credential(&mut conn, &crypto::serialize_tls_cert(&credential)).await?;
    tracing::info!(server_id, "generated the server TLS identity");

    Ok(())
}

fn database_uri(config: &Config) -> anyhow::Result<String> {
    config
        .database()
        .to_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))
}

/// A sesame server, ready to listen.
pub struct Server {
    config: Config,
    tls_config: Arc<rustls::ServerConfig>,
    router: Arc<Router>,
}

/// A running server.
pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
    local_addr: SocketAddr,
}

impl Listener {
    /// Stop accepting new connections and wait for existing connections to
    /// complete.
    ///
    /// Existing connections can run for an arbitrarily long time, so users
    /// should wrap this call in a timeout if they don't have an arbitrarily
    /// long time to wait.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        Ok(())
    }

    /// Get a cancellation token which can be used to start the graceful
    /// shutdown of this listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }

    /// The actual listen address, which is convenient when the port was
    /// dynamically assigned (e.g. ":0").
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Server {
    /// Create a new server from an initialized state directory, with the
    /// firewall backend selected by the configuration.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let backend: Arc<dyn Firewall> = match config.firewall.backend {
            FirewallBackend::Mock => Arc::new(Mock::default()),
            FirewallBackend::Nftables => Arc::new(NfTables::new()),
        };
        Self::with_firewall(config, backend).await
    }

    /// Create a new server driving the given firewall backend. Useful for
    /// embedding and for tests that need to observe the applied rules.
    pub async fn with_firewall(
        config: Config,
        backend: Arc<dyn Firewall>,
    ) -> anyhow::Result<Self> {
        // The ring provider is installed explicitly so the TLS builder
        // doesn't depend on the process-wide default.
        _ = rustls::crypto::ring::default_provider().install_default();

        let db_pool = db::pool(database_uri(&config)?.as_str()).await?;

        let mut conn = db_pool.acquire().await?;
        let credential_pem = Meta::server_credential(&mut conn)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("the server has no TLS identity; run 'sesame-server init' first")
            })?;
        drop(conn);
        let credential = crypto::deserialize_tls_cert(&credential_pem)?;

        let tls_config = Arc::new(Self::tls_config(&credential)?);

        let firewall = Manager::new(backend, config.firewall.default_access_duration).await?;

        let api = Arc::new(Api::new(
            db_pool.clone(),
            firewall,
            Arc::new(credential),
            config.client_cert_lifetime,
            config.renewal_token_window,
        )?);
        let router = Arc::new(Router::new(api, db_pool, config.error_level));

        Ok(Self {
            config,
            tls_config,
            router,
        })
    }

    // TLS 1.3 only; clients must present a certificate signed by the server
    // CA, and the CA certificate doubles as the server's leaf.
    fn tls_config(credential: &TlsCredential) -> anyhow::Result<rustls::ServerConfig> {
        let mut roots = RootCertStore::empty();
        roots
            .add(credential.ca_der()?.clone())
            .context("failed adding the CA certificate to the trust store")?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("failed building the client certificate verifier")?;

        let tls_config = rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
        ])
        .with_client_cert_verifier(verifier)
        .with_single_cert(credential.chain().to_vec(), credential.key_der())
        .context("the server credential is unusable for TLS")?;

        Ok(tls_config)
    }

    /// Run the server.
    #[instrument(skip_all, name = "server")]
    pub async fn run(self) -> anyhow::Result<Listener> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .with_context(|| format!("failed binding to {}", self.config.listen_address))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "started listener");

        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let tls_acceptor = TlsAcceptor::from(self.tls_config.clone());
        let router = self.router.clone();

        let task = tokio::spawn(async move {
            let request_tracker = TaskTracker::new();

            loop {
                tokio::select! {
                    _ = server_halt_token.cancelled() => {
                        tracing::info!("Shutdown requested, no new connections will be accepted");
                        break;
                    },
                    conn = listener.accept() => {
                        match conn {
                            Ok((stream, remote_addr)) => {
                                let acceptor = tls_acceptor.clone();
                                let router = router.clone();
                                let halt = server_halt_token.clone();
                                request_tracker.spawn(async move {
                                    if let Err(error) =
                                        handle_connection(stream, remote_addr, acceptor, router, halt).await
                                    {
                                        tracing::debug!(%error, "connection ended with an error");
                                    }
                                }.instrument(tracing::info_span!("connection", %remote_addr)));
                            }
                            Err(error) => {
                                tracing::error!(?error, "failed accepting incoming connection");
                            }
                        }
                    },
                }
            }

            request_tracker.close();
            request_tracker.wait().await;

            Ok::<_, anyhow::Error>(())
        });

        Ok(Listener {
            task,
            halt_token,
            local_addr,
        })
    }
}

/// Route one accepted connection to TLS or plain HTTP framing based on the
/// first bytes it sends.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    router: Arc<Router>,
    halt: CancellationToken,
) -> anyhow::Result<()> {
    let mut preface = [0u8; 3];
    let peeked = tokio::time::timeout(READ_HEADER_TIMEOUT, async {
        loop {
            let n = stream.peek(&mut preface).await?;
            if n == 0 || n >= preface.len() {
                return Ok::<_, std::io::Error>(n);
            }
            // A partial preface; wait for the rest to arrive.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("timed out waiting for the connection preface")??;

    if peeked == 0 {
        // The peer closed the connection without sending anything.
        return Ok(());
    }

    // A TLS ClientHello starts with a handshake record for TLS 1.x.
    if preface[0] == 0x16 && preface[1] == 0x03 && preface[2] <= 0x03 {
        tracing::debug!("accepting TLS connection");
        let tls_stream = acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;
        let peer = peer_identity(tls_stream.get_ref().1);
        serve_http(TokioIo::new(tls_stream), remote_addr, peer, router, halt).await
    } else {
        tracing::debug!("accepting HTTP connection");
        serve_http(TokioIo::new(stream), remote_addr, None, router, halt).await
    }
}

// Lift the verified client identity out of the TLS session. The handshake
// already verified the chain against the server CA, so the leaf is
// trustworthy here.
fn peer_identity(conn: &rustls::ServerConnection) -> Option<PeerIdentity> {
    let leaf = conn.peer_certificates()?.first()?;
    let info = crypto::cert_info(leaf)
        .inspect_err(|error| tracing::warn!(%error, "failed parsing the client certificate"))
        .ok()?;
    Some(PeerIdentity {
        common_name: info.common_name,
    })
}

async fn serve_http<I>(
    io: TokioIo<I>,
    remote_addr: SocketAddr,
    peer: Option<PeerIdentity>,
    router: Arc<Router>,
    halt: CancellationToken,
) -> anyhow::Result<()>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let router = router.clone();
        let peer = peer.clone();
        async move {
            Ok::<_, std::convert::Infallible>(dispatch(req, remote_addr, peer, router).await)
        }
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT);
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    // On shutdown, let the in-flight request complete but stop the
    // connection from idling on keep-alive.
    tokio::select! {
        result = connection.as_mut() => result.map_err(Into::into),
        _ = halt.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await.map_err(Into::into)
        }
    }
}

async fn dispatch(
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    peer: Option<PeerIdentity>,
    router: Arc<Router>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();

    let body = match tokio::time::timeout(
        READ_BODY_TIMEOUT,
        Limited::new(body, MAX_BODY_SIZE).collect(),
    )
    .await
    {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(_)) => {
            return plain_response(StatusCode::BAD_REQUEST, "failed reading request body");
        }
        Err(_) => {
            return plain_response(
                StatusCode::REQUEST_TIMEOUT,
                "timed out reading request body",
            );
        }
    };

    let Some(handler) = router.route(&parts.method, parts.uri.path()) else {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    };

    let request_parts = RequestParts {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        peer,
        remote_addr: Some(remote_addr),
    };

    let wire = match tokio::time::timeout(HANDLER_TIMEOUT, handler(request_parts)).await {
        Ok(wire) => wire,
        Err(_) => {
            tracing::error!("request handler exceeded its deadline");
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "request deadline exceeded");
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(wire.body)));
    *response.status_mut() = wire.status_code;
    *response.headers_mut() = wire.headers;
    response
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

type RouteFuture = Pin<Box<dyn Future<Output = WireResponse> + Send>>;
type RouteHandler = Box<dyn Fn(RequestParts) -> RouteFuture + Send + Sync>;

/// Maps (method, path) pairs to their pipeline-wrapped handlers.
struct Router {
    routes: HashMap<(Method, String), RouteHandler>,
}

impl Router {
    fn new(api: Arc<Api>, db: Pool<Sqlite>, error_level: ErrorLevel) -> Router {
        let mut routes: HashMap<(Method, String), RouteHandler> = HashMap::new();

        // The /join endpoint speaks to unauthenticated peers: invite-token
        // authentication, and the response is encrypted with the exchanged
        // key and base58-armored. Error detail follows the configured level.
        let pipeline = Arc::new(
            Pipeline::<JoinRequest, JoinData>::new(error_level)
                .auth(InviteTokenAuth::new(db.clone()))
                .serializer(Json)
                .process_response(Encrypt)
                .process_response(EncodeBase58),
        );
        let join_api = api.clone();
        routes.insert(
            (Method::POST, "/api/v1/join".to_string()),
            Box::new(move |parts| {
                let api = join_api.clone();
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    pipeline
                        .run(parts, |req| async move { api.join(req).await })
                        .await
                })
            }),
        );

        // The privileged endpoints sit behind mTLS and always respond with
        // full error details.
        let pipeline = Arc::new(
            Pipeline::<OpenRequest, ()>::new(ErrorLevel::Full)
                .auth(MtlsAuth::new(db.clone()))
                .serializer(Json),
        );
        let open_api = api.clone();
        routes.insert(
            (Method::POST, "/api/v1/open".to_string()),
            Box::new(move |parts| {
                let api = open_api.clone();
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    pipeline
                        .run(parts, |req| async move { api.open(req).await })
                        .await
                })
            }),
        );

        let pipeline = Arc::new(
            Pipeline::<CloseRequest, ()>::new(ErrorLevel::Full)
                .auth(MtlsAuth::new(db))
                .serializer(Json),
        );
        routes.insert(
            (Method::POST, "/api/v1/close".to_string()),
            Box::new(move |parts| {
                let api = api.clone();
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    pipeline
                        .run(parts, |req| async move { api.close(req).await })
                        .await
                })
            }),
        );

        Router { routes }
    }

    fn route(&self, method: &Method, path: &str) -> Option<&RouteHandler> {
        self.routes.get(&(method.clone(), path.to_string()))
    }
}
