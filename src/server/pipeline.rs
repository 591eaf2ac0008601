// SPDX-License-Identifier: MIT

//! The composable request pipeline behind every HTTP endpoint.
//!
//! A [`Pipeline`] describes the lifecycle of one endpoint: an optional
//! authenticator, an optional serializer, request processors, the handler,
//! and response processors, with a uniform error funnel across all stages.
//! Pipelines are immutable after construction and shared across requests;
//! per-request values travel in the [`RequestContext`].
//!
//! The stages run in a fixed order:
//!
//! 1. authentication
//! 2. request deserialization
//! 3. request validation
//! 4. request processors
//! 5. the endpoint handler
//! 6. response serialization
//! 7. response processors
//! 8. response write-out
//!
//! The first error skips the remaining request-side stages, but the
//! response-side stages still run so the error is serialized with whatever
//! processors the endpoint declared.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use serde::Serialize;
use zeroize::Zeroizing;

use crate::{
    crypto::{self, KEY_SIZE},
    error::{sanitize_error, ApiError, ErrorLevel},
    server::db::User,
};

/// Maximum accepted request body size.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// The TLS identity of the peer, verified during the handshake and lifted
/// into the request so authenticators can act on it.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// The Subject Common Name of the verified leaf certificate.
    pub common_name: String,
}

/// The pieces of the underlying HTTP request the pipeline operates on.
#[derive(Debug, Default)]
pub struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Present only when the request arrived over TLS with a verified client
    /// certificate.
    pub peer: Option<PeerIdentity>,
    pub remote_addr: Option<SocketAddr>,
}

/// Per-request values passed between pipeline stages: the shared key
/// deposited during invite authentication, and the serialized response body
/// as the response processors transform it.
#[derive(Default)]
pub struct RequestContext {
    shared_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    response_data: Vec<u8>,
}

impl RequestContext {
    pub fn shared_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.shared_key.as_deref()
    }

    pub fn set_shared_key(&mut self, key: Zeroizing<[u8; KEY_SIZE]>) {
        self.shared_key = Some(key);
    }

    pub fn response_data(&self) -> &[u8] {
        &self.response_data
    }

    pub fn set_response_data(&mut self, data: Vec<u8>) {
        self.response_data = data;
    }
}

/// An endpoint's request envelope: the underlying HTTP request plus the
/// authenticated user, with a hook for decoding the typed body.
pub trait ApiRequest: Default + Send + 'static {
    fn set_parts(&mut self, parts: RequestParts);
    fn parts(&self) -> &RequestParts;

    fn user(&self) -> Option<&User>;
    fn set_user(&mut self, user: User);

    /// Decode the request body into the typed payload. Endpoints that ignore
    /// the body implement this as a no-op.
    fn decode(&mut self, body: &[u8]) -> Result<(), serde_json::Error>;

    /// Whether this endpoint carries its payload in the request body.
    /// Endpoints whose inputs ride elsewhere (e.g. in headers) opt out, and
    /// the serializer leaves their body untouched.
    fn expects_body(&self) -> bool {
        true
    }

    /// Check the decoded payload. Runs after authentication and
    /// deserialization.
    fn validate(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// The site id deposited by an authenticator, for endpoints that bind
    /// issued credentials to a site. Ignored by default.
    fn site_id(&self) -> Option<&str> {
        None
    }

    fn set_site_id(&mut self, _site_id: String) {}
}

/// Common state for request envelopes; endpoint request types embed this and
/// delegate the [`ApiRequest`] plumbing to it.
#[derive(Debug, Default)]
pub struct BaseRequest {
    pub parts: RequestParts,
    pub user: Option<User>,
}

/// The response envelope written for every request: a status code, an
/// optional typed error, response headers, and the typed payload.
#[derive(Debug)]
pub struct Envelope<T> {
    pub status_code: StatusCode,
    pub error: Option<ApiError>,
    pub headers: HeaderMap,
    pub data: Option<T>,
}

impl<T> Default for Envelope<T> {
    fn default() -> Self {
        Self {
            status_code: StatusCode::OK,
            error: None,
            headers: HeaderMap::new(),
            data: None,
        }
    }
}

impl<T> Envelope<T> {
    /// A 200 response carrying a payload.
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    fn record_error(&mut self, error: ApiError, level: ErrorLevel) {
        let mut status_code = error.status_code;
        let sanitized = sanitize_error(error, level);
        if let Some(sanitized) = &sanitized {
            status_code = sanitized.status_code;
        }
        self.status_code = status_code;
        self.error = sanitized;
    }
}

impl<T: Serialize> Serialize for Envelope<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let len = 2 + usize::from(self.error.is_some()) + usize::from(self.data.is_some());
        let mut state = serializer.serialize_struct("Response", len)?;
        state.serialize_field("status_code", &self.status_code.as_u16())?;
        state.serialize_field("status", self.status_code.canonical_reason().unwrap_or(""))?;
        if let Some(error) = &self.error {
            state.serialize_field("error", error)?;
        }
        if let Some(data) = &self.data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

/// Validates a request, attaching the authenticated [`User`] on success and
/// optionally depositing values in the request context.
#[async_trait]
pub trait Authenticator<Req: ApiRequest>: Send + Sync {
    async fn authenticate(&self, cx: &mut RequestContext, req: &mut Req)
        -> Result<(), ApiError>;
}

/// Processes an incoming request after authentication and deserialization.
#[async_trait]
pub trait RequestProcessor<Req: ApiRequest>: Send + Sync {
    async fn process(&self, cx: &mut RequestContext, req: &mut Req) -> Result<(), ApiError>;
}

/// Transforms the serialized response body in the request context, and may
/// adjust response headers.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(
        &self,
        cx: &mut RequestContext,
        headers: &mut HeaderMap,
    ) -> Result<(), ApiError>;
}

/// Deserializes the raw request body into the typed request, and serializes
/// the typed response into raw response data.
#[async_trait]
pub trait Serializer<Req: ApiRequest, T: Serialize + Send + 'static>: Send + Sync {
    async fn deserialize(&self, cx: &mut RequestContext, req: &mut Req)
        -> Result<(), ApiError>;
    async fn serialize(
        &self,
        cx: &mut RequestContext,
        resp: &mut Envelope<T>,
    ) -> Result<(), ApiError>;
}

/// JSON request and response serialization.
pub struct Json;

#[async_trait]
impl<Req: ApiRequest, T: Serialize + Send + 'static> Serializer<Req, T> for Json {
    async fn deserialize(
        &self,
        _cx: &mut RequestContext,
        req: &mut Req,
    ) -> Result<(), ApiError> {
        if !req.expects_body() {
            return Ok(());
        }
        let body = req.parts().body.clone();
        if body.is_empty() {
            return Err(ApiError::bad_request("empty request body"));
        }
        if body.len() > MAX_BODY_SIZE {
            return Err(ApiError::bad_request("request body exceeds 1 MiB"));
        }
        req.decode(&body).map_err(|error| {
            ApiError::bad_request(format!("failed decoding request body into JSON: {error}"))
        })
    }

    async fn serialize(
        &self,
        cx: &mut RequestContext,
        resp: &mut Envelope<T>,
    ) -> Result<(), ApiError> {
        let data = serde_json::to_vec(resp).map_err(|error| {
            ApiError::internal(format!("failed marshalling response into JSON: {error}"))
        })?;
        cx.set_response_data(data);
        resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(())
    }
}

/// Encrypts the response data with the shared key deposited during invite
/// authentication. A no-op when no shared key is present.
pub struct Encrypt;

#[async_trait]
impl ResponseProcessor for Encrypt {
    async fn process(
        &self,
        cx: &mut RequestContext,
        headers: &mut HeaderMap,
    ) -> Result<(), ApiError> {
        let Some(key) = cx.shared_key() else {
            return Ok(());
        };
        let encrypted = crypto::encrypt_sym(cx.response_data(), key).map_err(|error| {
            ApiError::internal(format!("failed encrypting response: {error:#}"))
        })?;
        cx.set_response_data(encrypted);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        Ok(())
    }
}

/// Base58-encodes the response data.
pub struct EncodeBase58;

#[async_trait]
impl ResponseProcessor for EncodeBase58 {
    async fn process(
        &self,
        cx: &mut RequestContext,
        headers: &mut HeaderMap,
    ) -> Result<(), ApiError> {
        let encoded = bs58::encode(cx.response_data()).into_string();
        cx.set_response_data(encoded.into_bytes());
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        Ok(())
    }
}

/// The response in wire form, ready to hand to the HTTP layer.
#[derive(Debug)]
pub struct WireResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// The processing stages for one endpoint's requests and responses.
pub struct Pipeline<Req, T> {
    auth: Option<Box<dyn Authenticator<Req>>>,
    serializer: Option<Box<dyn Serializer<Req, T>>>,
    request_processors: Vec<Box<dyn RequestProcessor<Req>>>,
    response_processors: Vec<Box<dyn ResponseProcessor>>,
    error_level: ErrorLevel,
}

impl<Req, T> Pipeline<Req, T>
where
    Req: ApiRequest,
    T: Serialize + Send + 'static,
{
    pub fn new(error_level: ErrorLevel) -> Self {
        Self {
            auth: None,
            serializer: None,
            request_processors: vec![],
            response_processors: vec![],
            error_level,
        }
    }

    /// Set the authenticator for this pipeline.
    pub fn auth(mut self, auth: impl Authenticator<Req> + 'static) -> Self {
        self.auth = Some(Box::new(auth));
        self
    }

    /// Set the serializer for this pipeline.
    pub fn serializer(mut self, serializer: impl Serializer<Req, T> + 'static) -> Self {
        self.serializer = Some(Box::new(serializer));
        self
    }

    /// Append a request processor.
    pub fn process_request(mut self, processor: impl RequestProcessor<Req> + 'static) -> Self {
        self.request_processors.push(Box::new(processor));
        self
    }

    /// Append a response processor.
    pub fn process_response(mut self, processor: impl ResponseProcessor + 'static) -> Self {
        self.response_processors.push(Box::new(processor));
        self
    }

    /// Run one request through the pipeline. Exactly one response is
    /// produced, no matter which stage fails.
    pub async fn run<F, Fut>(&self, parts: RequestParts, handler: F) -> WireResponse
    where
        F: FnOnce(Req) -> Fut,
        Fut: std::future::Future<Output = Result<Envelope<T>, ApiError>>,
    {
        let mut cx = RequestContext::default();
        let mut req = Req::default();
        req.set_parts(parts);
        let mut resp = Envelope::<T>::default();
        let mut failed = false;

        // Request-side stages. The first error is recorded on the response
        // and the remaining request stages are skipped.
        if let Some(auth) = &self.auth {
            if let Err(error) = auth.authenticate(&mut cx, &mut req).await {
                resp.record_error(error, self.error_level);
                failed = true;
            }
        }

        if !failed {
            if let Some(serializer) = &self.serializer {
                if let Err(error) = serializer.deserialize(&mut cx, &mut req).await {
                    resp.record_error(error, self.error_level);
                    failed = true;
                }
            }
        }

        if !failed {
            if let Err(error) = req.validate() {
                resp.record_error(error, self.error_level);
                failed = true;
            }
        }

        if !failed {
            for processor in &self.request_processors {
                if let Err(error) = processor.process(&mut cx, &mut req).await {
                    resp.record_error(error, self.error_level);
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            match handler(req).await {
                Ok(handler_resp) => resp = handler_resp,
                Err(error) => resp.record_error(error, self.error_level),
            }
        }

        // Response-side stages always run so errors are serialized using the
        // same processors as successful responses. Errors here are recorded
        // but never re-enter the pipeline.
        if let Some(serializer) = &self.serializer {
            if let Err(error) = serializer.serialize(&mut cx, &mut resp).await {
                tracing::error!(%error, "failed serializing response");
                resp.record_error(error, self.error_level);
            }
        }

        for processor in &self.response_processors {
            if let Err(error) = processor.process(&mut cx, &mut resp.headers).await {
                tracing::error!(%error, "response processor failed");
                resp.record_error(error, self.error_level);
                break;
            }
        }

        // Respond with at least some kind of useful body, even if response
        // serialization went sideways.
        let mut body = std::mem::take(&mut cx.response_data);
        if body.is_empty() {
            if let Some(error) = &resp.error {
                body = error.message.clone().into_bytes();
            }
        }

        let mut headers = resp.headers;
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }

        WireResponse {
            status_code: resp.status_code,
            headers,
            body,
        }
    }
}
