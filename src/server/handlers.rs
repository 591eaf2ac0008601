// SPDX-License-Identifier: MIT

//! The API endpoint handlers and their wire types.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

use crate::{
    crypto::{self, TlsCredential},
    error::ApiError,
    firewall::{self, Manager},
    server::db::{ClientCertificate, DbError, Service, User},
    server::pipeline::{ApiRequest, BaseRequest, Envelope, RequestParts},
};

/// Serde support for byte fields carried as base64 strings in JSON.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde support for optional durations in friendly "1h" notation.
pub mod opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => {
                serializer.serialize_str(&humantime::format_duration(*value).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        value
            .map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The payload of a successful /join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinData {
    /// The DER-encoded CA certificate of the issuing node, used by the
    /// client to pin the server and verify its certificate.
    #[serde(with = "base64_bytes")]
    pub tls_ca_cert: Vec<u8>,
    /// The issued client credential: a PEM bundle holding the certificate
    /// chain and its private key. The CA is deliberately not part of the
    /// chain; it rides in `tls_ca_cert` instead.
    #[serde(with = "base64_bytes")]
    pub tls_client_cert: Vec<u8>,
}

/// The request payload to grant one or more clients access to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenParams {
    /// Client addresses: single IPs, CIDR blocks, or `start-end` ranges.
    pub clients: Vec<String>,
    pub service_name: String,
    /// How long access should last. Clamped to the service maximum;
    /// omitted or zero means the server's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration")]
    pub duration: Option<Duration>,
}

/// The request payload to deny one or more clients access to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseParams {
    /// Client addresses; an empty list closes the service for everyone.
    pub clients: Vec<String>,
    pub service_name: String,
}

#[derive(Default)]
pub struct JoinRequest {
    base: BaseRequest,
    site_id: Option<String>,
}

impl ApiRequest for JoinRequest {
    fn set_parts(&mut self, parts: RequestParts) {
        self.base.parts = parts;
    }

    fn parts(&self) -> &RequestParts {
        &self.base.parts
    }

    fn user(&self) -> Option<&User> {
        self.base.user.as_ref()
    }

    fn set_user(&mut self, user: User) {
        self.base.user = Some(user);
    }

    // The client's key material rides in the Authorization header; the body
    // carries nothing.
    fn decode(&mut self, _body: &[u8]) -> Result<(), serde_json::Error> {
        Ok(())
    }

    fn expects_body(&self) -> bool {
        false
    }

    fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    fn set_site_id(&mut self, site_id: String) {
        self.site_id = Some(site_id);
    }
}

#[derive(Default)]
pub struct OpenRequest {
    base: BaseRequest,
    pub data: OpenParams,
}

impl ApiRequest for OpenRequest {
    fn set_parts(&mut self, parts: RequestParts) {
        self.base.parts = parts;
    }

    fn parts(&self) -> &RequestParts {
        &self.base.parts
    }

    fn user(&self) -> Option<&User> {
        self.base.user.as_ref()
    }

    fn set_user(&mut self, user: User) {
        self.base.user = Some(user);
    }

    fn decode(&mut self, body: &[u8]) -> Result<(), serde_json::Error> {
        self.data = serde_json::from_slice(body)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.base.user.is_none() {
            return Err(ApiError::unauthorized(
                "user object not found in the request context",
            ));
        }
        if self.data.service_name.is_empty() {
            return Err(ApiError::bad_request("service_name must not be empty"));
        }
        if self.data.clients.is_empty() {
            return Err(ApiError::bad_request("clients must not be empty"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CloseRequest {
    base: BaseRequest,
    pub data: CloseParams,
}

impl ApiRequest for CloseRequest {
    fn set_parts(&mut self, parts: RequestParts) {
        self.base.parts = parts;
    }

    fn parts(&self) -> &RequestParts {
        &self.base.parts
    }

    fn user(&self) -> Option<&User> {
        self.base.user.as_ref()
    }

    fn set_user(&mut self, user: User) {
        self.base.user = Some(user);
    }

    fn decode(&mut self, body: &[u8]) -> Result<(), serde_json::Error> {
        self.data = serde_json::from_slice(body)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.base.user.is_none() {
            return Err(ApiError::unauthorized(
                "user object not found in the request context",
            ));
        }
        if self.data.service_name.is_empty() {
            return Err(ApiError::bad_request("service_name must not be empty"));
        }
        Ok(())
    }
}

/// The API endpoint handlers and the state they share.
pub(crate) struct Api {
    db: Pool<Sqlite>,
    firewall: Manager,
    credential: Arc<TlsCredential>,
    ca_der: Vec<u8>,
    ca_dns_name: String,
    client_cert_lifetime: Duration,
    renewal_token_window: Duration,
}

impl Api {
    pub(crate) fn new(
        db: Pool<Sqlite>,
        firewall: Manager,
        credential: Arc<TlsCredential>,
        client_cert_lifetime: Duration,
        renewal_token_window: Duration,
    ) -> anyhow::Result<Api> {
        let ca_der = credential.ca_der()?.to_vec();
        let ca_info = crypto::cert_info(credential.ca_der()?)?;
        let ca_dns_name = ca_info
            .dns_names
            .first()
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!("no Subject Alternative Name values found in the CA certificate")
            })?;

        Ok(Api {
            db,
            firewall,
            credential,
            ca_der,
            ca_dns_name,
            client_cert_lifetime,
            renewal_token_window,
        })
    }

    /// Issue a TLS client certificate for a remote node, giving it access to
    /// privileged operations such as changing firewall rules.
    ///
    /// The peer was authenticated with a valid invite token, and the
    /// response is encrypted with the shared key produced by that exchange;
    /// both are required because this handler is served over plain HTTP.
    pub(crate) async fn join(&self, req: JoinRequest) -> Result<Envelope<JoinData>, ApiError> {
        let user = req
            .user()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("user object not found in the request context"))?;
        let site_id = req
            .site_id()
            .ok_or_else(|| ApiError::internal("no site id attached to the request"))?
            .to_string();

        let now = Utc::now();
        let client_credential = crypto::new_tls_cert(
            &user.name,
            &[self.ca_dns_name.clone()],
            now,
            self.client_cert_lifetime,
            Some(self.credential.as_ref()),
        )
        .map_err(|error| ApiError::internal(format!("{error:#}")))?;

        let cert_info = client_credential
            .leaf_info()
            .map_err(|error| ApiError::internal(format!("{error:#}")))?;

        // Keep a record of the issued certificate.
        let mut record =
            ClientCertificate::new(user, site_id, self.renewal_token_window, &cert_info)
                .map_err(|error| ApiError::internal(format!("{error:#}")))?;
        let mut conn = self
            .db
            .acquire()
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;
        record
            .insert(&mut conn, now)
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;

        tracing::info!(
            user = record.user.name,
            serial = record.serial_number,
            site_id = record.site_id,
            "issued client certificate"
        );

        Ok(Envelope::ok(JoinData {
            tls_ca_cert: self.ca_der.clone(),
            tls_client_cert: crypto::serialize_tls_cert(&client_credential).into_bytes(),
        }))
    }

    /// Create firewall rules allowing the specified clients to access a
    /// service on this node.
    pub(crate) async fn open(&self, req: OpenRequest) -> Result<Envelope<()>, ApiError> {
        let ip_set = firewall::parse_ip_set(&req.data.clients)
            .map_err(|error| ApiError::bad_request(format!("{error:#}")))?;

        let service = self.load_service(&req.data.service_name).await?;

        self.firewall
            .grant_access(&ip_set, &service, req.data.duration.unwrap_or(Duration::ZERO))
            .await
            .map_err(|error| ApiError::internal(format!("{error:#}")))?;

        Ok(Envelope::default())
    }

    /// Create firewall rules blocking the specified clients from a service
    /// on this node. With no clients given, the service is closed for all.
    pub(crate) async fn close(&self, req: CloseRequest) -> Result<Envelope<()>, ApiError> {
        let ip_set = if req.data.clients.is_empty() {
            vec![firewall::all_ipv4(), firewall::all_ipv6()]
        } else {
            firewall::parse_ip_set(&req.data.clients)
                .map_err(|error| ApiError::bad_request(format!("{error:#}")))?
        };

        let service = self.load_service(&req.data.service_name).await?;
        let user = req
            .user()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("user object not found in the request context"))?;

        self.firewall
            .deny_access(&ip_set, &service, &user)
            .await
            .map_err(|error| ApiError::internal(format!("{error:#}")))?;

        Ok(Envelope::default())
    }

    async fn load_service(&self, name: &str) -> Result<Service, ApiError> {
        let mut conn = self
            .db
            .acquire()
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;
        Service::load(&mut conn, name)
            .await
            .map_err(|error| match error {
                DbError::NoResult { .. } => {
                    ApiError::bad_request(format!("unknown service '{name}'"))
                }
                error => ApiError::internal(error.to_string()),
            })
    }
}
