// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, SymmetricCryptoSpec};
use crate::registry::TrustedAuth;
use crate::sessionkey::SessionKey;

/// Form fields peer Auths currently expect on every session-key request.
const PEER_FORM_FIELDS: &[(&str, &str)] = &[("Name", "Robert"), ("Age", "32")];

/// Errors raised while fetching a session key from a peer Auth.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("failed to build HTTPS client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request to peer Auth failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer Auth returned status {status}")]
    Status { status: StatusCode },
    #[error("peer Auth returned an invalid session key: {0}")]
    BadKey(#[from] CryptoError),
    #[error("peer Auth key value is not valid base64: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
}

/// JSON body of the Auth-to-Auth session-key request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthSessionKeyReq {
    #[serde(rename = "SessionKeyID")]
    pub session_key_id: u64,
    #[serde(rename = "RequestingEntityName")]
    pub requesting_entity_name: String,
    #[serde(rename = "RequestingEntityGroup")]
    pub requesting_entity_group: String,
}

/// JSON body of the Auth-to-Auth session-key response, carrying one key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthSessionKeyResp {
    pub id: u64,
    pub owner: String,
    #[serde(rename = "maxOwners")]
    pub max_owners: u32,
    #[serde(rename = "cryptoSpec")]
    pub crypto_spec: String,
    #[serde(rename = "expirationTime")]
    pub expiration_time: i64,
    #[serde(rename = "relValidityPeriod")]
    pub rel_validity_period: i64,
    #[serde(rename = "keyVal")]
    pub key_val: String,
}

impl AuthSessionKeyResp {
    /// Converts the JSON form into a session key plus its crypto spec. The
    /// owner field carries a comma-separated list of entity names.
    pub fn into_session_key(self) -> Result<(SessionKey, SymmetricCryptoSpec), FederationError> {
        let crypto_spec: SymmetricCryptoSpec = self.crypto_spec.parse()?;
        let key = Zeroizing::new(BASE64.decode(self.key_val.as_bytes())?);
        let owners: BTreeSet<String> = self
            .owner
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        let session_key = SessionKey {
            id: self.id,
            owners,
            key,
            crypto_spec,
            abs_validity_ms: self.expiration_time,
            rel_validity_ms: self.rel_validity_period,
            max_owners: self.max_owners,
        };
        Ok((session_key, crypto_spec))
    }
}

/// Client capable of retrieving a session key from a trusted peer Auth.
#[async_trait]
pub trait PeerAuthClient: Send + Sync {
    async fn fetch_session_key(
        &self,
        peer: &TrustedAuth,
        request: &AuthSessionKeyReq,
    ) -> Result<AuthSessionKeyResp, FederationError>;
}

/// Mutually authenticated HTTPS implementation of [`PeerAuthClient`].
pub struct HttpsPeerAuthClient {
    client: Client,
    timeout: Duration,
}

impl HttpsPeerAuthClient {
    /// Builds the client. `identity` is this Auth's TLS client certificate
    /// bundle; `root_cert` optionally pins the peer deployment's CA.
    pub fn new(
        timeout: Duration,
        identity: Option<Identity>,
        root_cert: Option<Certificate>,
    ) -> Result<Self, FederationError> {
        let mut builder = Client::builder().user_agent("prahari-auth/0.1");
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        if let Some(cert) = root_cert {
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(FederationError::ClientBuild)?;
        Ok(Self { client, timeout })
    }

    fn endpoint(peer: &TrustedAuth) -> String {
        format!("https://{}:{}/", peer.host, peer.port)
    }
}

#[async_trait]
impl PeerAuthClient for HttpsPeerAuthClient {
    async fn fetch_session_key(
        &self,
        peer: &TrustedAuth,
        request: &AuthSessionKeyReq,
    ) -> Result<AuthSessionKeyResp, FederationError> {
        let url = Self::endpoint(peer);
        info!(peer_auth = peer.id, %url, session_key_id = request.session_key_id,
            "requesting session key from peer Auth");
        let response = self
            .client
            .post(&url)
            .query(&PEER_FORM_FIELDS)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::Status { status });
        }
        let body: AuthSessionKeyResp = response.json().await?;
        debug!(session_key_id = body.id, "received session key from peer Auth");
        Ok(body)
    }
}
