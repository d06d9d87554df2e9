// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{AuthCrypto, SymmetricCryptoSpec};
use crate::federation::{FederationError, HttpsPeerAuthClient};
use crate::policy::{CommunicationPolicy, PolicyStore, TargetKind};
use crate::registry::{DistributionKey, RegisteredEntity, Registry, TrustedAuth};
use crate::server::AuthContext;
use crate::sessionkey::SessionKeyStore;

/// Errors raised while loading or assembling the Auth configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to load RSA key from {path}: {message}")]
    Key { path: PathBuf, message: String },
    #[error("invalid crypto spec for {name:?}: {message}")]
    Spec { name: String, message: String },
    #[error("entity {0:?} declares a permanent distribution key but provides none")]
    MissingPermanentKey(String),
    #[error("permanent distribution key for {0:?} is not valid hex")]
    BadPermanentKey(String),
    #[error("failed to build federation client: {0}")]
    Federation(#[from] FederationError),
    #[error("failed to load TLS material from {path}: {message}")]
    Tls { path: PathBuf, message: String },
}

/// On-disk configuration of a single Auth instance.
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub auth_id: u32,
    pub listen_addr: String,
    pub entity_timeout_ms: u64,
    pub private_key_path: PathBuf,
    pub federation: FederationConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub trusted_auths: Vec<TrustedAuthConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FederationConfig {
    pub timeout_ms: u64,
    /// PKCS#12 bundle authenticating this Auth toward its peers.
    pub identity_path: Option<PathBuf>,
    pub identity_password: Option<String>,
    /// CA certificate (PEM) pinning the peer deployment.
    pub ca_cert_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    pub group: String,
    /// SubjectPublicKeyInfo PEM; absent for permanent-key entities.
    pub public_key_path: Option<PathBuf>,
    pub dist_crypto_spec: String,
    pub dist_key_validity_ms: i64,
    pub max_session_keys_per_request: u32,
    #[serde(default)]
    pub use_permanent_dist_key: bool,
    /// Hex-encoded provisioned key; required iff `use_permanent_dist_key`.
    pub permanent_dist_key_hex: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct PolicyConfig {
    pub requester_group: String,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub crypto_spec: String,
    pub key_bits: u32,
    pub abs_validity_ms: i64,
    pub rel_validity_ms: i64,
    pub max_num_owners: u32,
}

#[derive(Debug, Deserialize)]
pub struct TrustedAuthConfig {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

fn default_active() -> bool {
    true
}

impl AuthConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Loads key material and assembles the full server context.
    pub fn build_context(&self) -> Result<AuthContext, ConfigError> {
        let private_key = RsaPrivateKey::read_pkcs8_pem_file(&self.private_key_path)
            .map_err(|error| ConfigError::Key {
                path: self.private_key_path.clone(),
                message: error.to_string(),
            })?;

        let registry = Registry::new();
        for entity in &self.entities {
            registry.insert_entity(entity.build()?);
        }
        for auth in &self.trusted_auths {
            registry.insert_trusted_auth(TrustedAuth {
                id: auth.id,
                host: auth.host.clone(),
                port: auth.port,
            });
        }

        let policies = PolicyStore::new();
        for policy in &self.policies {
            policies.add_policy(policy.build()?);
        }

        Ok(AuthContext {
            auth_id: self.auth_id,
            crypto: AuthCrypto::new(private_key),
            registry,
            policies,
            session_keys: SessionKeyStore::new(self.auth_id),
            peer_client: Arc::new(self.federation.build()?),
            entity_timeout: Duration::from_millis(self.entity_timeout_ms),
        })
    }
}

impl EntityConfig {
    fn build(&self) -> Result<RegisteredEntity, ConfigError> {
        let dist_crypto_spec: SymmetricCryptoSpec =
            self.dist_crypto_spec
                .parse()
                .map_err(|error: crate::crypto::CryptoError| ConfigError::Spec {
                    name: self.name.clone(),
                    message: error.to_string(),
                })?;

        let public_key: Option<RsaPublicKey> = match &self.public_key_path {
            Some(path) => Some(RsaPublicKey::read_public_key_pem_file(path).map_err(
                |error| ConfigError::Key {
                    path: path.clone(),
                    message: error.to_string(),
                },
            )?),
            None => None,
        };

        let dist_key = if self.use_permanent_dist_key {
            let hex_key = self
                .permanent_dist_key_hex
                .as_ref()
                .ok_or_else(|| ConfigError::MissingPermanentKey(self.name.clone()))?;
            let bytes = hex::decode(hex_key)
                .map_err(|_| ConfigError::BadPermanentKey(self.name.clone()))?;
            Some(DistributionKey::new(Zeroizing::new(bytes), i64::MAX))
        } else {
            None
        };

        Ok(RegisteredEntity::new(
            self.name.clone(),
            self.group.clone(),
            public_key,
            dist_crypto_spec,
            self.dist_key_validity_ms,
            self.max_session_keys_per_request,
            self.use_permanent_dist_key,
            self.active,
            dist_key,
        ))
    }
}

impl PolicyConfig {
    fn build(&self) -> Result<CommunicationPolicy, ConfigError> {
        let crypto_spec: SymmetricCryptoSpec =
            self.crypto_spec
                .parse()
                .map_err(|error: crate::crypto::CryptoError| ConfigError::Spec {
                    name: format!("{}/{}", self.requester_group, self.target_name),
                    message: error.to_string(),
                })?;
        Ok(CommunicationPolicy {
            requester_group: self.requester_group.clone(),
            target_kind: self.target_kind,
            target_name: self.target_name.clone(),
            crypto_spec,
            key_bits: self.key_bits,
            abs_validity_ms: self.abs_validity_ms,
            rel_validity_ms: self.rel_validity_ms,
            max_num_owners: self.max_num_owners,
        })
    }
}

impl FederationConfig {
    fn build(&self) -> Result<HttpsPeerAuthClient, ConfigError> {
        let identity = match &self.identity_path {
            Some(path) => {
                let der = fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let password = self.identity_password.as_deref().unwrap_or("");
                Some(
                    reqwest::Identity::from_pkcs12_der(&der, password).map_err(|error| {
                        ConfigError::Tls {
                            path: path.clone(),
                            message: error.to_string(),
                        }
                    })?,
                )
            }
            None => None,
        };
        let root_cert = match &self.ca_cert_path {
            Some(path) => {
                let pem = fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Some(
                    reqwest::Certificate::from_pem(&pem).map_err(|error| ConfigError::Tls {
                        path: path.clone(),
                        message: error.to_string(),
                    })?,
                )
            }
            None => None,
        };
        Ok(HttpsPeerAuthClient::new(
            Duration::from_millis(self.timeout_ms),
            identity,
            root_cert,
        )?)
    }
}
