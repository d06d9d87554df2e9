// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rsa::RsaPublicKey;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::SymmetricCryptoSpec;
use crate::wire::{self, Reader, WireError};

/// Errors surfaced by registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no registered entity named {0:?}")]
    UnknownEntity(String),
    #[error("entity {0:?} uses a permanent distribution key")]
    PermanentDistKey(String),
}

/// A per-entity symmetric key protecting session-key responses.
///
/// Minted on the public-key handshake path with lifetime
/// `now + entity.dist_key_validity`, or provisioned permanently.
#[derive(Clone, Debug)]
pub struct DistributionKey {
    key: Zeroizing<Vec<u8>>,
    expires_at_ms: i64,
}

impl DistributionKey {
    pub fn new(key: Zeroizing<Vec<u8>>, expires_at_ms: i64) -> Self {
        Self { key, expires_at_ms }
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// Wire form carried inside the RSA-encrypted block of a response:
    /// `expires_at_ms: i64 | varint(len) | key bytes`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 1 + self.key.len());
        out.extend_from_slice(&self.expires_at_ms.to_be_bytes());
        wire::put_varint(&mut out, self.key.len());
        out.extend_from_slice(&self.key);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let expires_at_ms = reader.read_i64()?;
        let len = reader.read_varint()?;
        let key = Zeroizing::new(reader.read_bytes(len)?.to_vec());
        Ok(Self { key, expires_at_ms })
    }
}

/// A peer Auth trusted for federated session-key retrieval.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustedAuth {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

/// A registered entity as seen by connection handlers.
///
/// Immutable except for the distribution-key cell, which the public-key
/// request path replaces and the distribution-key path reads.
#[derive(Debug)]
pub struct RegisteredEntity {
    name: String,
    group: String,
    public_key: Option<RsaPublicKey>,
    dist_crypto_spec: SymmetricCryptoSpec,
    dist_key_validity_ms: i64,
    max_session_keys_per_request: u32,
    use_permanent_dist_key: bool,
    active: bool,
    dist_key: Mutex<Option<DistributionKey>>,
}

impl RegisteredEntity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        group: String,
        public_key: Option<RsaPublicKey>,
        dist_crypto_spec: SymmetricCryptoSpec,
        dist_key_validity_ms: i64,
        max_session_keys_per_request: u32,
        use_permanent_dist_key: bool,
        active: bool,
        dist_key: Option<DistributionKey>,
    ) -> Self {
        Self {
            name,
            group,
            public_key,
            dist_crypto_spec,
            dist_key_validity_ms,
            max_session_keys_per_request,
            use_permanent_dist_key,
            active,
            dist_key: Mutex::new(dist_key),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.as_ref()
    }

    pub fn dist_crypto_spec(&self) -> SymmetricCryptoSpec {
        self.dist_crypto_spec
    }

    pub fn dist_key_validity_ms(&self) -> i64 {
        self.dist_key_validity_ms
    }

    pub fn max_session_keys_per_request(&self) -> u32 {
        self.max_session_keys_per_request
    }

    pub fn use_permanent_dist_key(&self) -> bool {
        self.use_permanent_dist_key
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Snapshot of the current distribution key, if any.
    pub fn distribution_key(&self) -> Option<DistributionKey> {
        self.dist_key.lock().expect("dist key lock").clone()
    }

    fn install_distribution_key(&self, key: DistributionKey) {
        *self.dist_key.lock().expect("dist key lock") = Some(key);
    }
}

/// Read-mostly view of registered entities and trusted peer Auths.
///
/// Loaders publish whole entries; handlers only ever mutate the
/// per-entity distribution-key cell.
#[derive(Debug, Default)]
pub struct Registry {
    entities: RwLock<HashMap<String, Arc<RegisteredEntity>>>,
    trusted_auths: RwLock<HashMap<u32, TrustedAuth>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entity(&self, entity: RegisteredEntity) {
        self.entities
            .write()
            .expect("entity table lock")
            .insert(entity.name.clone(), Arc::new(entity));
    }

    pub fn insert_trusted_auth(&self, auth: TrustedAuth) {
        self.trusted_auths
            .write()
            .expect("trusted auth table lock")
            .insert(auth.id, auth);
    }

    pub fn get_entity(&self, name: &str) -> Option<Arc<RegisteredEntity>> {
        self.entities
            .read()
            .expect("entity table lock")
            .get(name)
            .cloned()
    }

    pub fn get_peer_auth(&self, id: u32) -> Option<TrustedAuth> {
        self.trusted_auths
            .read()
            .expect("trusted auth table lock")
            .get(&id)
            .cloned()
    }

    /// Atomically replaces an entity's distribution key. Permanent keys are
    /// never rotated.
    pub fn update_distribution_key(
        &self,
        name: &str,
        key: DistributionKey,
    ) -> Result<(), RegistryError> {
        let entity = self
            .get_entity(name)
            .ok_or_else(|| RegistryError::UnknownEntity(name.to_string()))?;
        if entity.use_permanent_dist_key {
            return Err(RegistryError::PermanentDistKey(name.to_string()));
        }
        entity.install_distribution_key(key);
        Ok(())
    }
}
