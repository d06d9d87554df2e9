// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{AuthCrypto, SymmetricCryptoSpec};
use crate::policy::CommunicationPolicy;
use crate::unix_time_ms;

/// Number of low bits of a session-key id holding the per-Auth counter;
/// the high 16 bits carry the minting Auth's numeric id.
const COUNTER_BITS: u32 = 48;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Builds a session-key id from the minting Auth's id and a counter.
pub fn encode_session_key_id(auth_id: u32, counter: u64) -> u64 {
    (u64::from(auth_id) << COUNTER_BITS) | (counter & COUNTER_MASK)
}

/// Recovers the minting Auth's id from a session-key id.
pub fn decode_auth_id(id: u64) -> u32 {
    (id >> COUNTER_BITS) as u32
}

/// Errors surfaced by the session-key store.
#[derive(Debug, Error)]
pub enum SessionKeyError {
    #[error("no session key with id {0}")]
    NotFound(u64),
    #[error("session key {id} already has its maximum of {max} owners")]
    OwnerLimit { id: u64, max: u32 },
}

/// A symmetric key issued to one or more entities for peer communication.
#[derive(Clone, Debug)]
pub struct SessionKey {
    pub id: u64,
    pub owners: BTreeSet<String>,
    pub key: Zeroizing<Vec<u8>>,
    pub crypto_spec: SymmetricCryptoSpec,
    pub abs_validity_ms: i64,
    pub rel_validity_ms: i64,
    pub max_owners: u32,
}

/// Mints and records session keys for the local Auth.
///
/// Generation and ownership updates share one lock so ids are unique and
/// owner-set mutations are atomic.
#[derive(Debug)]
pub struct SessionKeyStore {
    auth_id: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_counter: u64,
    keys: HashMap<u64, SessionKey>,
}

impl SessionKeyStore {
    pub fn new(auth_id: u32) -> Self {
        Self {
            auth_id,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn auth_id(&self) -> u32 {
        self.auth_id
    }

    /// Mints fresh session keys for `owner` under `policy`.
    ///
    /// The returned count is `requested` capped by the policy's owner limit
    /// and the entity's per-request maximum; the cap is applied silently.
    pub fn generate(
        &self,
        owner: &str,
        requested: u32,
        policy: &CommunicationPolicy,
        entity_max: u32,
    ) -> Vec<SessionKey> {
        let count = requested.min(policy.max_num_owners).min(entity_max);
        let now = unix_time_ms();
        let mut inner = self.inner.lock().expect("session key lock");
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = encode_session_key_id(self.auth_id, inner.next_counter);
            inner.next_counter += 1;
            let key = SessionKey {
                id,
                owners: BTreeSet::from([owner.to_string()]),
                key: AuthCrypto::random_bytes((policy.key_bits / 8) as usize),
                crypto_spec: policy.crypto_spec,
                abs_validity_ms: now + policy.abs_validity_ms,
                rel_validity_ms: policy.rel_validity_ms,
                max_owners: policy.max_num_owners,
            };
            inner.keys.insert(id, key.clone());
            out.push(key);
        }
        out
    }

    /// Looks up a locally minted key. Ids minted by other Auths are never
    /// present here.
    pub fn get_by_id(&self, id: u64) -> Option<SessionKey> {
        self.inner
            .lock()
            .expect("session key lock")
            .keys
            .get(&id)
            .cloned()
    }

    /// Adds `name` to the key's owner set. Re-adding an existing owner is a
    /// no-op; growing past the key's owner cap is refused.
    pub fn add_owner(&self, id: u64, name: &str) -> Result<(), SessionKeyError> {
        let mut inner = self.inner.lock().expect("session key lock");
        let key = inner
            .keys
            .get_mut(&id)
            .ok_or(SessionKeyError::NotFound(id))?;
        if key.owners.contains(name) {
            return Ok(());
        }
        if key.owners.len() as u32 >= key.max_owners {
            return Err(SessionKeyError::OwnerLimit {
                id,
                max: key.max_owners,
            });
        }
        key.owners.insert(name.to_string());
        Ok(())
    }
}
