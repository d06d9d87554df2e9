// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::crypto::SymmetricCryptoSpec;

/// What a session-key request is aimed at.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "group")]
    TargetGroup,
    #[serde(rename = "pubTopic")]
    PublishTopic,
    #[serde(rename = "subTopic")]
    SubscribeTopic,
    #[serde(rename = "keyId")]
    SessionKeyId,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetGroup => f.write_str("group"),
            Self::PublishTopic => f.write_str("pubTopic"),
            Self::SubscribeTopic => f.write_str("subTopic"),
            Self::SessionKeyId => f.write_str("keyId"),
        }
    }
}

/// Server-side rule fixing the crypto spec, key size, validity, and owner
/// cap of session keys issued for a (group, target) pair.
#[derive(Clone, Debug)]
pub struct CommunicationPolicy {
    pub requester_group: String,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub crypto_spec: SymmetricCryptoSpec,
    pub key_bits: u32,
    pub abs_validity_ms: i64,
    pub rel_validity_ms: i64,
    pub max_num_owners: u32,
}

/// In-memory communication-policy table keyed by requesting group, target
/// kind, and target name.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<(String, TargetKind, String), CommunicationPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(&self, policy: CommunicationPolicy) {
        let key = (
            policy.requester_group.clone(),
            policy.target_kind,
            policy.target_name.clone(),
        );
        self.policies
            .write()
            .expect("policy table lock")
            .insert(key, policy);
    }

    /// Resolves the single policy for a request, if one exists.
    pub fn get_comm_policy(
        &self,
        requester_group: &str,
        target_kind: TargetKind,
        target_name: &str,
    ) -> Option<CommunicationPolicy> {
        self.policies
            .read()
            .expect("policy table lock")
            .get(&(
                requester_group.to_string(),
                target_kind,
                target_name.to_string(),
            ))
            .cloned()
    }
}
