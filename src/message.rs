// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use rsa::RsaPublicKey;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{
    self, AuthCrypto, CryptoError, SymmetricCryptoSpec, RSA_BLOCK_SIZE,
};
use crate::policy::TargetKind;
use crate::registry::DistributionKey;
use crate::sessionkey::SessionKey;
use crate::wire::{self, MessageType, Reader, WireError};

/// Size of the random nonce issued by the Auth on accept.
pub const AUTH_NONCE_SIZE: usize = 8;
/// Size of the random nonce chosen by the entity per request.
pub const ENTITY_NONCE_SIZE: usize = 8;
/// Size of the RSA-encrypted-and-signed distribution-key block inside a
/// response payload: ciphertext plus signature.
pub const DIST_KEY_BLOCK_SIZE: usize = 2 * RSA_BLOCK_SIZE;

/// Errors from typed-message encoding, decoding, sealing, and opening.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("purpose is not valid JSON: {0}")]
    PurposeJson(#[from] serde_json::Error),
    #[error("purpose must name exactly one target")]
    AmbiguousPurpose,
    #[error("negative session key count {0}")]
    NegativeKeyCount(i32),
    #[error("payload too short to carry an RSA signature")]
    MissingSignature,
    #[error("payload authentication tag mismatch")]
    TagMismatch,
    #[error("unknown alert code {0}")]
    UnknownAlertCode(u8),
    #[error("trailing bytes after message payload")]
    TrailingBytes,
}

/// Greeting sent by the Auth immediately after accepting a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthHello {
    pub auth_id: u32,
    pub nonce: [u8; AUTH_NONCE_SIZE],
}

impl AuthHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + AUTH_NONCE_SIZE);
        payload.extend_from_slice(&self.auth_id.to_be_bytes());
        payload.extend_from_slice(&self.nonce);
        wire::encode_envelope(MessageType::AuthHello, &payload)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(payload);
        let auth_id = reader.read_u32()?;
        let nonce = read_nonce(&mut reader)?;
        expect_consumed(&reader)?;
        Ok(Self { auth_id, nonce })
    }
}

/// Alert codes an Auth can send before closing a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AlertCode {
    InvalidDistributionKey = 0,
    InvalidSessionKeyReqTarget = 1,
}

impl AlertCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::InvalidDistributionKey),
            1 => Some(Self::InvalidSessionKeyReqTarget),
            _ => None,
        }
    }
}

/// Terminal notice to the entity; no response ever follows an alert.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthAlert {
    pub code: AlertCode,
}

impl AuthAlert {
    pub fn encode(&self) -> Vec<u8> {
        wire::encode_envelope(MessageType::AuthAlert, &[self.code as u8])
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(payload);
        let byte = reader.read_u8()?;
        expect_consumed(&reader)?;
        let code = AlertCode::from_byte(byte).ok_or(MessageError::UnknownAlertCode(byte))?;
        Ok(Self { code })
    }
}

/// What the entity wants session keys for. Carried as a small JSON object
/// with exactly one discriminator field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionKeyPurpose {
    Group(String),
    PubTopic(String),
    SubTopic(String),
    KeyId(u64),
}

#[derive(Deserialize)]
struct RawPurpose {
    group: Option<String>,
    #[serde(rename = "pubTopic")]
    pub_topic: Option<String>,
    #[serde(rename = "subTopic")]
    sub_topic: Option<String>,
    #[serde(rename = "keyId")]
    key_id: Option<u64>,
}

impl SessionKeyPurpose {
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let raw: RawPurpose = serde_json::from_str(text)?;
        let mut found = Vec::with_capacity(1);
        if let Some(name) = raw.group {
            found.push(Self::Group(name));
        }
        if let Some(name) = raw.pub_topic {
            found.push(Self::PubTopic(name));
        }
        if let Some(name) = raw.sub_topic {
            found.push(Self::SubTopic(name));
        }
        if let Some(id) = raw.key_id {
            found.push(Self::KeyId(id));
        }
        if found.len() != 1 {
            return Err(MessageError::AmbiguousPurpose);
        }
        Ok(found.remove(0))
    }

    pub fn to_json(&self) -> String {
        match self {
            Self::Group(name) => json!({ "group": name }).to_string(),
            Self::PubTopic(name) => json!({ "pubTopic": name }).to_string(),
            Self::SubTopic(name) => json!({ "subTopic": name }).to_string(),
            Self::KeyId(id) => json!({ "keyId": id }).to_string(),
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        match self {
            Self::Group(_) => TargetKind::TargetGroup,
            Self::PubTopic(_) => TargetKind::PublishTopic,
            Self::SubTopic(_) => TargetKind::SubscribeTopic,
            Self::KeyId(_) => TargetKind::SessionKeyId,
        }
    }
}

/// A session-key request as seen after envelope decryption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionKeyReq {
    pub entity_name: String,
    pub auth_nonce: [u8; AUTH_NONCE_SIZE],
    pub entity_nonce: [u8; ENTITY_NONCE_SIZE],
    pub num_keys: u32,
    pub purpose: SessionKeyPurpose,
}

impl SessionKeyReq {
    /// Plaintext layout: `BufferedString(entity_name) | auth_nonce |
    /// entity_nonce | num_keys: i32 | BufferedString(purpose_json)`.
    pub fn serialize_plaintext(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_string(&mut out, &self.entity_name);
        out.extend_from_slice(&self.auth_nonce);
        out.extend_from_slice(&self.entity_nonce);
        out.extend_from_slice(&(self.num_keys as i32).to_be_bytes());
        wire::put_string(&mut out, &self.purpose.to_json());
        out
    }

    pub fn parse_plaintext(plaintext: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(plaintext);
        let entity_name = reader.read_string()?;
        let auth_nonce = read_nonce(&mut reader)?;
        let entity_nonce = read_nonce(&mut reader)?;
        let num_keys = reader.read_i32()?;
        if num_keys < 0 {
            return Err(MessageError::NegativeKeyCount(num_keys));
        }
        let purpose = SessionKeyPurpose::from_json(&reader.read_string()?)?;
        expect_consumed(&reader)?;
        Ok(Self {
            entity_name,
            auth_nonce,
            entity_nonce,
            num_keys: num_keys as u32,
            purpose,
        })
    }

    /// Splits a public-key-path payload into its RSA ciphertext and the
    /// trailing fixed-size signature over that ciphertext.
    pub fn split_signed_payload(payload: &[u8]) -> Result<(&[u8], &[u8]), MessageError> {
        if payload.len() <= RSA_BLOCK_SIZE {
            return Err(MessageError::MissingSignature);
        }
        Ok(payload.split_at(payload.len() - RSA_BLOCK_SIZE))
    }

    /// Entity-side: RSA-encrypts the request to the Auth and signs the
    /// ciphertext, producing the framed SESSION_KEY_REQ_IN_PUB_ENC bytes.
    pub fn seal_with_public_key(
        &self,
        auth_public: &RsaPublicKey,
        entity_crypto: &AuthCrypto,
    ) -> Result<Vec<u8>, MessageError> {
        let plaintext = self.serialize_plaintext();
        let mut payload = AuthCrypto::public_encrypt(&plaintext, auth_public)?;
        let signature = entity_crypto.sign(&payload);
        payload.extend_from_slice(&signature);
        Ok(wire::encode_envelope(
            MessageType::SessionKeyReqInPubEnc,
            &payload,
        ))
    }

    /// Entity-side: appends the payload hash tag, encrypts under the
    /// distribution key, and prefixes the cleartext entity name, producing
    /// the framed SESSION_KEY_REQ bytes.
    pub fn seal_with_dist_key(
        &self,
        dist_key: &DistributionKey,
        spec: SymmetricCryptoSpec,
    ) -> Result<Vec<u8>, MessageError> {
        let mut plaintext = self.serialize_plaintext();
        let tag = crypto::hash(&plaintext, spec.hash);
        plaintext.extend_from_slice(&tag);
        let sealed = crypto::symmetric_encrypt(&plaintext, dist_key.key_bytes(), spec)?;
        let mut payload = Vec::new();
        wire::put_string(&mut payload, &self.entity_name);
        payload.extend_from_slice(&sealed);
        Ok(wire::encode_envelope(MessageType::SessionKeyReq, &payload))
    }

    /// Auth-side: decrypts a distribution-key envelope, checks the trailing
    /// payload hash tag in constant time, and parses the request.
    pub fn open_dist_key_envelope(
        encrypted: &[u8],
        dist_key: &DistributionKey,
        spec: SymmetricCryptoSpec,
    ) -> Result<Self, MessageError> {
        let plain_and_tag = crypto::symmetric_decrypt(encrypted, dist_key.key_bytes(), spec)?;
        let tag_len = spec.hash.digest_len();
        if plain_and_tag.len() <= tag_len {
            return Err(MessageError::TagMismatch);
        }
        let (plaintext, tag) = plain_and_tag.split_at(plain_and_tag.len() - tag_len);
        if !crypto::constant_time_eq(&crypto::hash(plaintext, spec.hash), tag) {
            return Err(MessageError::TagMismatch);
        }
        Self::parse_plaintext(plaintext)
    }
}

/// One issued key inside a response body.
#[derive(Clone, Debug)]
pub struct SessionKeyEntry {
    pub id: u64,
    pub abs_validity_ms: i64,
    pub rel_validity_ms: i64,
    pub key: Zeroizing<Vec<u8>>,
}

impl From<&SessionKey> for SessionKeyEntry {
    fn from(key: &SessionKey) -> Self {
        Self {
            id: key.id,
            abs_validity_ms: key.abs_validity_ms,
            rel_validity_ms: key.rel_validity_ms,
            key: key.key.clone(),
        }
    }
}

/// The session-key response body, encrypted under the distribution key.
#[derive(Clone, Debug)]
pub struct SessionKeyResp {
    pub entity_nonce: [u8; ENTITY_NONCE_SIZE],
    pub crypto_spec: SymmetricCryptoSpec,
    pub keys: Vec<SessionKeyEntry>,
}

impl SessionKeyResp {
    /// Body layout: `entity_nonce | BufferedString(crypto_spec) |
    /// varint(num_keys) | (id | abs_validity | rel_validity |
    /// varint(len) | key bytes)*`.
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.entity_nonce);
        wire::put_string(&mut out, &self.crypto_spec.to_string());
        wire::put_varint(&mut out, self.keys.len());
        for entry in &self.keys {
            out.extend_from_slice(&entry.id.to_be_bytes());
            out.extend_from_slice(&entry.abs_validity_ms.to_be_bytes());
            out.extend_from_slice(&entry.rel_validity_ms.to_be_bytes());
            wire::put_varint(&mut out, entry.key.len());
            out.extend_from_slice(&entry.key);
        }
        out
    }

    pub fn parse_body(body: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(body);
        let entity_nonce = read_nonce(&mut reader)?;
        let crypto_spec: SymmetricCryptoSpec = reader.read_string()?.parse()?;
        let count = reader.read_varint()?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let id = reader.read_u64()?;
            let abs_validity_ms = reader.read_i64()?;
            let rel_validity_ms = reader.read_i64()?;
            let len = reader.read_varint()?;
            let key = Zeroizing::new(reader.read_bytes(len)?.to_vec());
            keys.push(SessionKeyEntry {
                id,
                abs_validity_ms,
                rel_validity_ms,
                key,
            });
        }
        expect_consumed(&reader)?;
        Ok(Self {
            entity_nonce,
            crypto_spec,
            keys,
        })
    }

    /// Auth-side: encrypts the body under the distribution key, prepending
    /// the RSA block when a freshly minted key accompanies this response.
    pub fn seal(
        &self,
        dist_key: &DistributionKey,
        spec: SymmetricCryptoSpec,
        encrypted_dist_key: Option<&[u8]>,
    ) -> Result<Vec<u8>, MessageError> {
        let body = self.serialize_body();
        let sealed = crypto::symmetric_encrypt(&body, dist_key.key_bytes(), spec)?;
        let mut payload =
            Vec::with_capacity(encrypted_dist_key.map_or(0, <[u8]>::len) + sealed.len());
        if let Some(block) = encrypted_dist_key {
            payload.extend_from_slice(block);
        }
        payload.extend_from_slice(&sealed);
        Ok(wire::encode_envelope(MessageType::SessionKeyResp, &payload))
    }

    /// Entity-side: recovers the freshly minted distribution key from the
    /// leading RSA block, then decrypts the body under it.
    pub fn open_with_new_dist_key(
        payload: &[u8],
        entity_crypto: &AuthCrypto,
        auth_public: &RsaPublicKey,
        spec: SymmetricCryptoSpec,
    ) -> Result<(DistributionKey, Self), MessageError> {
        if payload.len() <= DIST_KEY_BLOCK_SIZE {
            return Err(MessageError::MissingSignature);
        }
        let (block, sealed_body) = payload.split_at(DIST_KEY_BLOCK_SIZE);
        let (ciphertext, signature) = block.split_at(RSA_BLOCK_SIZE);
        AuthCrypto::verify(ciphertext, signature, auth_public)?;
        let serialized = entity_crypto.private_decrypt(ciphertext)?;
        let dist_key = DistributionKey::deserialize(&serialized)?;
        let body = crypto::symmetric_decrypt(sealed_body, dist_key.key_bytes(), spec)?;
        Ok((dist_key, Self::parse_body(&body)?))
    }

    /// Entity-side: decrypts the body under an already-held distribution key.
    pub fn open_with_dist_key(
        payload: &[u8],
        dist_key: &DistributionKey,
        spec: SymmetricCryptoSpec,
    ) -> Result<Self, MessageError> {
        let body = crypto::symmetric_decrypt(payload, dist_key.key_bytes(), spec)?;
        Self::parse_body(&body)
    }
}

fn read_nonce(reader: &mut Reader<'_>) -> Result<[u8; 8], MessageError> {
    let bytes = reader.read_bytes(8)?;
    let mut nonce = [0_u8; 8];
    nonce.copy_from_slice(bytes);
    Ok(nonce)
}

fn expect_consumed(reader: &Reader<'_>) -> Result<(), MessageError> {
    if reader.remaining() == 0 {
        Ok(())
    } else {
        Err(MessageError::TrailingBytes)
    }
}
