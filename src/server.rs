// This file is part of Prahari and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

use crate::crypto::{AuthCrypto, CryptoError, SymmetricCryptoSpec};
use crate::federation::{AuthSessionKeyReq, FederationError, PeerAuthClient};
use crate::message::{
    AlertCode, AuthAlert, AuthHello, MessageError, SessionKeyEntry, SessionKeyPurpose,
    SessionKeyReq, SessionKeyResp, AUTH_NONCE_SIZE,
};
use crate::policy::{PolicyStore, TargetKind};
use crate::registry::{DistributionKey, RegisteredEntity, Registry, RegistryError};
use crate::sessionkey::{decode_auth_id, SessionKey, SessionKeyError, SessionKeyStore};
use crate::unix_time_ms;
use crate::wire::{self, MessageType, Reader, WireError};

/// Everything a connection handler needs: the local Auth identity, key
/// material, stores, and the peer-Auth client.
pub struct AuthContext {
    pub auth_id: u32,
    pub crypto: AuthCrypto,
    pub registry: Registry,
    pub policies: PolicyStore,
    pub session_keys: SessionKeyStore,
    pub peer_client: Arc<dyn PeerAuthClient>,
    pub entity_timeout: Duration,
}

/// Failures terminating a single entity connection. None of these affect
/// other connections; all of them end with the socket closed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no complete request arrived before the deadline")]
    Timeout,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("unexpected {0:?} message from entity")]
    UnexpectedMessage(MessageType),
    #[error("no active registered entity named {0:?}")]
    UnknownEntity(String),
    #[error("entity {0:?} has no public key on file")]
    NoPublicKey(String),
    #[error("entity signature verification failed")]
    SignatureInvalid,
    #[error("echoed auth nonce does not match the issued one")]
    NonceMismatch,
    #[error("no policy for group {group:?} toward {kind} {target:?}")]
    PolicyMissing {
        group: String,
        kind: TargetKind,
        target: String,
    },
    #[error("no session key with id {0}")]
    SessionKeyNotFound(u64),
    #[error(transparent)]
    SessionKey(#[from] SessionKeyError),
    #[error("peer Auth {0} is not trusted")]
    UnknownPeerAuth(u32),
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts entity connections forever, spawning one handler task each.
pub async fn run_listener(ctx: Arc<AuthContext>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(handle_entity_connection(ctx, stream, peer));
    }
}

/// Runs the per-connection state machine to completion and closes the
/// socket. Exactly one request is served per connection.
pub async fn handle_entity_connection(ctx: Arc<AuthContext>, mut stream: TcpStream, peer: SocketAddr) {
    debug!(%peer, "entity connected");
    match serve_entity(&ctx, &mut stream).await {
        Ok(()) => info!(%peer, "closing entity connection"),
        Err(HandlerError::Timeout) => info!(%peer, "timed out waiting for an entity request"),
        Err(error) => error!(%peer, %error, "entity request failed"),
    }
    if let Err(error) = stream.shutdown().await {
        debug!(%peer, %error, "socket shutdown failed");
    }
}

async fn serve_entity(ctx: &AuthContext, stream: &mut TcpStream) -> Result<(), HandlerError> {
    let deadline = Instant::now() + ctx.entity_timeout;

    let mut auth_nonce = [0_u8; AUTH_NONCE_SIZE];
    auth_nonce.copy_from_slice(&AuthCrypto::random_bytes(AUTH_NONCE_SIZE));
    let hello = AuthHello {
        auth_id: ctx.auth_id,
        nonce: auth_nonce,
    };
    debug!(auth_nonce = %hex::encode(auth_nonce), "sending auth hello");
    stream.write_all(&hello.encode()).await?;

    let envelope = match timeout_at(deadline, wire::read_envelope(stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(HandlerError::Timeout),
    };
    debug!(msg_type = ?envelope.msg_type, bytes = envelope.payload.len(), "received request");

    match envelope.msg_type {
        MessageType::SessionKeyReqInPubEnc => {
            handle_pub_enc_request(ctx, stream, &envelope.payload, &auth_nonce).await
        }
        MessageType::SessionKeyReq => {
            handle_dist_key_request(ctx, stream, &envelope.payload, &auth_nonce).await
        }
        other => Err(HandlerError::UnexpectedMessage(other)),
    }
}

/// Public-key path: the payload is RSA ciphertext followed by the entity's
/// signature over that ciphertext. A fresh distribution key is minted and
/// rides along in the response.
async fn handle_pub_enc_request(
    ctx: &AuthContext,
    stream: &mut TcpStream,
    payload: &[u8],
    auth_nonce: &[u8; AUTH_NONCE_SIZE],
) -> Result<(), HandlerError> {
    info!("session key request under public-key encryption");
    let (ciphertext, signature) = SessionKeyReq::split_signed_payload(payload)?;
    let plaintext = ctx.crypto.private_decrypt(ciphertext)?;
    let request = SessionKeyReq::parse_plaintext(&plaintext)?;

    let entity = lookup_entity(ctx, &request.entity_name)?;
    let public_key = entity
        .public_key()
        .ok_or_else(|| HandlerError::NoPublicKey(entity.name().to_string()))?
        .clone();
    AuthCrypto::verify(ciphertext, signature, &public_key)
        .map_err(|_| HandlerError::SignatureInvalid)?;
    check_auth_nonce(auth_nonce, &request.auth_nonce)?;

    let (keys, session_spec) = dispatch_purpose(ctx, &entity, &request).await?;

    let dist_spec = entity.dist_crypto_spec();
    let dist_key = DistributionKey::new(
        AuthCrypto::random_bytes(dist_spec.cipher.key_len()),
        unix_time_ms() + entity.dist_key_validity_ms(),
    );
    ctx.registry
        .update_distribution_key(entity.name(), dist_key.clone())?;
    debug!(entity = entity.name(), expires_at_ms = dist_key.expires_at_ms(),
        "installed fresh distribution key");

    let mut dist_key_block = AuthCrypto::public_encrypt(&dist_key.serialize(), &public_key)?;
    dist_key_block.extend_from_slice(&ctx.crypto.sign(&dist_key_block));

    send_response(
        stream,
        &request,
        &keys,
        session_spec,
        &dist_key,
        dist_spec,
        Some(&dist_key_block),
    )
    .await
}

/// Distribution-key path: cleartext entity name, then an AES envelope whose
/// plaintext ends with a hash tag over the request bytes.
async fn handle_dist_key_request(
    ctx: &AuthContext,
    stream: &mut TcpStream,
    payload: &[u8],
    auth_nonce: &[u8; AUTH_NONCE_SIZE],
) -> Result<(), HandlerError> {
    info!("session key request under a distribution key");
    let mut reader = Reader::new(payload);
    let entity_name = reader.read_string()?;
    let encrypted = reader.rest();

    let entity = lookup_entity(ctx, &entity_name)?;
    let dist_spec = entity.dist_crypto_spec();
    let now = unix_time_ms();
    let dist_key = match entity.distribution_key() {
        Some(key) if entity.use_permanent_dist_key() || !key.is_expired(now) => key,
        Some(_) => {
            info!(entity = %entity_name, "distribution key is expired");
            return send_alert(stream, AlertCode::InvalidDistributionKey).await;
        }
        None => {
            info!(entity = %entity_name, "no distribution key is available");
            return send_alert(stream, AlertCode::InvalidDistributionKey).await;
        }
    };

    let request = SessionKeyReq::open_dist_key_envelope(encrypted, &dist_key, dist_spec)?;
    check_auth_nonce(auth_nonce, &request.auth_nonce)?;

    let (keys, session_spec) = dispatch_purpose(ctx, &entity, &request).await?;
    send_response(stream, &request, &keys, session_spec, &dist_key, dist_spec, None).await
}

fn lookup_entity(
    ctx: &AuthContext,
    name: &str,
) -> Result<Arc<RegisteredEntity>, HandlerError> {
    match ctx.registry.get_entity(name) {
        Some(entity) if entity.is_active() => Ok(entity),
        Some(_) => {
            info!(entity = %name, "request from inactive entity");
            Err(HandlerError::UnknownEntity(name.to_string()))
        }
        None => Err(HandlerError::UnknownEntity(name.to_string())),
    }
}

fn check_auth_nonce(
    issued: &[u8; AUTH_NONCE_SIZE],
    echoed: &[u8; AUTH_NONCE_SIZE],
) -> Result<(), HandlerError> {
    if crate::crypto::constant_time_eq(issued, echoed) {
        debug!("auth nonce matches");
        Ok(())
    } else {
        Err(HandlerError::NonceMismatch)
    }
}

/// Resolves the request's purpose into the session keys to return and the
/// crypto spec to advertise for them.
async fn dispatch_purpose(
    ctx: &AuthContext,
    entity: &RegisteredEntity,
    request: &SessionKeyReq,
) -> Result<(Vec<SessionKey>, SymmetricCryptoSpec), HandlerError> {
    match &request.purpose {
        SessionKeyPurpose::Group(target)
        | SessionKeyPurpose::PubTopic(target)
        | SessionKeyPurpose::SubTopic(target) => {
            let kind = request.purpose.target_kind();
            let policy = ctx
                .policies
                .get_comm_policy(entity.group(), kind, target)
                .ok_or_else(|| HandlerError::PolicyMissing {
                    group: entity.group().to_string(),
                    kind,
                    target: target.clone(),
                })?;
            let keys = ctx.session_keys.generate(
                entity.name(),
                request.num_keys,
                &policy,
                entity.max_session_keys_per_request(),
            );
            debug!(count = keys.len(), requested = request.num_keys, "minted session keys");
            Ok((keys, policy.crypto_spec))
        }
        SessionKeyPurpose::KeyId(id) => {
            let minting_auth = decode_auth_id(*id);
            if minting_auth == ctx.auth_id {
                debug!(session_key_id = *id, "session key was minted locally");
                let key = ctx
                    .session_keys
                    .get_by_id(*id)
                    .ok_or(HandlerError::SessionKeyNotFound(*id))?;
                ctx.session_keys.add_owner(*id, entity.name())?;
                let spec = key.crypto_spec;
                Ok((vec![key], spec))
            } else {
                info!(session_key_id = *id, peer_auth = minting_auth,
                    "session key was minted by a peer Auth");
                let peer = ctx
                    .registry
                    .get_peer_auth(minting_auth)
                    .ok_or(HandlerError::UnknownPeerAuth(minting_auth))?;
                let response = ctx
                    .peer_client
                    .fetch_session_key(
                        &peer,
                        &AuthSessionKeyReq {
                            session_key_id: *id,
                            requesting_entity_name: entity.name().to_string(),
                            requesting_entity_group: entity.group().to_string(),
                        },
                    )
                    .await?;
                let (key, spec) = response.into_session_key()?;
                Ok((vec![key], spec))
            }
        }
    }
}

async fn send_alert(stream: &mut TcpStream, code: AlertCode) -> Result<(), HandlerError> {
    stream.write_all(&AuthAlert { code }.encode()).await?;
    Ok(())
}

async fn send_response(
    stream: &mut TcpStream,
    request: &SessionKeyReq,
    keys: &[SessionKey],
    session_spec: SymmetricCryptoSpec,
    dist_key: &DistributionKey,
    dist_spec: SymmetricCryptoSpec,
    dist_key_block: Option<&[u8]>,
) -> Result<(), HandlerError> {
    let response = SessionKeyResp {
        entity_nonce: request.entity_nonce,
        crypto_spec: session_spec,
        keys: keys.iter().map(SessionKeyEntry::from).collect(),
    };
    let framed = response.seal(dist_key, dist_spec, dist_key_block)?;
    stream.write_all(&framed).await?;
    debug!(bytes = framed.len(), keys = keys.len(), "sent session key response");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rsa::RsaPrivateKey;
    use tokio::io::AsyncReadExt;
    use zeroize::Zeroizing;

    use crate::crypto;
    use crate::federation::AuthSessionKeyResp;
    use crate::policy::CommunicationPolicy;
    use crate::registry::TrustedAuth;
    use crate::sessionkey::encode_session_key_id;

    const LOCAL_AUTH_ID: u32 = 1;
    const ENTITY_NAME: &str = "net1.client";
    const ENTITY_GROUP: &str = "clients";

    fn spec() -> SymmetricCryptoSpec {
        "AES-128-CBC-SHA256".parse().expect("spec")
    }

    fn keypair() -> AuthCrypto {
        AuthCrypto::new(RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("keygen"))
    }

    fn group_policy(target: &str, kind: TargetKind) -> CommunicationPolicy {
        CommunicationPolicy {
            requester_group: ENTITY_GROUP.to_string(),
            target_kind: kind,
            target_name: target.to_string(),
            crypto_spec: spec(),
            key_bits: 128,
            abs_validity_ms: 3_600_000,
            rel_validity_ms: 60_000,
            max_num_owners: 4,
        }
    }

    /// Scripted stand-in for the HTTPS peer-Auth client.
    struct MockPeerAuth {
        response: Option<AuthSessionKeyResp>,
        seen: Mutex<Vec<(TrustedAuth, AuthSessionKeyReq)>>,
    }

    impl MockPeerAuth {
        fn unreachable_peer() -> Self {
            Self {
                response: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn with_response(response: AuthSessionKeyResp) -> Self {
            Self {
                response: Some(response),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerAuthClient for MockPeerAuth {
        async fn fetch_session_key(
            &self,
            peer: &TrustedAuth,
            request: &AuthSessionKeyReq,
        ) -> Result<AuthSessionKeyResp, FederationError> {
            self.seen
                .lock()
                .expect("poisoned")
                .push((peer.clone(), request.clone()));
            self.response.clone().ok_or(FederationError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
            })
        }
    }

    struct TestAuth {
        ctx: Arc<AuthContext>,
        addr: std::net::SocketAddr,
        entity_crypto: AuthCrypto,
    }

    async fn spawn_auth(peer_client: Arc<dyn PeerAuthClient>, timeout: Duration) -> TestAuth {
        let auth_crypto = keypair();
        let entity_crypto = keypair();

        let registry = Registry::new();
        registry.insert_entity(RegisteredEntity::new(
            ENTITY_NAME.to_string(),
            ENTITY_GROUP.to_string(),
            Some(entity_crypto.public_key().clone()),
            spec(),
            60_000,
            5,
            false,
            true,
            None,
        ));

        let policies = PolicyStore::new();
        policies.add_policy(group_policy("servers", TargetKind::TargetGroup));
        policies.add_policy(group_policy("telemetry", TargetKind::PublishTopic));

        let ctx = Arc::new(AuthContext {
            auth_id: LOCAL_AUTH_ID,
            crypto: auth_crypto,
            registry,
            policies,
            session_keys: SessionKeyStore::new(LOCAL_AUTH_ID),
            peer_client,
            entity_timeout: timeout,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(run_listener(Arc::clone(&ctx), listener));

        TestAuth {
            ctx,
            addr,
            entity_crypto,
        }
    }

    async fn connect_and_read_hello(addr: std::net::SocketAddr) -> (TcpStream, AuthHello) {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let envelope = wire::read_envelope(&mut stream).await.expect("hello");
        assert_eq!(envelope.msg_type, MessageType::AuthHello);
        let hello = AuthHello::decode_payload(&envelope.payload).expect("hello payload");
        assert_eq!(hello.auth_id, LOCAL_AUTH_ID);
        (stream, hello)
    }

    fn request(
        auth_nonce: [u8; 8],
        num_keys: u32,
        purpose: SessionKeyPurpose,
    ) -> SessionKeyReq {
        SessionKeyReq {
            entity_name: ENTITY_NAME.to_string(),
            auth_nonce,
            entity_nonce: *b"entnonce",
            num_keys,
            purpose,
        }
    }

    async fn expect_closed_without_response(stream: &mut TcpStream) {
        let mut buf = [0_u8; 1];
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("unexpected {n} response bytes"),
            Ok(Err(_)) => {}
            Err(_) => panic!("connection not closed"),
        }
    }

    fn install_dist_key(auth: &TestAuth, expires_at_ms: i64) -> DistributionKey {
        let key = DistributionKey::new(AuthCrypto::random_bytes(16), expires_at_ms);
        auth.ctx
            .registry
            .update_distribution_key(ENTITY_NAME, key.clone())
            .expect("install");
        key
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pub_enc_request_mints_keys_and_rotates_dist_key() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;

        let before = unix_time_ms();
        let req = request(
            hello.nonce,
            2,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req
            .seal_with_public_key(auth.ctx.crypto.public_key(), &auth.entity_crypto)
            .expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        assert_eq!(envelope.msg_type, MessageType::SessionKeyResp);
        let (new_dist_key, response) = SessionKeyResp::open_with_new_dist_key(
            &envelope.payload,
            &auth.entity_crypto,
            auth.ctx.crypto.public_key(),
            spec(),
        )
        .expect("open");

        assert_eq!(response.entity_nonce, *b"entnonce");
        assert_eq!(response.crypto_spec, spec());
        assert_eq!(response.keys.len(), 2);
        for key in &response.keys {
            assert_eq!(decode_auth_id(key.id), LOCAL_AUTH_ID);
            assert_eq!(key.key.len(), 16);
        }

        // The installed key must be the one the response rode on, expiring
        // dist_key_validity_ms after the request.
        let entity = auth.ctx.registry.get_entity(ENTITY_NAME).expect("entity");
        let installed = entity.distribution_key().expect("rotated");
        assert_eq!(installed.key_bytes(), new_dist_key.key_bytes());
        let expires = installed.expires_at_ms();
        assert!(expires >= before + 60_000 && expires <= unix_time_ms() + 60_000);

        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dist_key_request_reuses_the_installed_key() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::PubTopic("telemetry".to_string()),
        );
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        assert_eq!(envelope.msg_type, MessageType::SessionKeyResp);
        let response = SessionKeyResp::open_with_dist_key(&envelope.payload, &dist_key, spec())
            .expect("open");
        assert_eq!(response.entity_nonce, *b"entnonce");
        assert_eq!(response.keys.len(), 1);

        // No rotation on this path.
        let entity = auth.ctx.registry.get_entity(ENTITY_NAME).expect("entity");
        let current = entity.distribution_key().expect("still installed");
        assert_eq!(current.key_bytes(), dist_key.key_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_dist_key_draws_an_alert() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let dist_key = install_dist_key(&auth, unix_time_ms() - 1_000);

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("alert");
        assert_eq!(envelope.msg_type, MessageType::AuthAlert);
        let alert = AuthAlert::decode_payload(&envelope.payload).expect("payload");
        assert_eq!(alert.code, AlertCode::InvalidDistributionKey);
        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_dist_key_draws_an_alert() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let unknown_to_auth = DistributionKey::new(AuthCrypto::random_bytes(16), i64::MAX);

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req
            .seal_with_dist_key(&unknown_to_auth, spec())
            .expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("alert");
        assert_eq!(envelope.msg_type, MessageType::AuthAlert);
        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tampered_signature_closes_without_response_or_rotation() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;

        let req = request(
            hello.nonce,
            2,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let mut framed = req
            .seal_with_public_key(auth.ctx.crypto.public_key(), &auth.entity_crypto)
            .expect("seal");
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        stream.write_all(&framed).await.expect("send");

        expect_closed_without_response(&mut stream).await;
        let entity = auth.ctx.registry.get_entity(ENTITY_NAME).expect("entity");
        assert!(entity.distribution_key().is_none(), "no rotation on failure");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fabricated_auth_nonce_closes_without_response() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let (mut stream, _hello) = connect_and_read_hello(auth.addr).await;

        let req = request(
            *b"00000000",
            1,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req
            .seal_with_public_key(auth.ctx.crypto.public_key(), &auth.entity_crypto)
            .expect("seal");
        stream.write_all(&framed).await.expect("send");

        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_entity_closes_without_response() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;

        let mut req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        req.entity_name = "net9.stranger".to_string();
        let framed = req
            .seal_with_public_key(auth.ctx.crypto.public_key(), &auth.entity_crypto)
            .expect("seal");
        stream.write_all(&framed).await.expect("send");

        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_policy_closes_without_response() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;

        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::SubTopic("no-such-topic".to_string()),
        );
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locally_minted_key_id_grants_ownership() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);

        let minted = auth.ctx.session_keys.generate(
            "net1.server",
            1,
            &group_policy("servers", TargetKind::TargetGroup),
            5,
        );
        let key_id = minted[0].id;

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        // num_keys is ignored for key-id requests.
        let req = request(hello.nonce, 7, SessionKeyPurpose::KeyId(key_id));
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        let response = SessionKeyResp::open_with_dist_key(&envelope.payload, &dist_key, spec())
            .expect("open");
        assert_eq!(response.keys.len(), 1);
        assert_eq!(response.keys[0].id, key_id);
        assert_eq!(*response.keys[0].key, *minted[0].key);

        let owners = auth
            .ctx
            .session_keys
            .get_by_id(key_id)
            .expect("key")
            .owners;
        assert_eq!(
            owners,
            BTreeSet::from(["net1.server".to_string(), ENTITY_NAME.to_string()])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remotely_minted_key_id_is_fetched_from_the_peer_auth() {
        let remote_id = encode_session_key_id(7, 99);
        let key_bytes = vec![0x42_u8; 16];
        let peer_response = AuthSessionKeyResp {
            id: remote_id,
            owner: "net7.broker".to_string(),
            max_owners: 2,
            crypto_spec: "AES-256-CBC-SHA256".to_string(),
            expiration_time: 1_900_000_000_000,
            rel_validity_period: 120_000,
            key_val: {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.encode(&key_bytes)
            },
        };
        let peer_client = Arc::new(MockPeerAuth::with_response(peer_response));
        let auth = spawn_auth(Arc::clone(&peer_client) as Arc<dyn PeerAuthClient>, Duration::from_secs(5)).await;
        auth.ctx.registry.insert_trusted_auth(TrustedAuth {
            id: 7,
            host: "auth7.local".to_string(),
            port: 22907,
        });
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(hello.nonce, 1, SessionKeyPurpose::KeyId(remote_id));
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        let response = SessionKeyResp::open_with_dist_key(&envelope.payload, &dist_key, spec())
            .expect("open");
        assert_eq!(response.keys.len(), 1);
        assert_eq!(response.keys[0].id, remote_id);
        assert_eq!(&*response.keys[0].key, key_bytes.as_slice());
        assert_eq!(response.crypto_spec.to_string(), "AES-256-CBC-SHA256");

        // The documented request body went to the right peer.
        let seen = peer_client.seen.lock().expect("poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.host, "auth7.local");
        assert_eq!(seen[0].1.session_key_id, remote_id);
        assert_eq!(seen[0].1.requesting_entity_name, ENTITY_NAME);
        assert_eq!(seen[0].1.requesting_entity_group, ENTITY_GROUP);
        drop(seen);

        // Remote keys are forwarded, never adopted into the local store.
        assert!(auth.ctx.session_keys.get_by_id(remote_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn federation_failure_closes_without_response() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        auth.ctx.registry.insert_trusted_auth(TrustedAuth {
            id: 7,
            host: "auth7.local".to_string(),
            port: 22907,
        });
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);

        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::KeyId(encode_session_key_id(7, 5)),
        );
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_entity_is_disconnected_at_the_deadline() {
        let auth = spawn_auth(
            Arc::new(MockPeerAuth::unreachable_peer()),
            Duration::from_millis(200),
        )
        .await;
        let (mut stream, _hello) = connect_and_read_hello(auth.addr).await;
        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrecognized_message_type_closes_without_response() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let (mut stream, _hello) = connect_and_read_hello(auth.addr).await;
        let framed = AuthAlert {
            code: AlertCode::InvalidDistributionKey,
        }
        .encode();
        stream.write_all(&framed).await.expect("send");
        expect_closed_without_response(&mut stream).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn num_keys_is_capped_by_entity_and_policy_limits() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;
        let dist_key = install_dist_key(&auth, unix_time_ms() + 60_000);
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;

        // Entity max is 5, policy owner cap is 4: twelve requested, four issued.
        let req = request(
            hello.nonce,
            12,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req.seal_with_dist_key(&dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");

        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        let response = SessionKeyResp::open_with_dist_key(&envelope.payload, &dist_key, spec())
            .expect("open");
        assert_eq!(response.keys.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dist_key_installed_by_pub_enc_serves_a_follow_up_request() {
        let auth = spawn_auth(Arc::new(MockPeerAuth::unreachable_peer()), Duration::from_secs(5)).await;

        // First connection: public-key handshake mints the distribution key.
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::Group("servers".to_string()),
        );
        let framed = req
            .seal_with_public_key(auth.ctx.crypto.public_key(), &auth.entity_crypto)
            .expect("seal");
        stream.write_all(&framed).await.expect("send");
        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        let (new_dist_key, _) = SessionKeyResp::open_with_new_dist_key(
            &envelope.payload,
            &auth.entity_crypto,
            auth.ctx.crypto.public_key(),
            spec(),
        )
        .expect("open");
        drop(stream);

        // Second connection: the freshly minted key must be accepted.
        let (mut stream, hello) = connect_and_read_hello(auth.addr).await;
        let req = request(
            hello.nonce,
            1,
            SessionKeyPurpose::PubTopic("telemetry".to_string()),
        );
        let framed = req.seal_with_dist_key(&new_dist_key, spec()).expect("seal");
        stream.write_all(&framed).await.expect("send");
        let envelope = wire::read_envelope(&mut stream).await.expect("response");
        let response =
            SessionKeyResp::open_with_dist_key(&envelope.payload, &new_dist_key, spec())
                .expect("open");
        assert_eq!(response.keys.len(), 1);
    }
}
