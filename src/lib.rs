#![forbid(unsafe_code)]

//! Prahari is a local authentication and authorization server for IoT
//! deployments. Registered entities connect over TCP to obtain short-lived
//! symmetric session keys for talking to peers; keys minted by a remote
//! Auth are fetched over mutually authenticated HTTPS.

use std::time::{SystemTime, UNIX_EPOCH};

/// On-disk configuration and server-context assembly.
pub mod config;
/// RSA and AES-CBC facade, crypto specs, and constant-time helpers.
pub mod crypto;
/// Auth-to-Auth session-key retrieval over HTTPS.
pub mod federation;
/// Typed protocol messages and their cryptographic envelopes.
pub mod message;
/// Communication policies mapping (group, target) to key parameters.
pub mod policy;
/// Registered entities, distribution keys, and trusted peer Auths.
pub mod registry;
/// TCP listener and the per-connection protocol state machine.
pub mod server;
/// Session-key minting, lookup, and ownership tracking.
pub mod sessionkey;
/// Byte-level wire codec: varints, strings, message envelopes.
pub mod wire;

/// Milliseconds since the Unix epoch; the clock all validity windows use.
pub(crate) fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
