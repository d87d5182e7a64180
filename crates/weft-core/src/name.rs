//! Channel names, their discovery hashes, and the SRP credential table.
//!
//! A channel name is a shared secret. What goes on the network is
//! `hash = base64(bcrypt(name))`: a receiver cannot recover the name from the
//! hash, but any holder of the name can verify a match. The same hash doubles
//! as the SRP username for federated dials, with the plaintext name as the
//! password. Knowing the name is necessary and sufficient to authenticate.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;

/// bcrypt cost for channel hashes. The browser re-verifies every cached
/// record against every local channel name each sweep, so this stays well
/// below the password-storage default.
pub const BCRYPT_COST: u32 = 8;

/// Fixed SRP salt. Deliberately weak: credentials are ephemeral and never
/// persisted, so the salt only needs to satisfy the handshake.
pub const SRP_SALT: [u8; 7] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

/// Whether `name` is a well-formed channel name: 1–255 chars drawn from
/// `[A-Za-z0-9+=*._-]`.
pub fn valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'=' | b'*' | b'.' | b'_' | b'-'))
}

/// Compute the advertised hash for a channel name.
pub fn hash_channel_name(name: &str) -> Result<String, bcrypt::BcryptError> {
    let digest = bcrypt::hash(name, BCRYPT_COST)?;
    Ok(BASE64.encode(digest.as_bytes()))
}

/// Decode an advertised base64 hash back to its bcrypt form.
pub fn decode_hash(hash_base64: &str) -> Option<Vec<u8>> {
    BASE64.decode(hash_base64).ok()
}

/// Whether `name` is the preimage of the given bcrypt digest.
/// A mismatch is expected during discovery and is not an error.
pub fn channel_name_matches(name: &str, hash_bcrypt: &[u8]) -> bool {
    let Ok(digest) = std::str::from_utf8(hash_bcrypt) else {
        return false;
    };
    bcrypt::verify(name, digest).unwrap_or(false)
}

/// In-memory SRP credential table: advertised hash → plaintext channel name.
///
/// Written when a channel is created, cleared when it is destroyed, and read
/// by the tunnel listener's verifier lookup. Shared by clone.
#[derive(Clone, Default)]
pub struct CredentialsStore {
    entries: Arc<DashMap<String, String>>,
}

impl CredentialsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: &str, name: &str) {
        self.entries.insert(hash.to_string(), name.to_string());
    }

    pub fn remove(&self, hash: &str) {
        self.entries.remove(hash);
    }

    /// SRP username lookup. `None` means the handshake must fail.
    pub fn lookup(&self, user: &str) -> Option<String> {
        self.entries.get(user).map(|entry| entry.value().clone())
    }
}
