//! Connection identifiers.

use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a host-unique opaque id: 128 random bits from the OS RNG,
/// rendered decimal. Stable for the lifetime of one connection only.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    u128::from_le_bytes(bytes).to_string()
}
