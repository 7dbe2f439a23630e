//! Pairing-code and opaque-token generation.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// 32-symbol alphabet omitting visually ambiguous characters (0/O/1/I).
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Pairing codes are 8 characters, human-typable.
pub const CODE_LEN: usize = 8;

/// Generate a pairing code.
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generate an opaque bearer token (refresh and account-session tokens):
/// 32 random bytes, hex-encoded.
pub fn new_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
