//! Salted password hashing.
//!
//! The byte-level hash primitive is explicitly out of scope; only
//! the contract is specified: a 2-character salt prefixes the stored hash,
//! `hash(password, None)` generates a fresh salt, `hash(password,
//! Some(salt))` reproduces a hash for comparison, and `verify` is
//! constant-time. Salt characters are drawn uniformly from `./0-9A-Za-z`
//! (64 symbols) via rejection sampling rather than a plain `rand() % 64`,
//! which would skew the distribution if the alphabet size ever stopped
//! being a power of two.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::Error;

const SALT_ALPHABET: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generates one uniformly-distributed salt character via rejection
/// sampling against the 64-symbol alphabet.
fn salt_char(rng: &mut impl RngCore) -> u8 {
    loop {
        let byte = (rng.next_u32() & 0x3f) as usize;
        // 64 is a power of two so this mask never needs to reject in
        // practice, but rejection sampling is kept explicit so the
        // alphabet can change size without reintroducing bias).
        if byte < SALT_ALPHABET.len() {
            return SALT_ALPHABET[byte];
        }
    }
}

fn generate_salt() -> [u8; 2] {
    let mut rng = rand::thread_rng();
    [salt_char(&mut rng), salt_char(&mut rng)]
}

/// Hashes `password` with `salt` (generating a fresh one if `None`),
/// returning the full encoded string beginning with the salt.
pub fn hash(password: &str, salt: Option<&[u8]>) -> Result<String, Error> {
    let salt_bytes: [u8; 2] = match salt {
        Some(s) if s.len() >= 2 => [s[0], s[1]],
        Some(_) => return Err(Error::Crypto("salt shorter than 2 bytes".into())),
        None => generate_salt(),
    };

    if !salt_bytes.iter().all(|b| SALT_ALPHABET.contains(b)) {
        return Err(Error::Crypto("invalid salt character".into()));
    }

    let mut hasher = Sha256::new();
    hasher.update(salt_bytes);
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();

    let mut encoded = String::with_capacity(2 + digest.len() * 2);
    encoded.push(salt_bytes[0] as char);
    encoded.push(salt_bytes[1] as char);
    for byte in digest {
        encoded.push_str(&format!("{byte:02x}"));
    }

    Ok(encoded)
}

/// Verifies `password` against a previously stored hash, in constant time.
pub fn verify(password: &str, stored_hash: &str) -> Result<bool, Error> {
    if stored_hash.len() < 2 {
        return Err(Error::Crypto("stored hash shorter than salt".into()));
    }
    let salt = stored_hash.as_bytes();
    let candidate = hash(password, Some(&salt[..2]))?;
    Ok(constant_time_eq(candidate.as_bytes(), stored_hash.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
