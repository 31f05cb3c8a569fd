//! Generated credentials for batch registration
//!
//! Registration needs addresses that won't collide across runs and passwords
//! that clear the upstream's complexity rules: the email local part combines
//! 10 random characters with an epoch-seconds suffix, and passwords always
//! contain at least one uppercase, lowercase, digit, and special character.

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use rand::RngExt;

const EMAIL_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*";

/// Random prefix length of the email local part.
const EMAIL_PREFIX_LEN: usize = 10;

/// Generated password length.
pub const PASSWORD_LENGTH: usize = 16;

/// Generate a unique email address at the given domain.
pub fn generate_email(domain: &str) -> String {
    let mut rng = rand::rng();
    let prefix: String = (0..EMAIL_PREFIX_LEN)
        .map(|_| pick(&mut rng, EMAIL_CHARSET) as char)
        .collect();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{prefix}{stamp:010}@{domain}")
}

/// Generate a password with one character guaranteed from each class.
pub fn generate_password() -> Secret<String> {
    let mut rng = rand::rng();
    let mut pool = Vec::with_capacity(UPPER.len() + LOWER.len() + DIGITS.len() + SPECIAL.len());
    pool.extend_from_slice(UPPER);
    pool.extend_from_slice(LOWER);
    pool.extend_from_slice(DIGITS);
    pool.extend_from_slice(SPECIAL);

    let mut chars = vec![
        pick(&mut rng, UPPER),
        pick(&mut rng, LOWER),
        pick(&mut rng, DIGITS),
        pick(&mut rng, SPECIAL),
    ];
    while chars.len() < PASSWORD_LENGTH {
        chars.push(pick(&mut rng, &pool));
    }
    // Fisher-Yates, so the guaranteed classes land anywhere in the string
    for i in (1..chars.len()).rev() {
        let j = rng.random_range(0..=i);
        chars.swap(i, j);
    }
    Secret::new(chars.iter().map(|&b| b as char).collect())
}

fn pick<R: RngExt>(rng: &mut R, set: &[u8]) -> u8 {
    set[rng.random_range(0..set.len())]
}
