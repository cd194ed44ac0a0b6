//! Vendor promo code generation
//!
//! A code is the first six alphanumerics of the business name, upper-cased,
//! followed by a four character random suffix. Names with fewer than three
//! usable characters are padded with random characters first. When no free
//! code is found after [`MAX_ATTEMPTS`] tries, a fully random `RM` code is
//! returned instead.

use rand::Rng;
use std::collections::HashSet;

pub const MAX_ATTEMPTS: usize = 100;
/// Longest code either branch of [`generate`] can produce
pub const MAX_CODE_LEN: usize = 10;

const BASE_LEN: usize = 6;
const MIN_BASE_LEN: usize = 3;
const SUFFIX_LEN: usize = 4;
const FALLBACK_PREFIX: &str = "RM";
const FALLBACK_LEN: usize = 8;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const _: () = assert!(
    BASE_LEN + SUFFIX_LEN <= MAX_CODE_LEN
        && FALLBACK_PREFIX.len() + FALLBACK_LEN <= MAX_CODE_LEN
);

fn random_chars<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Normalises a business name into the fixed part of a promo code
pub fn base_code<R: Rng + ?Sized>(name: &str, rng: &mut R) -> String {
    let mut base: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(BASE_LEN)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if base.len() < MIN_BASE_LEN {
        let pad = BASE_LEN - base.len();
        base.push_str(&random_chars(rng, pad));
    }

    base
}

/// Generates a code for `name` that `is_taken` does not reject
///
/// The fallback code is not checked against `is_taken`.
pub fn generate<R: Rng + ?Sized>(
    name: &str,
    rng: &mut R,
    is_taken: impl Fn(&str) -> bool,
) -> String {
    let base = base_code(name, rng);

    for _ in 0..MAX_ATTEMPTS {
        let mut code = base.clone();
        code.push_str(&random_chars(rng, SUFFIX_LEN));

        if !is_taken(&code) {
            return code;
        }
    }

    format!("{}{}", FALLBACK_PREFIX, random_chars(rng, FALLBACK_LEN))
}

/// The set of codes already handed out
#[derive(Debug, Default)]
pub struct PromoCodeSet {
    taken: HashSet<String>,
}

impl PromoCodeSet {
    /// Records an existing code. Blank codes are ignored
    pub fn insert_existing(&mut self, code: &str) {
        let code = code.trim();
        if !code.is_empty() {
            self.taken.insert(code.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    /// Generates a fresh code for `name` and reserves it
    pub fn next_for<R: Rng + ?Sized>(&mut self, name: &str, rng: &mut R) -> String {
        let code = generate(name, rng, |c| self.taken.contains(c));
        self.taken.insert(code.clone());
        code
    }
}
