//! # Password generation
//!
//! Admin credentials are sampled from the operating system RNG over an
//! alphanumeric alphabet with easily confused characters removed.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Characters left out of generated passwords
pub const AMBIGUOUS_CHARS: &str = "l0QD1vAEIOUaeiou";

/// Length used for the LDAP admin credential
pub const ADMIN_PASSWORD_LENGTH: usize = 40;

/// Bounds of the random length picked when none is requested
pub const RANDOM_LENGTH_RANGE: std::ops::Range<usize> = 35..45;

/// Alphabet passwords are drawn from
pub fn alphabet() -> Vec<u8> {
    (b'a'..=b'z')
        .chain(b'A'..=b'Z')
        .chain(b'0'..=b'9')
        .filter(|c| !AMBIGUOUS_CHARS.as_bytes().contains(c))
        .collect()
}

/// Generate a random password.
///
/// Without an explicit length one is picked from `RANDOM_LENGTH_RANGE`.
pub fn pwgen(length: Option<usize>) -> String {
    let mut rng = OsRng;
    let length = length.unwrap_or_else(|| rng.gen_range(RANDOM_LENGTH_RANGE));
    let alphabet = alphabet();

    (0..length)
        .filter_map(|_| alphabet.choose(&mut rng))
        .map(|&c| c as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pwgen_fixed_length() {
        let first = pwgen(Some(40));
        let second = pwgen(Some(40));

        assert_eq!(first.len(), 40);
        assert_eq!(second.len(), 40);
        assert_ne!(first, second);
    }

    #[test]
    fn test_alphabet_excludes_ambiguous() {
        let alphabet = alphabet();
        assert_eq!(alphabet.len(), 62 - AMBIGUOUS_CHARS.len());
        for c in AMBIGUOUS_CHARS.bytes() {
            assert!(!alphabet.contains(&c));
        }
    }

    #[test]
    fn test_pwgen_random_length_in_band() {
        for _ in 0..50 {
            let len = pwgen(None).len();
            assert!(RANDOM_LENGTH_RANGE.contains(&len), "length {} out of band", len);
        }
    }

    proptest! {
        #[test]
        fn prop_pwgen_only_uses_alphabet(length in 0usize..128) {
            let password = pwgen(Some(length));
            let alphabet = alphabet();
            prop_assert_eq!(password.len(), length);
            prop_assert!(password.bytes().all(|c| alphabet.contains(&c)));
        }
    }
}
