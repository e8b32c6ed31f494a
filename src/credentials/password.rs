//! Password generation for provisioned database users.

use rand::rngs::OsRng;
use rand::RngCore;

/// Default generated password length
pub const DEFAULT_PASSWORD_LENGTH: usize = 24;

/// 62-symbol alphanumeric alphabet
pub const PASSWORD_ALPHABET: &[u8; 62] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a password from the OS CSPRNG.
///
/// Each character is `ALPHABET[byte % 62]`, one random byte per character.
/// 256 is not a multiple of 62, so the first 8 symbols are marginally more
/// likely; passwords already issued were produced the same way.
pub fn generate_password(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| PASSWORD_ALPHABET[*b as usize % PASSWORD_ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_length_and_alphabet() {
        let password = generate_password(DEFAULT_PASSWORD_LENGTH);
        assert_eq!(password.len(), 24);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_passwords_differ() {
        assert_ne!(generate_password(24), generate_password(24));
    }

    #[test]
    fn test_custom_length() {
        assert_eq!(generate_password(0), "");
        assert_eq!(generate_password(64).len(), 64);
    }
}
