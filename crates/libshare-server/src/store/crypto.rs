use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use anyhow::{Context, Result};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Separator between the IV, tag and ciphertext segments.
pub const TRIPLET_SEPARATOR: char = ':';

const KEY_HEX_LEN: usize = 64;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 32-byte AES-256 key taken directly from the host secret.
///
/// No key derivation is applied: the first 64 hex characters of the secret
/// are the key, so rotating the secret replaces the key wholesale.
#[derive(ZeroizeOnDrop)]
pub struct HostKey([u8; 32]);

impl HostKey {
    /// Decode a host secret. Returns `None` if it is shorter than 64 hex
    /// characters or not hex.
    pub fn from_secret(host_secret: &str) -> Option<Self> {
        let prefix = host_secret.get(..KEY_HEX_LEN)?;
        let mut bytes = hex::decode(prefix).ok()?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Some(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Whether `host_secret` can be used as an encryption key.
pub fn is_valid_host_secret(host_secret: &str) -> bool {
    host_secret.len() >= KEY_HEX_LEN && host_secret.chars().all(|c| c.is_ascii_hexdigit())
}

/// Encrypt `plaintext` into `iv:tag:ciphertext` (hex segments).
pub fn encrypt(plaintext: &str, host_secret: &str) -> Result<String> {
    let key = HostKey::from_secret(host_secret).context("host secret is not a 256-bit hex key")?;

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut buf = plaintext.as_bytes().to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok(format!(
        "{}{sep}{}{sep}{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(buf),
        sep = TRIPLET_SEPARATOR
    ))
}

/// Decrypt a triplet produced by [`encrypt`].
///
/// Returns `None` for malformed input, a wrong key, or a failed tag check.
pub fn decrypt(triplet: &str, host_secret: &str) -> Option<String> {
    let key = HostKey::from_secret(host_secret)?;
    let (iv, tag, mut buf) = split_triplet(triplet)?;

    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            b"",
            &mut buf,
            Tag::from_slice(&tag),
        )
        .ok()?;

    String::from_utf8(buf).ok()
}

/// Whether `value` has the shape of an encrypted triplet.
pub fn looks_encrypted(value: &str) -> bool {
    split_triplet(value).is_some()
}

fn split_triplet(value: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = value.split(TRIPLET_SEPARATOR);
    let (iv, tag, ct) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let iv = hex::decode(iv).ok()?;
    let tag = hex::decode(tag).ok()?;
    let ct = hex::decode(ct).ok()?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return None;
    }
    Some((iv, tag, ct))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    const OTHER: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    #[test]
    fn round_trip() {
        let ct = encrypt("user-token-42", SECRET).unwrap();
        assert_eq!(decrypt(&ct, SECRET).as_deref(), Some("user-token-42"));
    }

    #[test]
    fn fresh_iv_per_call() {
        let a = encrypt("same", SECRET).unwrap();
        let b = encrypt("same", SECRET).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn output_is_three_hex_segments() {
        let ct = encrypt("abc", SECRET).unwrap();
        let parts: Vec<&str> = ct.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 24);
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 6);
        assert!(looks_encrypted(&ct));
    }

    #[test]
    fn wrong_key_fails() {
        let ct = encrypt("secret", SECRET).unwrap();
        assert!(decrypt(&ct, OTHER).is_none());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let ct = encrypt("do not touch", SECRET).unwrap();
        let (head, body) = ct.rsplit_once(':').unwrap();
        let mut bytes = hex::decode(body).unwrap();
        bytes[0] ^= 0x01;
        let tampered = format!("{head}:{}", hex::encode(bytes));
        assert!(decrypt(&tampered, SECRET).is_none());
    }

    #[test]
    fn malformed_input_is_none() {
        assert!(decrypt("", SECRET).is_none());
        assert!(decrypt("plain-token", SECRET).is_none());
        assert!(decrypt("zz:yy:xx", SECRET).is_none());
        assert!(decrypt("00:11:22:33", SECRET).is_none());
        assert!(!looks_encrypted("alice:hunter2"));
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(!is_valid_host_secret("abcd"));
        assert!(!is_valid_host_secret(&"g".repeat(64)));
        assert!(is_valid_host_secret(SECRET));
        assert!(encrypt("x", "abcd").is_err());
        assert!(decrypt(&encrypt("x", SECRET).unwrap(), "abcd").is_none());
    }

    #[test]
    fn longer_secret_uses_first_32_bytes() {
        let long = format!("{SECRET}0123");
        let ct = encrypt("x", &long).unwrap();
        assert_eq!(decrypt(&ct, SECRET).as_deref(), Some("x"));
    }
}
