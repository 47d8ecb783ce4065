//! Credential encryption and API-key hashing.
//!
//! Credentials at rest are opaque ciphertext: AES-256-GCM, stored as
//! `base64(iv[12] || ciphertext || tag[16])`. The symmetric key is derived
//! from the operator-supplied master key via PBKDF2-SHA256 with a
//! per-deployment salt kept in the `config` table.

use aes_gcm::aead::{Aead, KeyInit, generic_array::GenericArray};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, bail};
use pbkdf2::pbkdf2_hmac;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

const PBKDF2_ITERATIONS: u32 = 600_000;
const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 12;

pub const MASTER_KEY_ENV: &str = "FUNDING_FLOW_MASTER_KEY";

// ── Key derivation ─────────────────────────────────────

pub fn derive_key(master: &str, salt_b64: &str) -> Result<[u8; KEY_LENGTH]> {
    let salt = base64_decode(salt_b64).context("decoding credential salt")?;
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(master.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    Ok(key)
}

/// Load the deployment salt, generating it on first use.
pub fn ensure_salt(conn: &Connection) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = 'credential_salt'",
            [],
            |row| row.get(0),
        )
        .ok();
    if let Some(salt) = existing {
        return Ok(salt);
    }

    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    let salt = base64_encode(&bytes);
    conn.execute(
        "INSERT INTO config (key, value) VALUES ('credential_salt', ?1)",
        [&salt],
    )?;
    Ok(salt)
}

// ── AES-256-GCM ────────────────────────────────────────

pub fn encrypt(plaintext: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    use rand::Rng;
    let iv: [u8; IV_LENGTH] = rand::rng().random();
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut out = Vec::with_capacity(IV_LENGTH + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(base64_encode(&out))
}

pub fn decrypt(encrypted_b64: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    let data = base64_decode(encrypted_b64).context("decoding credential blob")?;
    if data.len() < IV_LENGTH + 16 {
        bail!("credential blob too short");
    }

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = Nonce::from_slice(&data[..IV_LENGTH]);
    let plaintext = cipher
        .decrypt(nonce, &data[IV_LENGTH..])
        .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;

    String::from_utf8(plaintext).context("decrypted credentials are not valid utf8")
}

// ── API keys ───────────────────────────────────────────

/// Control-surface API keys are stored and compared as hex SHA-256 digests.
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Base64 helpers ─────────────────────────────────────

fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut s = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        s.push(ALPHABET[((n >> 18) & 63) as usize] as char);
        s.push(ALPHABET[((n >> 12) & 63) as usize] as char);
        if chunk.len() > 1 {
            s.push(ALPHABET[((n >> 6) & 63) as usize] as char);
        } else {
            s.push('=');
        }
        if chunk.len() > 2 {
            s.push(ALPHABET[(n & 63) as usize] as char);
        } else {
            s.push('=');
        }
    }
    s
}

fn base64_decode(input: &str) -> Result<Vec<u8>> {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut lookup = [255u8; 256];
    for (i, &c) in ALPHABET.iter().enumerate() {
        lookup[c as usize] = i as u8;
    }

    let bytes: Vec<u8> = input
        .trim_end_matches('=')
        .bytes()
        .filter(|b| lookup[*b as usize] != 255)
        .collect();

    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let mut n = 0u32;
        for (i, &b) in chunk.iter().enumerate() {
            n |= (lookup[b as usize] as u32) << (18 - 6 * i);
        }
        out.push((n >> 16) as u8);
        if chunk.len() > 2 {
            out.push((n >> 8) as u8);
        }
        if chunk.len() > 3 {
            out.push(n as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; KEY_LENGTH];
        let blob = encrypt(r#"{"api_key":"k","api_secret":"s"}"#, &key).unwrap();
        let plain = decrypt(&blob, &key).unwrap();
        assert_eq!(plain, r#"{"api_key":"k","api_secret":"s"}"#);
    }

    #[test]
    fn wrong_key_fails() {
        let blob = encrypt("secret", &[1u8; KEY_LENGTH]).unwrap();
        assert!(decrypt(&blob, &[2u8; KEY_LENGTH]).is_err());
    }

    #[test]
    fn api_key_hash_is_stable_hex() {
        let h = hash_api_key("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_api_key("abc"));
        assert_ne!(h, hash_api_key("abd"));
    }

    #[test]
    fn base64_round_trip() {
        for len in [0usize, 1, 2, 3, 31, 32, 33] {
            let data: Vec<u8> = (0..len as u8).collect();
            assert_eq!(base64_decode(&base64_encode(&data)).unwrap(), data);
        }
    }
}
