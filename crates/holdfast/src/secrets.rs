//! AES-256-GCM secret decryption for encrypted manifest documents.
//!
//! Manifests may embed values encrypted with [`encrypt`]; the Pipeline's
//! Decrypt stage resolves an [`Identity`] (a key-file path or an
//! environment variable naming one) and calls [`decrypt`] on every
//! encrypted scalar it finds before handing the document to the resolver.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use sha2::Sha256;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

/// How the decryption passphrase is resolved: an explicit key file, or an
/// environment variable naming one.
#[derive(Debug, Clone)]
pub enum Identity {
    KeyFile(PathBuf),
    EnvVar(String),
}

impl Identity {
    /// The conventional identity for a manifest file: a sibling `<file>.key`
    /// if present, else `HOLDFAST_SECRET_KEY`.
    pub fn for_manifest(manifest_path: &Path) -> Self {
        let sibling = manifest_path.with_extension(format!(
            "{}.key",
            manifest_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("yaml")
        ));
        if sibling.exists() {
            Identity::KeyFile(sibling)
        } else {
            Identity::EnvVar("HOLDFAST_SECRET_KEY".to_string())
        }
    }

    pub fn resolve(&self) -> Result<String> {
        match self {
            Identity::KeyFile(path) => fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .with_context(|| format!("failed to read key file {}", path.display())),
            Identity::EnvVar(name) => std::env::var(name)
                .with_context(|| format!("environment variable {name} is not set")),
        }
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Encrypt `data` under `passphrase`, returning base64(salt || nonce || ciphertext).
pub fn encrypt(data: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let key_bytes = derive_key(passphrase, &salt);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut payload = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(payload))
}

/// Decrypt a base64(salt || nonce || ciphertext) payload produced by [`encrypt`].
pub fn decrypt(encoded: &str, passphrase: &str) -> Result<Vec<u8>> {
    let payload = BASE64
        .decode(encoded.trim())
        .context("encrypted value is not valid base64")?;

    if payload.len() < SALT_SIZE + NONCE_SIZE {
        bail!("encrypted value is too short to contain salt and nonce");
    }

    let (salt, rest) = payload.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let key_bytes = derive_key(passphrase, salt);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupt payload"))
}

/// Heuristic used by the manifest resolver to decide whether a scalar value
/// looks like an [`encrypt`]ed payload (as opposed to plain text that
/// happens to be valid base64).
pub fn looks_encrypted(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.len() < 40 {
        return false;
    }
    BASE64
        .decode(trimmed)
        .map(|bytes| bytes.len() >= SALT_SIZE + NONCE_SIZE + 16)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let plaintext = b"db_password: hunter2";
        let encoded = encrypt(plaintext, "correct horse battery staple").expect("encrypt");
        let decoded = decrypt(&encoded, "correct horse battery staple").expect("decrypt");
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_passphrase_fails() {
        let encoded = encrypt(b"secret", "right-key").expect("encrypt");
        let err = decrypt(&encoded, "wrong-key").expect_err("must fail");
        assert!(err.to_string().contains("decryption failed"));
    }

    #[test]
    fn looks_encrypted_rejects_short_values() {
        assert!(!looks_encrypted("short"));
        assert!(!looks_encrypted(""));
    }

    #[test]
    fn looks_encrypted_accepts_real_ciphertext() {
        let encoded = encrypt(b"some reasonably long secret value here", "k").expect("encrypt");
        assert!(looks_encrypted(&encoded));
    }

    #[test]
    fn identity_resolves_from_key_file() {
        let td = tempdir().expect("tempdir");
        let manifest = td.path().join("stack.yaml");
        let key_file = td.path().join("stack.yaml.key");
        let mut f = fs::File::create(&key_file).expect("create key file");
        writeln!(f, "top-secret-passphrase").expect("write key");

        let identity = Identity::for_manifest(&manifest);
        match &identity {
            Identity::KeyFile(p) => assert_eq!(p, &key_file),
            Identity::EnvVar(_) => panic!("expected key file identity"),
        }
        assert_eq!(identity.resolve().expect("resolve"), "top-secret-passphrase");
    }

    #[test]
    fn identity_falls_back_to_env_var() {
        let td = tempdir().expect("tempdir");
        let manifest = td.path().join("stack.yaml");
        let identity = Identity::for_manifest(&manifest);
        assert!(matches!(identity, Identity::EnvVar(name) if name == "HOLDFAST_SECRET_KEY"));
    }
}
