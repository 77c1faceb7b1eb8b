//! At-rest encryption of face embeddings.
//!
//! Templates are sealed with AES-256-GCM under a single process-wide key.
//! Envelope layout:
//!
//! ```text
//! | version (1) | key id (1) | nonce (12) | ciphertext + tag |
//! ```
//!
//! The version and key id bytes are authenticated as associated data. The
//! plaintext is the embedding dimension (u32 LE), the values (f32 LE each),
//! then the model version as a u16 LE length and UTF-8 bytes.

use crate::types::Embedding;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + NONCE_LEN;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("key store {path}: {source}")]
    KeyStore { path: PathBuf, source: io::Error },
    #[error("key store {path}: expected {KEY_LEN}-byte key, found {len} bytes")]
    InvalidKeyLength { path: PathBuf, len: usize },
    #[error("template encryption failed")]
    Encrypt,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("template too short ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported template version {0}")]
    UnsupportedVersion(u8),
    #[error("template sealed with unknown key id {0}")]
    UnknownKey(u8),
    #[error("template authentication failed (corrupted or wrong key)")]
    Authentication,
    #[error("malformed template payload: {0}")]
    Malformed(&'static str),
}

/// Opaque ciphertext wrapping a serialized [`Embedding`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTemplate(Vec<u8>);

impl EncryptedTemplate {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for EncryptedTemplate {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Source of the symmetric key used for templates.
///
/// The key id is written into every envelope so a rotation scheme can tell
/// which key sealed a template.
pub trait KeyProvider: Send + Sync {
    fn key_id(&self) -> u8;
    fn key(&self) -> &[u8; KEY_LEN];
}

/// Key held in memory, e.g. supplied by a secrets manager.
pub struct StaticKey {
    id: u8,
    key: [u8; KEY_LEN],
}

impl StaticKey {
    pub fn new(id: u8, key: [u8; KEY_LEN]) -> Self {
        Self { id, key }
    }

    pub fn generate(id: u8) -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { id, key }
    }
}

impl KeyProvider for StaticKey {
    fn key_id(&self) -> u8 {
        self.id
    }

    fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl Drop for StaticKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Key persisted as a raw 32-byte blob on disk.
pub struct FileKeyProvider {
    path: PathBuf,
    key: StaticKey,
}

impl FileKeyProvider {
    /// Load the key at `path`, generating and persisting a fresh one if the
    /// file does not exist. The file is created with mode 0600.
    pub fn load_or_generate(path: &Path) -> Result<Self, CipherError> {
        let key_store_err = |source| CipherError::KeyStore { path: path.to_path_buf(), source };

        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(key_store_err)?;
            }
            let key = StaticKey::generate(0);
            match create_key_file(path) {
                Ok(mut file) => {
                    file.write_all(key.key()).map_err(key_store_err)?;
                    file.sync_all().map_err(key_store_err)?;
                    tracing::info!(path = %path.display(), "generated new template key");
                    return Ok(Self { path: path.to_path_buf(), key });
                }
                // Another process created it first; fall through and read theirs.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(key_store_err(e)),
            }
        }

        let mut bytes = fs::read(path).map_err(key_store_err)?;
        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CipherError::InvalidKeyLength { path: path.to_path_buf(), len });
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();

        tracing::debug!(path = %path.display(), "loaded template key");
        Ok(Self { path: path.to_path_buf(), key: StaticKey::new(0, key) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyProvider for FileKeyProvider {
    fn key_id(&self) -> u8 {
        self.key.key_id()
    }

    fn key(&self) -> &[u8; KEY_LEN] {
        self.key.key()
    }
}

#[cfg(unix)]
fn create_key_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn create_key_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// Short SHA-256 fingerprint of a key, safe to log.
pub fn key_fingerprint(key: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}

/// Serialize an embedding deterministically and losslessly.
pub fn serialize_embedding(embedding: &Embedding) -> Vec<u8> {
    let version = embedding.model_version.as_deref().unwrap_or("").as_bytes();
    let mut out = Vec::with_capacity(4 + embedding.values.len() * 4 + 2 + version.len());
    out.extend_from_slice(&(embedding.values.len() as u32).to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&(version.len() as u16).to_le_bytes());
    out.extend_from_slice(version);
    out
}

pub fn deserialize_embedding(bytes: &[u8]) -> Result<Embedding, DecryptionError> {
    let dim_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecryptionError::Malformed("missing dimension"))?;
    let dim = u32::from_le_bytes(dim_bytes) as usize;

    let values_end = dim
        .checked_mul(4)
        .and_then(|n| n.checked_add(4))
        .filter(|&end| end + 2 <= bytes.len())
        .ok_or(DecryptionError::Malformed("dimension exceeds payload"))?;

    let values = bytes[4..values_end]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let version_len = u16::from_le_bytes([bytes[values_end], bytes[values_end + 1]]) as usize;
    let version_bytes = &bytes[values_end + 2..];
    if version_bytes.len() != version_len {
        return Err(DecryptionError::Malformed("model version length mismatch"));
    }
    let model_version = if version_len == 0 {
        None
    } else {
        Some(
            String::from_utf8(version_bytes.to_vec())
                .map_err(|_| DecryptionError::Malformed("model version is not UTF-8"))?,
        )
    };

    Ok(Embedding { values, model_version })
}

/// Encrypts and decrypts embeddings with one key for the process lifetime.
pub struct TemplateCipher {
    cipher: Aes256Gcm,
    key_id: u8,
}

impl TemplateCipher {
    pub fn new(provider: &dyn KeyProvider) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(provider.key()));
        tracing::info!(
            key_id = provider.key_id(),
            fingerprint = %key_fingerprint(provider.key()),
            "template cipher ready"
        );
        Self { cipher, key_id: provider.key_id() }
    }

    pub fn encrypt(&self, embedding: &Embedding) -> Result<EncryptedTemplate, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = [ENVELOPE_VERSION, self.key_id];
        let mut plaintext = serialize_embedding(embedding);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &plaintext, aad: &aad })
            .map_err(|_| CipherError::Encrypt);
        plaintext.zeroize();
        let sealed = sealed?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(EncryptedTemplate(out))
    }

    pub fn decrypt(&self, template: &EncryptedTemplate) -> Result<Embedding, DecryptionError> {
        let bytes = template.as_bytes();
        if bytes.len() < HEADER_LEN + TAG_LEN {
            return Err(DecryptionError::Truncated(bytes.len()));
        }
        if bytes[0] != ENVELOPE_VERSION {
            return Err(DecryptionError::UnsupportedVersion(bytes[0]));
        }
        if bytes[1] != self.key_id {
            return Err(DecryptionError::UnknownKey(bytes[1]));
        }

        let nonce = Nonce::from_slice(&bytes[2..HEADER_LEN]);
        let mut plaintext = self
            .cipher
            .decrypt(nonce, Payload { msg: &bytes[HEADER_LEN..], aad: &bytes[..2] })
            .map_err(|_| DecryptionError::Authentication)?;

        let embedding = deserialize_embedding(&plaintext);
        plaintext.zeroize();
        embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Embedding {
        Embedding {
            values: vec![0.125, -3.5, f32::MIN_POSITIVE, 1.0e-30, 0.1 + 0.2],
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let cipher = TemplateCipher::new(&StaticKey::generate(0));
        let original = sample();
        let decrypted = cipher.decrypt(&cipher.encrypt(&original).unwrap()).unwrap();
        assert_eq!(decrypted.model_version, original.model_version);
        let a: Vec<u32> = original.values.iter().map(|v| v.to_bits()).collect();
        let b: Vec<u32> = decrypted.values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let e = sample();
        assert_eq!(serialize_embedding(&e), serialize_embedding(&e.clone()));
        assert_eq!(deserialize_embedding(&serialize_embedding(&e)).unwrap(), e);
    }

    #[test]
    fn test_nonce_differs_per_template() {
        let cipher = TemplateCipher::new(&StaticKey::generate(0));
        let a = cipher.encrypt(&sample()).unwrap();
        let b = cipher.encrypt(&sample()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = TemplateCipher::new(&StaticKey::generate(0)).encrypt(&sample()).unwrap();
        let other = TemplateCipher::new(&StaticKey::generate(0));
        assert_eq!(other.decrypt(&sealed), Err(DecryptionError::Authentication));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = TemplateCipher::new(&StaticKey::generate(0));
        let mut bytes = cipher.encrypt(&sample()).unwrap().into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(cipher.decrypt(&bytes.into()), Err(DecryptionError::Authentication));
    }

    #[test]
    fn test_truncated_and_foreign_envelopes() {
        let cipher = TemplateCipher::new(&StaticKey::generate(3));
        assert_eq!(cipher.decrypt(&vec![1u8; 5].into()), Err(DecryptionError::Truncated(5)));

        let mut bytes = cipher.encrypt(&sample()).unwrap().into_bytes();
        bytes[0] = 9;
        assert_eq!(cipher.decrypt(&bytes.clone().into()), Err(DecryptionError::UnsupportedVersion(9)));
        bytes[0] = ENVELOPE_VERSION;
        bytes[1] = 4;
        assert_eq!(cipher.decrypt(&bytes.into()), Err(DecryptionError::UnknownKey(4)));
    }

    #[test]
    fn test_key_file_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("template.key");

        let first = FileKeyProvider::load_or_generate(&path).unwrap();
        let second = FileKeyProvider::load_or_generate(&path).unwrap();
        assert_eq!(first.key(), second.key());
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);

        // Templates sealed under the first load open under the second.
        let sealed = TemplateCipher::new(&first).encrypt(&sample()).unwrap();
        assert!(TemplateCipher::new(&second).decrypt(&sealed).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.key");
        FileKeyProvider::load_or_generate(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_key_file_wrong_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.key");
        fs::write(&path, b"not a key").unwrap();
        assert!(matches!(
            FileKeyProvider::load_or_generate(&path),
            Err(CipherError::InvalidKeyLength { len: 9, .. })
        ));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = [7u8; KEY_LEN];
        assert_eq!(key_fingerprint(&key), key_fingerprint(&key));
        assert_eq!(key_fingerprint(&key).len(), 16);
    }
}
