//! Sealing for the store's secrets channel
//!
//! Uses AES-256-GCM with HKDF key derivation for values that must not sit in
//! plaintext on disk (auth tokens, push credentials). Key material is
//! installation-specific:
//! - A random salt and a random keyfile are created next to the database on
//!   first use, with restricted permissions on unix.
//! - HKDF-SHA256 stretches them into the sealing key.
//! - No hardcoded fallback keys; sealed values from one install do not open
//!   on another.

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;
const KEYFILE_LEN: usize = 32;

const SALT_FILE: &str = ".secrets_salt";
const KEY_FILE: &str = ".secrets_key";

/// Sealing key for one store instance. Zeroized on drop.
pub(crate) struct SecretCipher {
    key: [u8; 32],
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl SecretCipher {
    /// Load (or initialize) the installation key material living in `dir`.
    ///
    /// The same directory always derives the same key, so secrets written
    /// before a restart open after it.
    pub fn load(dir: &Path) -> Result<Self, String> {
        let salt = read_or_create_material(&dir.join(SALT_FILE), SALT_LEN)?;
        let ikm = read_or_create_material(&dir.join(KEY_FILE), KEYFILE_LEN)?;
        let key = derive_key(&salt, &ikm)?;
        Ok(Self { key })
    }

    /// Random key held only in memory. Secrets sealed with it are
    /// unrecoverable after the process exits; used by in-memory stores.
    pub fn ephemeral() -> Result<Self, String> {
        let rng = SystemRandom::new();
        let mut key = [0u8; 32];
        rng.fill(&mut key)
            .map_err(|e| format!("Failed to generate ephemeral key: {:?}", e))?;
        Ok(Self { key })
    }

    /// Seal a value. Returns base64 of nonce || ciphertext || tag.
    pub fn seal(&self, plaintext: &str) -> Result<String, String> {
        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|e| format!("Key error: {:?}", e))?;
        let key = LessSafeKey::new(unbound_key);

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|e| format!("RNG error: {:?}", e))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|e| format!("Encryption error: {:?}", e))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);

        Ok(base64::engine::general_purpose::STANDARD.encode(&sealed))
    }

    /// Open a sealed value produced by `seal`.
    pub fn open_sealed(&self, sealed: &str) -> Result<String, String> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| format!("Base64 decode error: {}", e))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err("Sealed data too short".to_string());
        }

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|e| format!("Key error: {:?}", e))?;
        let key = LessSafeKey::new(unbound_key);

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| "Invalid nonce".to_string())?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| "Decryption failed - wrong key or corrupted data".to_string())?;

        String::from_utf8(plaintext.to_vec()).map_err(|e| format!("UTF-8 decode error: {}", e))
    }
}

/// Read a key-material file, creating it with fresh random bytes if missing
/// or the wrong length.
fn read_or_create_material(path: &PathBuf, len: usize) -> Result<Vec<u8>, String> {
    if path.exists() {
        let data =
            fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        if data.len() == len {
            return Ok(data);
        }
        log::warn!(
            "Key material at {} has unexpected length, regenerating",
            path.display()
        );
    }

    let rng = SystemRandom::new();
    let mut material = vec![0u8; len];
    rng.fill(&mut material)
        .map_err(|e| format!("Failed to generate key material: {:?}", e))?;

    // Restrict permissions where the platform supports it
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
        file.write_all(&material)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, &material)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
    }

    Ok(material)
}

/// HKDF-SHA256 extract-and-expand into a 32-byte sealing key.
fn derive_key(salt: &[u8], ikm: &[u8]) -> Result<[u8; 32], String> {
    let hkdf_salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt);
    let prk = hkdf_salt.extract(ikm);

    let info: &[&[u8]] = &[b"koinonia-sync-secrets-v1"];
    let okm = prk
        .expand(info, KeyLen(32))
        .map_err(|_| "HKDF expansion failed".to_string())?;

    let mut key = [0u8; 32];
    okm.fill(&mut key)
        .map_err(|_| "Failed to fill key bytes".to_string())?;

    Ok(key)
}

/// Key length marker for HKDF output.
struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}
