//! Local key pairs and per-peer encryption contexts.
//!
//! A [`KeyPairManager`] holds one long-lived X25519 key pair plus, at most,
//! one bound remote public key. Encryption to the remote is a sealed box:
//!
//! ```text
//! ephemeral_public (32) || nonce (12) || ChaCha20-Poly1305 ciphertext + tag
//! ```
//!
//! The symmetric key is HKDF-SHA256 over the ephemeral ECDH secret, salted
//! with both public keys. Public keys travel as PEM-style armored text;
//! private key exports are sealed with an Argon2id-derived passphrase key.

use crate::error::{TalkError, TalkResult};
use crate::identity;
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Largest plaintext a single sealed box may carry.
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 16;

/// Bytes a sealed box adds on top of its plaintext.
pub const SEAL_OVERHEAD: usize = KEY_LEN + NONCE_LEN + TAG_LEN;

const HKDF_INFO: &[u8] = b"ciphertalk-v1-seal";

const PUBLIC_LABEL: &str = "CIPHERTALK PUBLIC KEY";
const PRIVATE_LABEL: &str = "CIPHERTALK ENCRYPTED PRIVATE KEY";

/// A peer's imported public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RemotePublicKey(PublicKey);

impl RemotePublicKey {
    /// Parse an armored public key.
    pub fn from_encoded(text: &str) -> TalkResult<Self> {
        let raw = dearmor(PUBLIC_LABEL, text)
            .ok_or_else(|| TalkError::InvalidRemoteKey("not an armored public key".into()))?;
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            TalkError::InvalidRemoteKey(format!("expected {KEY_LEN} key bytes, got {}", raw.len()))
        })?;
        if bytes.iter().all(|b| *b == 0) {
            return Err(TalkError::InvalidRemoteKey("all-zero key".into()));
        }
        Ok(Self(PublicKey::from(bytes)))
    }

    pub fn to_encoded(&self) -> String {
        armor(PUBLIC_LABEL, self.0.as_bytes())
    }

    pub fn fingerprint(&self) -> String {
        identity::fingerprint(self.0.as_bytes())
    }

    /// Seal `plaintext` so only the holder of the matching secret can open it.
    pub fn seal(&self, plaintext: &[u8]) -> TalkResult<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(TalkError::EncryptionFailed(format!(
                "payload of {} bytes exceeds {MAX_PLAINTEXT_LEN}",
                plaintext.len()
            )));
        }

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.0);
        if !shared.was_contributory() {
            return Err(TalkError::EncryptionFailed("low-order remote key".into()));
        }

        let key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &self.0)
            .map_err(TalkError::EncryptionFailed)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| TalkError::EncryptionFailed(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| TalkError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(out)
    }
}

impl fmt::Debug for RemotePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemotePublicKey")
            .field(&self.fingerprint())
            .finish()
    }
}

struct LocalKeyPair {
    secret: StaticSecret,
    public: PublicKey,
    passphrase: Zeroizing<String>,
}

/// A local identity key pair with an optional bound remote key.
///
/// The local pair is shared (reference counted) between a context and its
/// forks; the remote binding never is.
pub struct KeyPairManager {
    local: Arc<LocalKeyPair>,
    remote: Option<RemotePublicKey>,
}

impl KeyPairManager {
    /// Generate a fresh key pair protected by `passphrase`.
    pub fn generate(passphrase: &str) -> TalkResult<Self> {
        if passphrase.is_empty() {
            return Err(TalkError::InvalidPassphrase);
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        Ok(Self::from_secret(secret, passphrase))
    }

    /// Load a key pair previously produced by [`export_local_private`](Self::export_local_private).
    pub fn import_local_private(text: &str, passphrase: &str) -> TalkResult<Self> {
        if passphrase.is_empty() {
            return Err(TalkError::InvalidPassphrase);
        }
        let blob = dearmor(PRIVATE_LABEL, text)
            .ok_or_else(|| TalkError::KeyImport("not an armored private key".into()))?;
        if blob.len() != SALT_LEN + NONCE_LEN + KEY_LEN + TAG_LEN {
            return Err(TalkError::KeyImport(format!(
                "unexpected private key blob length {}",
                blob.len()
            )));
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let key = derive_passphrase_key(passphrase, salt).map_err(TalkError::KeyImport)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| TalkError::KeyImport(e.to_string()))?;
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| TalkError::KeyImport("wrong passphrase or corrupted key".into()))?,
        );

        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(&plain);
        Ok(Self::from_secret(StaticSecret::from(*bytes), passphrase))
    }

    fn from_secret(secret: StaticSecret, passphrase: &str) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            local: Arc::new(LocalKeyPair {
                secret,
                public,
                passphrase: Zeroizing::new(passphrase.to_string()),
            }),
            remote: None,
        }
    }

    /// Pure predicate: does `text` parse as an armored public key?
    pub fn is_valid_public_key_encoding(text: &str) -> bool {
        RemotePublicKey::from_encoded(text).is_ok()
    }

    /// Bind the peer's public key. A context binds at most one remote key.
    pub fn set_remote_public(&mut self, key: RemotePublicKey) -> TalkResult<()> {
        if self.remote.is_some() {
            return Err(TalkError::RemoteKeyAlreadyBound);
        }
        self.remote = Some(key);
        Ok(())
    }

    pub fn set_remote_public_from_encoded(&mut self, text: &str) -> TalkResult<()> {
        let key = RemotePublicKey::from_encoded(text)?;
        self.set_remote_public(key)
    }

    pub fn remote_public(&self) -> Option<&RemotePublicKey> {
        self.remote.as_ref()
    }

    pub fn encrypt_to_remote(&self, plaintext: &[u8]) -> TalkResult<Vec<u8>> {
        self.remote
            .as_ref()
            .ok_or(TalkError::NoRemoteKeyBound)?
            .seal(plaintext)
    }

    /// Open a sealed box addressed to the local key.
    pub fn decrypt_from_remote(&self, sealed: &[u8]) -> TalkResult<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(TalkError::DecryptionFailed);
        }
        let (ephemeral, rest) = sealed.split_at(KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let ephemeral: [u8; KEY_LEN] = ephemeral
            .try_into()
            .map_err(|_| TalkError::DecryptionFailed)?;
        let ephemeral_public = PublicKey::from(ephemeral);
        let shared = self.local.secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(TalkError::DecryptionFailed);
        }

        let key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &self.local.public)
            .map_err(|_| TalkError::DecryptionFailed)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|_| TalkError::DecryptionFailed)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TalkError::DecryptionFailed)
    }

    pub fn export_local_public(&self) -> String {
        armor(PUBLIC_LABEL, self.local.public.as_bytes())
    }

    /// Export the private key, sealed with the passphrase given at generation.
    pub fn export_local_private(&self) -> TalkResult<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = derive_passphrase_key(&self.local.passphrase, &salt)
            .map_err(TalkError::EncryptionFailed)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| TalkError::EncryptionFailed(e.to_string()))?;
        let secret = Zeroizing::new(self.local.secret.to_bytes());
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
            .map_err(|e| TalkError::EncryptionFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend(sealed);
        Ok(armor(PRIVATE_LABEL, &blob))
    }

    /// Fingerprint of the local public key.
    pub fn fingerprint(&self) -> String {
        identity::fingerprint(self.local.public.as_bytes())
    }

    /// A new context over the same local key pair with no remote bound.
    pub fn fork(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            remote: None,
        }
    }
}

impl fmt::Debug for KeyPairManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairManager")
            .field("local", &self.fingerprint())
            .field("remote", &self.remote)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn derive_seal_key(
    shared: &[u8; KEY_LEN],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut salt = [0u8; 2 * KEY_LEN];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(HKDF_INFO, key.as_mut_slice())
        .map_err(|e| format!("key derivation failed: {e}"))?;
    Ok(key)
}

fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| format!("passphrase derivation failed: {e}"))?;
    Ok(key)
}

// ── Armor helpers ─────────────────────────────────────────────────────

fn armor(label: &str, bytes: &[u8]) -> String {
    let body = BASE64.encode(bytes);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn dearmor(label: &str, text: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let mut lines = text.trim().lines().map(str::trim);
    if lines.next()? != begin {
        return None;
    }
    let mut body = String::new();
    let mut closed = false;
    for line in lines {
        if closed {
            return None;
        }
        if line == end {
            closed = true;
        } else {
            body.push_str(line);
        }
    }
    if !closed || body.is_empty() {
        return None;
    }
    BASE64.decode(body).ok()
}
