/// Sealing and unsealing of serialized envelopes.
///
/// All cryptographic material is derived deterministically from the
/// user-held backup seed via HKDF-SHA256, so restoring on a new device
/// reproduces the original keys. Sealing is encrypt-then-MAC:
/// X25519 ephemeral Diffie-Hellman + XChaCha20-Poly1305 for
/// confidentiality, HMAC-SHA256 over the ciphertext for authenticity.
///
/// Wire layout of sealed bytes: `ephemeral_pk(32) || nonce(24) || aead_ct`
/// followed by the 32-byte MAC. There is no length prefix; the MAC length
/// is fixed by the derivation context.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::LarkBackupError;

/// HKDF info strings for domain separation.
const KEY_ID_INFO: &[u8] = b"lark-backup-key-uid-v0";
const ENCRYPTION_KEY_INFO: &[u8] = b"lark-backup-encryption-key-v0";
const MAC_KEY_INFO: &[u8] = b"lark-backup-mac-key-v0";
const SEALING_KEY_INFO: &[u8] = b"lark-backup-sealing-xchacha20poly1305-v0";

/// HMAC-SHA256 output length. The receiver splits `ciphertext || mac` on
/// this fixed boundary.
pub const MAC_LENGTH: usize = 32;

const EPHEMERAL_PK_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 24;

type HmacSha256 = Hmac<Sha256>;

/// The user-held secret from which all backup keys are derived.
#[derive(Clone)]
pub struct BackupSeed(Vec<u8>);

impl BackupSeed {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self(secret.as_ref().to_vec())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Identifier of a backup key, derived from the seed alongside the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackupKeyId([u8; 32]);

impl BackupKeyId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, used as the store's key column.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse the hex form back. Returns `None` on malformed input.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl std::fmt::Display for BackupKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The public half of the derived keys — everything sealing needs.
///
/// This is what gets persisted with the key row; the private key never is.
#[derive(Clone)]
pub struct SealingKeys {
    pub key_id: BackupKeyId,
    pub encryption_public: X25519PublicKey,
    pub mac_key: [u8; 32],
}

/// Full derived key set, including the decryption key. Ephemeral:
/// re-derived on demand from the seed and never persisted.
pub struct DerivedBackupKeys {
    pub key_id: BackupKeyId,
    encryption_secret: X25519Secret,
    pub encryption_public: X25519PublicKey,
    pub mac_key: [u8; 32],
}

impl DerivedBackupKeys {
    /// The persistable public half.
    pub fn sealing_keys(&self) -> SealingKeys {
        SealingKeys {
            key_id: self.key_id,
            encryption_public: self.encryption_public,
            mac_key: self.mac_key,
        }
    }
}

/// Derive the full key set from a backup seed. Deterministic: the same
/// seed always yields the same keys.
pub fn derive_keys(seed: &BackupSeed) -> DerivedBackupKeys {
    let hkdf = Hkdf::<Sha256>::new(None, seed.as_bytes());

    let mut secret_bytes = [0u8; 32];
    hkdf.expand(ENCRYPTION_KEY_INFO, &mut secret_bytes)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    // Standard X25519 clamping
    secret_bytes[0] &= 248;
    secret_bytes[31] &= 127;
    secret_bytes[31] |= 64;
    let encryption_secret = X25519Secret::from(secret_bytes);
    let encryption_public = X25519PublicKey::from(&encryption_secret);

    let mut mac_key = [0u8; 32];
    hkdf.expand(MAC_KEY_INFO, &mut mac_key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");

    let mut key_id = [0u8; 32];
    hkdf.expand(KEY_ID_INFO, &mut key_id)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");

    DerivedBackupKeys {
        key_id: BackupKeyId(key_id),
        encryption_secret,
        encryption_public,
        mac_key,
    }
}

/// Derive the 32-byte AEAD key from a DH shared secret.
fn derive_aead_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SEALING_KEY_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Encrypt-then-MAC a serialized envelope.
///
/// A fresh ephemeral X25519 keypair is generated per call, so sealing the
/// same plaintext twice yields unrelated ciphertexts.
pub fn seal(plaintext: &[u8], keys: &SealingKeys) -> Result<Vec<u8>, LarkBackupError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&keys.encryption_public);
    let aead_key = derive_aead_key(shared_secret.as_bytes());
    let cipher = XChaCha20Poly1305::new(&aead_key.into());

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let aead_ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| LarkBackupError::Crypto(format!("encryption failed: {e}")))?;

    let mut ciphertext =
        Vec::with_capacity(EPHEMERAL_PK_LENGTH + NONCE_LENGTH + aead_ciphertext.len());
    ciphertext.extend_from_slice(ephemeral_public.as_bytes());
    ciphertext.extend_from_slice(&nonce_bytes);
    ciphertext.extend_from_slice(&aead_ciphertext);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.mac_key)
        .map_err(|e| LarkBackupError::Crypto(format!("mac key rejected: {e}")))?;
    mac.update(&ciphertext);
    ciphertext.extend_from_slice(&mac.finalize().into_bytes());

    Ok(ciphertext)
}

/// Verify-then-decrypt sealed bytes.
///
/// Fail-closed ordering: the MAC over the ciphertext is checked (in
/// constant time) before any decryption is attempted.
pub fn unseal(sealed: &[u8], keys: &DerivedBackupKeys) -> Result<Vec<u8>, LarkBackupError> {
    if sealed.len() < MAC_LENGTH {
        return Err(LarkBackupError::MacComputationFailed);
    }
    let (ciphertext, received_mac) = sealed.split_at(sealed.len() - MAC_LENGTH);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.mac_key)
        .map_err(|_| LarkBackupError::MacComputationFailed)?;
    mac.update(ciphertext);
    mac.verify_slice(received_mac)
        .map_err(|_| LarkBackupError::MacComparisonFailed)?;

    // MAC verified; only now touch the ciphertext.
    if ciphertext.len() < EPHEMERAL_PK_LENGTH + NONCE_LENGTH {
        return Err(LarkBackupError::DecryptionFailed);
    }
    let (ephemeral_pk_bytes, rest) = ciphertext.split_at(EPHEMERAL_PK_LENGTH);
    let (nonce_bytes, aead_ciphertext) = rest.split_at(NONCE_LENGTH);

    let ephemeral_pk_bytes: [u8; 32] = ephemeral_pk_bytes
        .try_into()
        .expect("split_at yields exactly 32 bytes");
    let ephemeral_public = X25519PublicKey::from(ephemeral_pk_bytes);

    let shared_secret = keys.encryption_secret.diffie_hellman(&ephemeral_public);
    let aead_key = derive_aead_key(shared_secret.as_bytes());
    let cipher = XChaCha20Poly1305::new(&aead_key.into());

    let nonce_bytes: [u8; 24] = nonce_bytes
        .try_into()
        .expect("split_at yields exactly 24 bytes");
    let nonce = XNonce::from(nonce_bytes);

    cipher
        .decrypt(&nonce, aead_ciphertext)
        .map_err(|_| LarkBackupError::DecryptionFailed)
}
