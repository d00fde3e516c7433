//! Field-level encryption for sensitive identity attributes.
//!
//! Phone number and name are encrypted at rest with AES-256-CBC under a key
//! derived per call from the deployment secret: a fresh random 16-byte salt
//! feeds PBKDF2-HMAC-SHA256 (100 000 iterations), and a fresh random 16-byte
//! IV randomizes the ciphertext. The stored blob is
//! `base64(salt || iv || ciphertext)`.
//!
//! Encrypting the same plaintext twice yields two different blobs — equality
//! comparison on ciphertext is meaningless, which is the point: a
//! deterministic scheme would leak which records share a phone number.
//! The cost is that lookups must decrypt, so [`find_by_plaintext`] is a
//! linear scan. That O(n) ceiling is a documented property of the design,
//! not a bug to optimize away.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
/// PBKDF2 iteration count. Deliberately slow — the KDF is the brute-force
/// barrier for the deployment secret.
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("field encryption failed")]
    Encrypt,
    #[error("field decryption failed — wrong secret or corrupted blob")]
    Decrypt,
    #[error("encrypted blob is malformed")]
    Malformed,
    #[error("decrypted field is not valid UTF-8")]
    NotUtf8,
}

/// Stateless cipher bound to one deployment secret.
#[derive(Clone)]
pub struct FieldCipher {
    secret: Vec<u8>,
}

impl FieldCipher {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.secret, salt, PBKDF2_ITERATIONS, &mut key);
        key
    }

    /// Encrypt one field. Fresh salt and IV every call, even for identical
    /// plaintext.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| CryptoError::Encrypt)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt one field. Wrong secret or a corrupted blob is an error —
    /// never a silent fallback to garbage or a default.
    pub fn decrypt_field(&self, blob: &str) -> Result<String, CryptoError> {
        let bytes = BASE64.decode(blob).map_err(|_| CryptoError::Malformed)?;
        if bytes.len() <= SALT_LEN + IV_LEN {
            return Err(CryptoError::Malformed);
        }
        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);
        if ciphertext.len() % 16 != 0 {
            return Err(CryptoError::Malformed);
        }

        let key = self.derive_key(salt);
        let plaintext = Aes256CbcDec::new_from_slices(&key, iv)
            .map_err(|_| CryptoError::Decrypt)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }
}

/// The sensitive attributes attached to one identity record, in either
/// legacy plaintext or encrypted form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedFields {
    /// Legacy plaintext phone number; cleared by migration.
    pub phone: Option<String>,
    /// Legacy plaintext name; cleared by migration.
    pub name: Option<String>,
    pub phone_enc: Option<String>,
    pub name_enc: Option<String>,
    /// RFC3339 migration stamp, set when the record was encrypted.
    pub encrypted_at: Option<String>,
}

impl ProtectedFields {
    pub fn is_migrated(&self) -> bool {
        self.phone_enc.is_some() && self.name_enc.is_some()
    }

    /// Recover `(phone, name)` from whichever form the record carries.
    pub fn identity(&self, cipher: &FieldCipher) -> Result<(String, String), CryptoError> {
        if let (Some(phone_enc), Some(name_enc)) = (&self.phone_enc, &self.name_enc) {
            return Ok((
                cipher.decrypt_field(phone_enc)?,
                cipher.decrypt_field(name_enc)?,
            ));
        }
        match (&self.phone, &self.name) {
            (Some(phone), Some(name)) => Ok((phone.clone(), name.clone())),
            _ => Err(CryptoError::Malformed),
        }
    }
}

/// Linear scan over encrypted records: decrypt each record's protected
/// fields and test the predicate against the plaintext. Records that fail to
/// decrypt (e.g. encrypted under a different secret) are skipped, never
/// fatal to the scan. Returns the indices of matching records.
pub fn find_by_plaintext<F>(
    records: &[ProtectedFields],
    cipher: &FieldCipher,
    predicate: F,
) -> Vec<usize>
where
    F: Fn(&str, &str) -> bool,
{
    let mut matches = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match record.identity(cipher) {
            Ok((phone, name)) => {
                if predicate(&phone, &name) {
                    matches.push(index);
                }
            }
            Err(err) => {
                tracing::debug!(index, error = %err, "record skipped during plaintext scan");
            }
        }
    }
    matches
}

/// Counts from one migration pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MigrationStats {
    pub scanned: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub dry_run: bool,
}

/// Encrypt legacy plaintext fields in place.
///
/// Already-migrated records are skipped, so running the pass twice is
/// idempotent. With `dry_run` the full pass runs — including the encryption
/// work, so it surfaces the same errors a real run would — but nothing is
/// written back. Per-record failures are counted and skipped; the batch
/// continues.
pub fn migrate_legacy_plaintext(
    records: &mut [ProtectedFields],
    cipher: &FieldCipher,
    dry_run: bool,
) -> MigrationStats {
    let mut stats = MigrationStats {
        scanned: records.len(),
        dry_run,
        ..Default::default()
    };

    for record in records.iter_mut() {
        if record.is_migrated() {
            stats.skipped += 1;
            continue;
        }
        let (Some(phone), Some(name)) = (record.phone.clone(), record.name.clone()) else {
            tracing::warn!("record carries neither plaintext nor encrypted identity fields");
            stats.errored += 1;
            continue;
        };

        let encrypted = cipher
            .encrypt_field(&phone)
            .and_then(|p| cipher.encrypt_field(&name).map(|n| (p, n)));
        match encrypted {
            Ok((phone_enc, name_enc)) => {
                if !dry_run {
                    record.phone_enc = Some(phone_enc);
                    record.name_enc = Some(name_enc);
                    record.phone = None;
                    record.name = None;
                    record.encrypted_at = Some(chrono::Utc::now().to_rfc3339());
                }
                stats.migrated += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "record skipped during migration");
                stats.errored += 1;
            }
        }
    }

    tracing::info!(
        scanned = stats.scanned,
        migrated = stats.migrated,
        skipped = stats.skipped,
        errored = stats.errored,
        dry_run,
        "legacy plaintext migration pass complete"
    );
    stats
}
