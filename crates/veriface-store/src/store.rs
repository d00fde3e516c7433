//! SQLite-backed identity record store.
//!
//! Each record is one embedding for one capture direction of one identity.
//! A fully registered identity has exactly one record per required direction;
//! partial sets count as "not registered". Phone number and name are
//! encrypted at rest via [`crate::crypto::FieldCipher`], so any operation
//! addressed by identity (upsert, delete, registration check) resolves the
//! target records with a linear decrypt-and-compare scan.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tokio_rusqlite::Connection;
use veriface_core::matcher::GalleryEntry;
use veriface_core::Embedding;

use crate::crypto::{self, CryptoError, FieldCipher, MigrationStats, ProtectedFields};

pub const EMBEDDING_DIM: usize = 512;
const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

/// Capture directions a complete registration must cover.
pub const REQUIRED_DIRECTIONS: [&str; 5] = ["front", "left", "right", "up", "down"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("unknown capture direction: {0}")]
    UnknownDirection(String),
}

/// Registration completeness for one identity.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistrationStatus {
    pub registered: bool,
    pub directions: Vec<String>,
    pub missing: Vec<String>,
}

/// One stored identity, summarized without embeddings or record ids.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserSummary {
    pub phone: String,
    pub name: String,
    pub direction_count: usize,
    pub registered: bool,
}

/// Record metadata for paging through the raw table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordInfo {
    pub id: String,
    pub direction: String,
    pub encrypted: bool,
    pub created_at: String,
}

/// Identity record store over a single SQLite connection.
///
/// All access funnels through one `tokio_rusqlite` connection, which runs
/// calls sequentially on its own thread. Read-modify-write operations such
/// as upsert therefore do their scan and their writes inside a single call,
/// so they never interleave with another write to the same identity.
#[derive(Clone)]
pub struct IdentityStore {
    conn: Connection,
    cipher: FieldCipher,
}

struct ProtectedRow {
    id: String,
    direction: String,
    fields: ProtectedFields,
}

impl IdentityStore {
    /// Open (or create) the database and run migrations. `secret` is the
    /// deployment secret for field encryption.
    pub async fn open(db_path: &Path, secret: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS identity_records (
                     id TEXT PRIMARY KEY,
                     direction TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     phone TEXT,
                     name TEXT,
                     phone_enc TEXT,
                     name_enc TEXT,
                     encrypted_at TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_records_direction
                     ON identity_records(direction);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            cipher: FieldCipher::new(secret),
        })
    }

    /// Insert or replace the record for `(identity, direction)`.
    ///
    /// Existing records for that pair are deleted first, so re-registering a
    /// direction never accumulates duplicates. The stale-record scan and the
    /// delete-then-insert run inside one connection call, so two concurrent
    /// upserts for the same pair cannot both see an empty stale set.
    /// Returns the new record id.
    pub async fn upsert(
        &self,
        phone: &str,
        name: &str,
        direction: &str,
        embedding: &Embedding,
    ) -> Result<String, StoreError> {
        if !REQUIRED_DIRECTIONS.contains(&direction) {
            return Err(StoreError::UnknownDirection(direction.to_string()));
        }
        validate_embedding_values(&embedding.values)?;
        let blob = embedding_to_bytes(&embedding.values);

        let id = uuid::Uuid::new_v4().to_string();
        let phone_enc = self.cipher.encrypt_field(phone)?;
        let name_enc = self.cipher.encrypt_field(name)?;
        let now = chrono::Utc::now().to_rfc3339();

        let cipher = self.cipher.clone();
        let id_clone = id.clone();
        let phone = phone.to_string();
        let name = name.to_string();
        let direction = direction.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let stale: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, phone, name, phone_enc, name_enc, encrypted_at
                         FROM identity_records WHERE direction = ?1",
                    )?;
                    let rows = stmt.query_map([&direction], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            ProtectedFields {
                                phone: row.get(1)?,
                                name: row.get(2)?,
                                phone_enc: row.get(3)?,
                                name_enc: row.get(4)?,
                                encrypted_at: row.get(5)?,
                            },
                        ))
                    })?;

                    let mut stale = Vec::new();
                    for row in rows {
                        let (row_id, fields) = row?;
                        match fields.identity(&cipher) {
                            Ok((p, n)) if p == phone && n == name => stale.push(row_id),
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!(error = %err, "record skipped during upsert scan");
                            }
                        }
                    }
                    stale
                };

                for old_id in &stale {
                    tx.execute("DELETE FROM identity_records WHERE id = ?1", [old_id])?;
                }
                tx.execute(
                    "INSERT INTO identity_records
                         (id, direction, embedding, phone_enc, name_enc, encrypted_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    rusqlite::params![id_clone, direction, blob, phone_enc, name_enc, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Delete every record belonging to an identity. Returns the number of
    /// records removed (0 when the identity was never registered).
    pub async fn delete_identity(&self, phone: &str, name: &str) -> Result<usize, StoreError> {
        let ids: Vec<String> = self
            .records_for_identity(phone, name)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let count = ids.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute("DELETE FROM identity_records WHERE id = ?1", [id])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::info!(records = count, "identity deleted");
        Ok(count)
    }

    /// Registration completeness: exactly one record per required direction.
    pub async fn check_registration(
        &self,
        phone: &str,
        name: &str,
    ) -> Result<RegistrationStatus, StoreError> {
        let rows = self.records_for_identity(phone, name).await?;
        let mut per_direction: BTreeMap<&str, usize> = BTreeMap::new();
        for row in &rows {
            if let Some(slot) = REQUIRED_DIRECTIONS.iter().find(|d| **d == row.direction) {
                *per_direction.entry(slot).or_insert(0) += 1;
            }
        }

        let directions: Vec<String> = per_direction.keys().map(|d| d.to_string()).collect();
        let missing: Vec<String> = REQUIRED_DIRECTIONS
            .iter()
            .filter(|d| per_direction.get(**d).copied().unwrap_or(0) != 1)
            .map(|d| d.to_string())
            .collect();

        Ok(RegistrationStatus {
            registered: missing.is_empty(),
            directions,
            missing,
        })
    }

    /// Load every stored embedding with its decrypted identity key, for the
    /// in-process gallery search. Records that fail to decrypt (foreign
    /// secret, corrupted blob) are skipped with a warning, not fatal.
    pub async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows: Vec<(Vec<u8>, ProtectedFields)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT embedding, phone, name, phone_enc, name_enc, encrypted_at
                     FROM identity_records ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        ProtectedFields {
                            phone: row.get(1)?,
                            name: row.get(2)?,
                            phone_enc: row.get(3)?,
                            name_enc: row.get(4)?,
                            encrypted_at: row.get(5)?,
                        },
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (blob, fields) in rows {
            let identity_key = match fields.identity(&self.cipher) {
                Ok((phone, name)) => format!("{phone}_{name}"),
                Err(err) => {
                    tracing::warn!(error = %err, "gallery record skipped: identity unreadable");
                    continue;
                }
            };
            let values = bytes_to_embedding_strict(&blob)?;
            gallery.push(GalleryEntry {
                identity_key,
                embedding: Embedding {
                    values,
                    model_version: None,
                },
            });
        }
        Ok(gallery)
    }

    /// All distinct identities with their direction coverage.
    pub async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let rows = self.all_protected_rows().await?;
        let mut grouped: BTreeMap<(String, String), usize> = BTreeMap::new();
        for row in &rows {
            match row.fields.identity(&self.cipher) {
                Ok(identity) => *grouped.entry(identity).or_insert(0) += 1,
                Err(err) => {
                    tracing::warn!(error = %err, "record skipped while listing users");
                }
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((phone, name), direction_count)| UserSummary {
                phone,
                name,
                registered: direction_count == REQUIRED_DIRECTIONS.len(),
                direction_count,
            })
            .collect())
    }

    /// Page through raw records in insertion order. `offset` doubles as the
    /// next-page token.
    pub async fn scroll_records(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordInfo>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, direction, phone_enc IS NOT NULL, created_at
                     FROM identity_records ORDER BY created_at, id
                     LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map([limit as i64, offset as i64], |row| {
                    Ok(RecordInfo {
                        id: row.get(0)?,
                        direction: row.get(1)?,
                        encrypted: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count all stored records.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identity_records", [], |row| {
                        row.get(0)
                    })?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Run the legacy plaintext migration over the whole table.
    pub async fn migrate_legacy(&self, dry_run: bool) -> Result<MigrationStats, StoreError> {
        let rows = self.all_protected_rows().await?;
        let already: Vec<bool> = rows.iter().map(|r| r.fields.is_migrated()).collect();
        let mut fields: Vec<ProtectedFields> = rows.iter().map(|r| r.fields.clone()).collect();

        let stats = crypto::migrate_legacy_plaintext(&mut fields, &self.cipher, dry_run);
        if dry_run {
            return Ok(stats);
        }

        for ((row, was_migrated), updated) in rows.iter().zip(already).zip(fields) {
            if was_migrated || !updated.is_migrated() {
                continue;
            }
            let id = row.id.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE identity_records
                         SET phone = NULL, name = NULL,
                             phone_enc = ?2, name_enc = ?3, encrypted_at = ?4
                         WHERE id = ?1",
                        rusqlite::params![
                            id,
                            updated.phone_enc,
                            updated.name_enc,
                            updated.encrypted_at
                        ],
                    )?;
                    Ok(())
                })
                .await?;
        }
        Ok(stats)
    }

    /// Linear identity resolution: decrypt every record's protected fields
    /// and keep those matching `(phone, name)`. O(n) by design — see
    /// [`crate::crypto`] on why there is no encrypted index.
    async fn records_for_identity(
        &self,
        phone: &str,
        name: &str,
    ) -> Result<Vec<ProtectedRow>, StoreError> {
        let rows = self.all_protected_rows().await?;
        let fields: Vec<ProtectedFields> = rows.iter().map(|r| r.fields.clone()).collect();
        let hits = crypto::find_by_plaintext(&fields, &self.cipher, |p, n| {
            p == phone && n == name
        });

        let mut rows = rows;
        let mut selected = Vec::with_capacity(hits.len());
        for index in hits.into_iter().rev() {
            selected.push(rows.swap_remove(index));
        }
        selected.reverse();
        Ok(selected)
    }

    async fn all_protected_rows(&self) -> Result<Vec<ProtectedRow>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, direction, phone, name, phone_enc, name_enc, encrypted_at
                     FROM identity_records ORDER BY created_at, id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ProtectedRow {
                        id: row.get(0)?,
                        direction: row.get(1)?,
                        fields: ProtectedFields {
                            phone: row.get(2)?,
                            name: row.get(3)?,
                            phone_enc: row.get(4)?,
                            name_enc: row.get(5)?,
                            encrypted_at: row.get(6)?,
                        },
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert a pre-encryption record the way old deployments wrote them.
    #[cfg(test)]
    async fn insert_legacy_plaintext(
        &self,
        phone: &str,
        name: &str,
        direction: &str,
        embedding: &Embedding,
    ) -> Result<String, StoreError> {
        validate_embedding_values(&embedding.values)?;
        let blob = embedding_to_bytes(&embedding.values);
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let id_clone = id.clone();
        let phone = phone.to_string();
        let name = name.to_string();
        let direction = direction.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identity_records
                         (id, direction, embedding, phone, name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id_clone, direction, blob, phone, name, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> IdentityStore {
        IdentityStore::open(Path::new(":memory:"), "test-secret")
            .await
            .unwrap()
    }

    fn embedding(seed: f32) -> Embedding {
        Embedding {
            values: (0..EMBEDDING_DIM)
                .map(|i| (seed + i as f32) / EMBEDDING_DIM as f32)
                .collect(),
            model_version: Some("w600k_r50".to_string()),
        }
    }

    #[tokio::test]
    async fn test_register_all_directions() {
        let store = memory_store().await;
        for (i, direction) in REQUIRED_DIRECTIONS.iter().enumerate() {
            store
                .upsert("010-1234-5678", "alice", direction, &embedding(i as f32))
                .await
                .unwrap();
        }

        let status = store
            .check_registration("010-1234-5678", "alice")
            .await
            .unwrap();
        assert!(status.registered);
        assert_eq!(status.directions.len(), 5);
        assert!(status.missing.is_empty());
        assert_eq!(store.count_all().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_partial_registration_is_incomplete() {
        let store = memory_store().await;
        store
            .upsert("010-1234-5678", "alice", "front", &embedding(0.0))
            .await
            .unwrap();
        store
            .upsert("010-1234-5678", "alice", "left", &embedding(1.0))
            .await
            .unwrap();

        let status = store
            .check_registration("010-1234-5678", "alice")
            .await
            .unwrap();
        assert!(!status.registered);
        assert_eq!(status.directions, vec!["front", "left"]);
        assert_eq!(status.missing, vec!["right", "up", "down"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_direction() {
        let store = memory_store().await;
        let first = store
            .upsert("010-1234-5678", "alice", "front", &embedding(0.0))
            .await
            .unwrap();
        let second = store
            .upsert("010-1234-5678", "alice", "front", &embedding(7.0))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(store.count_all().await.unwrap(), 1);

        let gallery = store.load_gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].embedding.values, embedding(7.0).values);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_one_record_per_direction() {
        let store = memory_store().await;
        let a = store.clone();
        let b = store.clone();

        let embedding_a = embedding(0.0);
        let embedding_b = embedding(7.0);
        let (first, second) = tokio::join!(
            a.upsert("010-1234-5678", "alice", "front", &embedding_a),
            b.upsert("010-1234-5678", "alice", "front", &embedding_b),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(store.count_all().await.unwrap(), 1);
        let status = store
            .check_registration("010-1234-5678", "alice")
            .await
            .unwrap();
        assert_eq!(status.directions, vec!["front"]);
    }

    #[tokio::test]
    async fn test_unknown_direction_rejected() {
        let store = memory_store().await;
        let err = store
            .upsert("010-1234-5678", "alice", "behind", &embedding(0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownDirection(_)));
    }

    #[tokio::test]
    async fn test_delete_identity_scoped() {
        let store = memory_store().await;
        store
            .upsert("010-1111-1111", "alice", "front", &embedding(0.0))
            .await
            .unwrap();
        store
            .upsert("010-2222-2222", "bob", "front", &embedding(1.0))
            .await
            .unwrap();

        assert_eq!(store.delete_identity("010-1111-1111", "alice").await.unwrap(), 1);
        assert_eq!(store.delete_identity("010-1111-1111", "alice").await.unwrap(), 0);
        assert_eq!(store.count_all().await.unwrap(), 1);

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "bob");
    }

    #[tokio::test]
    async fn test_gallery_identity_keys_decrypted() {
        let store = memory_store().await;
        store
            .upsert("010-1234-5678", "alice", "front", &embedding(0.0))
            .await
            .unwrap();

        let gallery = store.load_gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].identity_key, "010-1234-5678_alice");
    }

    #[tokio::test]
    async fn test_identity_fields_not_stored_in_plaintext() {
        let store = memory_store().await;
        store
            .upsert("010-1234-5678", "alice", "front", &embedding(0.0))
            .await
            .unwrap();

        let rows = store.all_protected_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].fields.phone.is_none());
        assert!(rows[0].fields.name.is_none());
        let phone_enc = rows[0].fields.phone_enc.as_deref().unwrap();
        assert!(!phone_enc.contains("010-1234-5678"));
    }

    #[tokio::test]
    async fn test_embedding_roundtrip_bit_exact() {
        let store = memory_store().await;
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[0] = 0.0;
        values[1] = -1.0;
        values[2] = f32::MIN_POSITIVE;
        values[3] = std::f32::consts::PI;
        let emb = Embedding {
            values: values.clone(),
            model_version: None,
        };

        store
            .upsert("010-1234-5678", "alice", "front", &emb)
            .await
            .unwrap();
        let gallery = store.load_gallery().await.unwrap();
        for (orig, rec) in values.iter().zip(gallery[0].embedding.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[tokio::test]
    async fn test_embedding_validation() {
        let store = memory_store().await;

        let short = Embedding {
            values: vec![0.5; 256],
            model_version: None,
        };
        assert!(matches!(
            store.upsert("p", "n", "front", &short).await.unwrap_err(),
            StoreError::InvalidEmbeddingDim(256)
        ));

        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[7] = f32::NAN;
        let nan = Embedding {
            values,
            model_version: None,
        };
        assert!(matches!(
            store.upsert("p", "n", "front", &nan).await.unwrap_err(),
            StoreError::InvalidEmbeddingValue
        ));
    }

    #[tokio::test]
    async fn test_migration_roundtrip_and_idempotence() {
        let store = memory_store().await;
        store
            .insert_legacy_plaintext("010-1111-1111", "alice", "front", &embedding(0.0))
            .await
            .unwrap();
        store
            .insert_legacy_plaintext("010-2222-2222", "bob", "front", &embedding(1.0))
            .await
            .unwrap();

        // Dry run first: reports work to do, writes nothing
        let dry = store.migrate_legacy(true).await.unwrap();
        assert_eq!(dry.migrated, 2);
        let rows = store.all_protected_rows().await.unwrap();
        assert!(rows.iter().all(|r| !r.fields.is_migrated()));

        let first = store.migrate_legacy(false).await.unwrap();
        assert_eq!(first.migrated, 2);
        assert_eq!(first.skipped, 0);

        let second = store.migrate_legacy(false).await.unwrap();
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, 2);

        // Identity resolution still works through the encrypted fields
        let status = store
            .check_registration("010-1111-1111", "alice")
            .await
            .unwrap();
        assert_eq!(status.directions, vec!["front"]);

        let rows = store.all_protected_rows().await.unwrap();
        assert!(rows.iter().all(|r| r.fields.is_migrated()));
        assert!(rows.iter().all(|r| r.fields.phone.is_none()));
    }

    #[tokio::test]
    async fn test_scroll_pagination() {
        let store = memory_store().await;
        for (i, direction) in REQUIRED_DIRECTIONS.iter().enumerate() {
            store
                .upsert("010-1234-5678", "alice", direction, &embedding(i as f32))
                .await
                .unwrap();
        }

        let page1 = store.scroll_records(2, 0).await.unwrap();
        let page2 = store.scroll_records(2, 2).await.unwrap();
        let page3 = store.scroll_records(2, 4).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_eq!(page3.len(), 1);

        let mut ids: Vec<String> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|r| r.id.clone())
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 5, "pages must not overlap");
        assert!(page1.iter().all(|r| r.encrypted));
    }
}
