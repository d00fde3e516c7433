//! Persistent identity storage for the verification daemon.
//!
//! Two layers: [`crypto`] handles field-level encryption of personal
//! attributes (phone, name) and their legacy-plaintext migration, [`store`]
//! wraps the SQLite table of direction-tagged embeddings that the gallery
//! search is loaded from.

pub mod crypto;
pub mod store;

pub use crypto::{CryptoError, FieldCipher, MigrationStats, ProtectedFields};
pub use store::{
    IdentityStore, RecordInfo, RegistrationStatus, StoreError, UserSummary, EMBEDDING_DIM,
    REQUIRED_DIRECTIONS,
};
