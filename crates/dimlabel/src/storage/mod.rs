//! Dense array storage used by dimension labels and their parent arrays.
//!
//! Layout of an array directory:
//!
//! ```text
//! <array>/
//! ├── __schema.adl                  schema
//! ├── __frag_0000000000000001.adf   fragments, one per write
//! └── __labels/
//!     └── <label>/
//!         ├── __label_schema.adl
//!         ├── indexed/              index -> label
//!         └── labelled/             position -> (label, index)
//! ```

pub mod array;
pub mod buffer;
pub mod codec;
pub mod fragment;
pub mod query;
pub mod schema;

pub use array::Array;
pub use buffer::DataBuffer;
pub use query::{Layout, Query, Subarray};
pub use schema::{ArraySchema, Attribute, Dimension, DimensionLabelReference};

use crate::config::StorageConfig;
use crate::error::{DimLabelError, Result};
use crate::label;
use codec::{read_framed_file, write_framed_file};
use fragment::Fragment;
use schema::{SCHEMA_FILE_NAME, SCHEMA_MAGIC};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Access mode of an open array or label pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Reads only.
    Read,
    /// Writes only.
    Write,
}

impl QueryType {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption scheme recorded in an array schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EncryptionType {
    /// Unencrypted.
    #[default]
    NoEncryption = 0,
    /// AES-256-GCM with a 32-byte key.
    Aes256Gcm = 1,
}

impl EncryptionType {
    /// Decodes a stored encryption type code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoEncryption),
            1 => Some(Self::Aes256Gcm),
            _ => None,
        }
    }

    /// Required key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::NoEncryption => 0,
            Self::Aes256Gcm => 32,
        }
    }
}

/// Encryption parameters supplied when creating or opening an array.
///
/// Keys are only validated and passed through; array contents are stored
/// as written.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    encryption_type: EncryptionType,
    key: Vec<u8>,
}

impl EncryptionKey {
    /// Parameters for an unencrypted array.
    pub fn none() -> Self {
        Self {
            encryption_type: EncryptionType::NoEncryption,
            key: Vec::new(),
        }
    }

    /// Validates `key` against the length `encryption_type` requires.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the key length is wrong.
    pub fn new(encryption_type: EncryptionType, key: &[u8]) -> Result<Self> {
        if key.len() != encryption_type.key_len() {
            return Err(DimLabelError::InvalidArgument(format!(
                "{:?} requires a {}-byte key, got {} bytes",
                encryption_type,
                encryption_type.key_len(),
                key.len()
            )));
        }
        Ok(Self {
            encryption_type,
            key: key.to_vec(),
        })
    }

    /// Encryption scheme.
    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

impl Default for EncryptionKey {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("encryption_type", &self.encryption_type)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Shared storage context.
///
/// Arrays and label pairs hold it through an `Arc`; it carries the
/// configuration every file read and write goes through.
#[derive(Debug, Default)]
pub struct StorageManager {
    config: StorageConfig,
}

impl StorageManager {
    /// Creates a storage context.
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Creates an array at `uri`, along with every dimension label its
    /// schema carries.
    ///
    /// # Errors
    ///
    /// Returns `ArrayExists` if `uri` already holds an array.
    pub fn create_array(&self, uri: &Path, schema: &ArraySchema, key: &EncryptionKey) -> Result<()> {
        if uri.join(SCHEMA_FILE_NAME).exists() {
            return Err(DimLabelError::ArrayExists(uri.to_path_buf()));
        }
        fs::create_dir_all(uri)?;

        let mut schema = schema.clone();
        schema.set_encryption_type(key.encryption_type());
        for reference in schema.dimension_labels() {
            label::create_label_pair(self, &uri.join(reference.uri()), reference.schema(), key)?;
        }
        write_framed_file(
            &uri.join(SCHEMA_FILE_NAME),
            SCHEMA_MAGIC,
            &schema.encode(),
            self.config.sync_mode,
        )?;

        debug!(
            "Created array {} with {} dimension labels",
            uri.display(),
            schema.dimension_labels().len()
        );
        Ok(())
    }

    /// Loads the schema of the array at `uri`.
    ///
    /// # Errors
    ///
    /// Returns `ArrayNotFound` if `uri` holds no array.
    pub fn load_schema(&self, uri: &Path) -> Result<ArraySchema> {
        let path = uri.join(SCHEMA_FILE_NAME);
        if !path.exists() {
            return Err(DimLabelError::ArrayNotFound(uri.to_path_buf()));
        }
        let body = read_framed_file(&path, SCHEMA_MAGIC, self.config.verify_checksums)?;
        ArraySchema::decode(&body)
    }

    pub(crate) fn load_fragments(&self, uri: &Path) -> Result<Vec<Fragment>> {
        Fragment::load_all(uri, self.config.verify_checksums)
    }

    pub(crate) fn write_fragment(&self, uri: &Path, fragment: &Fragment) -> Result<()> {
        fragment.write(uri, self.config.sync_mode).map(|_| ())
    }
}
