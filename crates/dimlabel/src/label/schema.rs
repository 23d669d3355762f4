//! Dimension label schemas and creation of the companion arrays.

use crate::datatype::{Datatype, Range};
use crate::error::{DimLabelError, Result};
use crate::storage::codec::{put_range, read_framed_file, write_framed_file, ByteReader};
use crate::storage::{ArraySchema, Attribute, Dimension, EncryptionKey, StorageManager};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Magic bytes of the label schema file.
pub const LABEL_SCHEMA_MAGIC: [u8; 4] = *b"ADLL";

/// Label schema file name inside a label pair directory.
pub const LABEL_SCHEMA_FILE_NAME: &str = "__label_schema.adl";

/// Directory name of the index -> label array.
pub const INDEXED_ARRAY_NAME: &str = "indexed";

/// Directory name of the position -> (label, index) array.
pub const LABELLED_ARRAY_NAME: &str = "labelled";

/// Attribute holding label values in both companion arrays.
pub const LABEL_ATTRIBUTE: &str = "label";

/// Attribute holding index values in the labelled array.
pub const INDEX_ATTRIBUTE: &str = "index";

/// Dimension of the indexed array.
pub const INDEX_DIMENSION: &str = "index";

/// Dimension of the labelled array.
pub const POSITION_DIMENSION: &str = "position";

/// Sort order of label values along the indexed dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LabelOrder {
    /// Labels grow with the index.
    Increasing = 0,
    /// Labels shrink as the index grows.
    Decreasing = 1,
}

impl LabelOrder {
    /// Decodes a stored order code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Increasing),
            1 => Some(Self::Decreasing),
            _ => None,
        }
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
        }
    }

    /// Whether `next` may directly follow `prev` in this order.
    pub fn is_strictly_ordered(self, datatype: Datatype, prev: &[u8], next: &[u8]) -> bool {
        let expected = match self {
            Self::Increasing => Ordering::Less,
            Self::Decreasing => Ordering::Greater,
        };
        datatype.compare(prev, next) == expected
    }
}

impl fmt::Display for LabelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema of one dimension label.
///
/// The index side mirrors the labelled dimension; the label side describes
/// the values stored against it.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionLabelSchema {
    label_order: LabelOrder,
    index_domain: Range,
    index_tile_extent: u64,
    label_domain: Range,
    label_tile_extent: u64,
}

impl DimensionLabelSchema {
    /// Creates a label schema. Datatypes are taken from the domains.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the index domain is not integer typed,
    /// the index tile extent does not fit it, or the label tile extent is
    /// zero.
    pub fn new(
        label_order: LabelOrder,
        index_domain: Range,
        index_tile_extent: u64,
        label_domain: Range,
        label_tile_extent: u64,
    ) -> Result<Self> {
        // Reuses the dimension checks: integer domain, extent within it.
        Dimension::new(INDEX_DIMENSION, index_domain.clone(), index_tile_extent)?;
        if label_tile_extent == 0 {
            return Err(DimLabelError::InvalidArgument(
                "label tile extent must be positive".to_string(),
            ));
        }
        Ok(Self {
            label_order,
            index_domain,
            index_tile_extent,
            label_domain,
            label_tile_extent,
        })
    }

    /// Label sort order.
    pub fn label_order(&self) -> LabelOrder {
        self.label_order
    }

    /// Datatype of index values.
    pub fn index_type(&self) -> Datatype {
        self.index_domain.datatype()
    }

    /// Domain of the labelled dimension.
    pub fn index_domain(&self) -> &Range {
        &self.index_domain
    }

    /// Tile extent of the labelled dimension.
    pub fn index_tile_extent(&self) -> u64 {
        self.index_tile_extent
    }

    /// Datatype of label values.
    pub fn label_type(&self) -> Datatype {
        self.label_domain.datatype()
    }

    /// Range every label value must lie in.
    pub fn label_domain(&self) -> &Range {
        &self.label_domain
    }

    /// Tile extent recorded for the label values.
    pub fn label_tile_extent(&self) -> u64 {
        self.label_tile_extent
    }

    /// Number of indices, and so of labels once written.
    pub fn label_count(&self) -> u64 {
        self.index_domain
            .cell_count()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(u64::MAX)
    }

    pub(crate) fn index_bounds(&self) -> (i128, i128) {
        self.index_domain.to_i128().unwrap_or((0, -1))
    }

    /// Fails with `SchemaMismatch` unless the label indexes `dimension`.
    pub fn check_compatible(&self, dimension: &Dimension) -> Result<()> {
        if self.index_type() != dimension.datatype() {
            return Err(DimLabelError::SchemaMismatch(format!(
                "label index type {} does not match dimension '{}' type {}",
                self.index_type(),
                dimension.name(),
                dimension.datatype()
            )));
        }
        if &self.index_domain != dimension.domain() {
            return Err(DimLabelError::SchemaMismatch(format!(
                "label index domain {} does not match dimension '{}' domain {}",
                self.index_domain,
                dimension.name(),
                dimension.domain()
            )));
        }
        Ok(())
    }

    /// Schema of the index -> label array.
    pub fn indexed_array_schema(&self) -> Result<ArraySchema> {
        ArraySchema::new(
            vec![Dimension::new(
                INDEX_DIMENSION,
                self.index_domain.clone(),
                self.index_tile_extent,
            )?],
            vec![Attribute::new(LABEL_ATTRIBUTE, self.label_type())],
        )
    }

    /// Schema of the position -> (label, index) array.
    pub fn labelled_array_schema(&self) -> Result<ArraySchema> {
        let (lo, hi) = self.index_bounds();
        let positions = Range::from_i128(Datatype::UInt64, 0, hi - lo)?;
        ArraySchema::new(
            vec![Dimension::new(
                POSITION_DIMENSION,
                positions,
                self.index_tile_extent,
            )?],
            vec![
                Attribute::new(LABEL_ATTRIBUTE, self.label_type()),
                Attribute::new(INDEX_ATTRIBUTE, self.index_type()),
            ],
        )
    }

    /// Fails with `SchemaMismatch` unless `found` has the dimensions and
    /// attributes of `expected`.
    pub(crate) fn check_companion(
        name: &str,
        expected: &ArraySchema,
        found: &ArraySchema,
    ) -> Result<()> {
        if expected.dimensions() != found.dimensions() || expected.attributes() != found.attributes()
        {
            return Err(DimLabelError::SchemaMismatch(format!(
                "{} array does not match the label schema",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.label_order as u8);
        put_range(out, &self.index_domain);
        out.extend_from_slice(&self.index_tile_extent.to_le_bytes());
        put_range(out, &self.label_domain);
        out.extend_from_slice(&self.label_tile_extent.to_le_bytes());
    }

    pub(crate) fn decode_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let code = reader.read_u8()?;
        let label_order = LabelOrder::from_u8(code)
            .ok_or_else(|| DimLabelError::Corrupt(format!("unknown label order {}", code)))?;
        let index_domain = reader.read_range()?;
        let index_tile_extent = reader.read_u64()?;
        let label_domain = reader.read_range()?;
        let label_tile_extent = reader.read_u64()?;
        Self::new(
            label_order,
            index_domain,
            index_tile_extent,
            label_domain,
            label_tile_extent,
        )
        .map_err(|e| DimLabelError::Corrupt(format!("invalid label schema: {}", e)))
    }

    /// Loads the label schema stored in the pair directory `uri`.
    pub fn load(storage: &StorageManager, uri: &Path) -> Result<Self> {
        let path = uri.join(LABEL_SCHEMA_FILE_NAME);
        if !path.exists() {
            return Err(DimLabelError::ArrayNotFound(uri.to_path_buf()));
        }
        let body = read_framed_file(&path, LABEL_SCHEMA_MAGIC, storage.config().verify_checksums)?;
        let mut reader = ByteReader::new(&body);
        let schema = Self::decode_from(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(DimLabelError::Corrupt(format!(
                "{} trailing bytes after label schema",
                reader.remaining()
            )));
        }
        Ok(schema)
    }
}

/// Creates the label pair directory with its schema and both companion
/// arrays.
pub(crate) fn create_label_pair(
    storage: &StorageManager,
    uri: &Path,
    schema: &DimensionLabelSchema,
    key: &EncryptionKey,
) -> Result<()> {
    if uri.join(LABEL_SCHEMA_FILE_NAME).exists() {
        return Err(DimLabelError::ArrayExists(uri.to_path_buf()));
    }
    fs::create_dir_all(uri)?;

    storage.create_array(
        &uri.join(INDEXED_ARRAY_NAME),
        &schema.indexed_array_schema()?,
        key,
    )?;
    storage.create_array(
        &uri.join(LABELLED_ARRAY_NAME),
        &schema.labelled_array_schema()?,
        key,
    )?;

    let mut body = Vec::new();
    schema.encode_into(&mut body);
    write_framed_file(
        &uri.join(LABEL_SCHEMA_FILE_NAME),
        LABEL_SCHEMA_MAGIC,
        &body,
        storage.config().sync_mode,
    )?;

    debug!(
        "Created {} dimension label at {}",
        schema.label_order(),
        uri.display()
    );
    Ok(())
}
