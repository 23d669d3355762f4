//! Dense array schemas.

use crate::datatype::{Datatype, Range};
use crate::error::{DimLabelError, Result};
use crate::label::DimensionLabelSchema;
use crate::storage::codec::{put_range, put_str, ByteReader};
use crate::storage::EncryptionType;
use std::collections::HashSet;

/// Magic bytes of the schema file.
pub const SCHEMA_MAGIC: [u8; 4] = *b"ADLS";

/// Schema file name inside an array directory.
pub const SCHEMA_FILE_NAME: &str = "__schema.adl";

/// Directory, relative to an array, that holds its dimension labels.
pub const LABELS_DIR: &str = "__labels";

/// One integer dimension of a dense array.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    domain: Range,
    tile_extent: u64,
}

impl Dimension {
    /// Creates a dimension over `domain`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a float domain or a tile extent that
    /// is zero or larger than the domain.
    pub fn new(name: impl Into<String>, domain: Range, tile_extent: u64) -> Result<Self> {
        let name = name.into();
        let cells = domain.cell_count().ok_or_else(|| {
            DimLabelError::InvalidArgument(format!(
                "dimension '{}' must have an integer datatype, got {}",
                name,
                domain.datatype()
            ))
        })?;
        if tile_extent == 0 || u128::from(tile_extent) > cells {
            return Err(DimLabelError::InvalidArgument(format!(
                "tile extent {} is invalid for dimension '{}' with domain {}",
                tile_extent, name, domain
            )));
        }
        Ok(Self {
            name,
            domain,
            tile_extent,
        })
    }

    /// Dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Datatype of coordinates.
    pub fn datatype(&self) -> Datatype {
        self.domain.datatype()
    }

    /// Inclusive coordinate domain.
    pub fn domain(&self) -> &Range {
        &self.domain
    }

    /// Space tile extent.
    pub fn tile_extent(&self) -> u64 {
        self.tile_extent
    }

    /// Domain bounds as `i128`.
    pub(crate) fn bounds(&self) -> (i128, i128) {
        // Constructors only accept integer domains.
        self.domain.to_i128().unwrap_or((0, -1))
    }
}

/// One fixed-size attribute of a dense array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
}

impl Attribute {
    /// Creates an attribute.
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
        }
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cell datatype.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }
}

/// A dimension label attached to one dimension of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionLabelReference {
    dimension_id: u32,
    name: String,
    uri: String,
    schema: DimensionLabelSchema,
}

impl DimensionLabelReference {
    /// Dimension the label addresses.
    pub fn dimension_id(&self) -> u32 {
        self.dimension_id
    }

    /// Label name, unique within the array.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the label pair, relative to the array.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Label schema.
    pub fn schema(&self) -> &DimensionLabelSchema {
        &self.schema
    }
}

/// Schema of a dense array: dimensions, attributes and attached labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
    encryption_type: EncryptionType,
    dimension_labels: Vec<DimensionLabelReference>,
}

impl ArraySchema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if there are no dimensions or attributes,
    /// or if any name is used twice.
    pub fn new(dimensions: Vec<Dimension>, attributes: Vec<Attribute>) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(DimLabelError::InvalidArgument(
                "array schema needs at least one dimension".to_string(),
            ));
        }
        if attributes.is_empty() {
            return Err(DimLabelError::InvalidArgument(
                "array schema needs at least one attribute".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for name in dimensions
            .iter()
            .map(Dimension::name)
            .chain(attributes.iter().map(Attribute::name))
        {
            if !names.insert(name) {
                return Err(DimLabelError::InvalidArgument(format!(
                    "duplicate dimension or attribute name '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            dimensions,
            attributes,
            encryption_type: EncryptionType::NoEncryption,
            dimension_labels: Vec::new(),
        })
    }

    /// All dimensions in order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Dimension by index.
    pub fn dimension(&self, dimension_id: u32) -> Option<&Dimension> {
        self.dimensions.get(dimension_id as usize)
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> u32 {
        self.dimensions.len() as u32
    }

    /// All attributes in order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Encryption type the array was created with.
    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub(crate) fn set_encryption_type(&mut self, encryption_type: EncryptionType) {
        self.encryption_type = encryption_type;
    }

    /// Domain bounds of every dimension as `i128`.
    pub(crate) fn domain_bounds(&self) -> Vec<(i128, i128)> {
        self.dimensions.iter().map(Dimension::bounds).collect()
    }

    /// Attaches a dimension label to `dimension_id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown dimension or duplicate label
    /// name, and `SchemaMismatch` if the label's index type or domain
    /// differs from the dimension.
    pub fn add_dimension_label(
        &mut self,
        dimension_id: u32,
        name: impl Into<String>,
        schema: DimensionLabelSchema,
    ) -> Result<()> {
        let name = name.into();
        let dimension = self.dimension(dimension_id).ok_or_else(|| {
            DimLabelError::InvalidArgument(format!("no dimension with index {}", dimension_id))
        })?;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(DimLabelError::InvalidArgument(format!(
                "invalid dimension label name '{}'",
                name
            )));
        }
        if self.dimension_label(&name).is_some() {
            return Err(DimLabelError::InvalidArgument(format!(
                "dimension label '{}' already exists",
                name
            )));
        }
        schema.check_compatible(dimension)?;

        let uri = format!("{}/{}", LABELS_DIR, name);
        self.dimension_labels.push(DimensionLabelReference {
            dimension_id,
            name,
            uri,
            schema,
        });
        Ok(())
    }

    /// Every attached dimension label.
    pub fn dimension_labels(&self) -> &[DimensionLabelReference] {
        &self.dimension_labels
    }

    /// Dimension label by name.
    pub fn dimension_label(&self, name: &str) -> Option<&DimensionLabelReference> {
        self.dimension_labels.iter().find(|l| l.name == name)
    }

    /// Encodes the schema body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.encryption_type as u8);

        out.extend_from_slice(&(self.dimensions.len() as u32).to_le_bytes());
        for dim in &self.dimensions {
            put_str(&mut out, &dim.name);
            put_range(&mut out, &dim.domain);
            out.extend_from_slice(&dim.tile_extent.to_le_bytes());
        }

        out.extend_from_slice(&(self.attributes.len() as u32).to_le_bytes());
        for attr in &self.attributes {
            put_str(&mut out, &attr.name);
            out.push(attr.datatype as u8);
        }

        out.extend_from_slice(&(self.dimension_labels.len() as u32).to_le_bytes());
        for label in &self.dimension_labels {
            out.extend_from_slice(&label.dimension_id.to_le_bytes());
            put_str(&mut out, &label.name);
            put_str(&mut out, &label.uri);
            label.schema.encode_into(&mut out);
        }
        out
    }

    /// Decodes a schema body written by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the body is truncated or inconsistent.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let code = reader.read_u8()?;
        let encryption_type = EncryptionType::from_u8(code)
            .ok_or_else(|| DimLabelError::Corrupt(format!("unknown encryption type {}", code)))?;

        let dim_count = reader.read_u32()?;
        let mut dimensions = Vec::new();
        for _ in 0..dim_count {
            let name = reader.read_str()?;
            let domain = reader.read_range()?;
            let tile_extent = reader.read_u64()?;
            dimensions.push(Dimension::new(name, domain, tile_extent).map_err(corrupt)?);
        }

        let attr_count = reader.read_u32()?;
        let mut attributes = Vec::new();
        for _ in 0..attr_count {
            let name = reader.read_str()?;
            let datatype = reader.read_datatype()?;
            attributes.push(Attribute::new(name, datatype));
        }

        let mut schema = Self::new(dimensions, attributes).map_err(corrupt)?;
        schema.encryption_type = encryption_type;

        let label_count = reader.read_u32()?;
        for _ in 0..label_count {
            let dimension_id = reader.read_u32()?;
            let name = reader.read_str()?;
            let uri = reader.read_str()?;
            let label_schema = DimensionLabelSchema::decode_from(&mut reader)?;
            schema.dimension_labels.push(DimensionLabelReference {
                dimension_id,
                name,
                uri,
                schema: label_schema,
            });
        }

        if reader.remaining() != 0 {
            return Err(DimLabelError::Corrupt(format!(
                "{} trailing bytes after schema",
                reader.remaining()
            )));
        }
        Ok(schema)
    }
}

fn corrupt(err: DimLabelError) -> DimLabelError {
    DimLabelError::Corrupt(format!("invalid stored schema: {}", err))
}
