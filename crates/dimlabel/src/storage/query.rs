//! Queries against the main array.

use crate::datatype::Range;
use crate::error::{DimLabelError, Result};
use crate::status::{PhaseTracker, QueryStatus};
use crate::storage::fragment;
use crate::storage::{Array, ArraySchema, DataBuffer, QueryType};
use std::collections::BTreeMap;
use tracing::debug;

/// Cell order of query buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// Last dimension varies fastest.
    #[default]
    RowMajor,
    /// First dimension varies fastest.
    ColMajor,
}

/// The region a query touches: at most one range per dimension.
///
/// Dimensions without a range cover their full domain. A subarray marked
/// empty selects no cells at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Subarray {
    ranges: Vec<Option<Range>>,
    empty: bool,
}

impl Subarray {
    fn new(dim_num: usize) -> Self {
        Self {
            ranges: vec![None; dim_num],
            empty: false,
        }
    }

    /// Explicit range on `dimension_id`, if one was set.
    pub fn range(&self, dimension_id: u32) -> Option<&Range> {
        self.ranges.get(dimension_id as usize)?.as_ref()
    }

    /// Returns true if the subarray selects no cells.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    fn bounds(&self, schema: &ArraySchema) -> Vec<(i128, i128)> {
        self.ranges
            .iter()
            .zip(schema.domain_bounds())
            .map(|(range, full)| range.as_ref().and_then(Range::to_i128).unwrap_or(full))
            .collect()
    }
}

/// A read or write query on an open array.
///
/// The query direction follows the mode the array was opened in.
#[derive(Debug)]
pub struct Query<'a> {
    array: &'a Array,
    query_type: QueryType,
    layout: Layout,
    subarray: Subarray,
    buffers: BTreeMap<String, DataBuffer>,
    phase: PhaseTracker,
}

impl<'a> Query<'a> {
    /// Creates a query on an open array.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the array is closed.
    pub fn new(array: &'a Array) -> Result<Self> {
        let schema = array.schema()?;
        let query_type = array
            .query_type()
            .ok_or_else(|| DimLabelError::NotOpen(array.uri().display().to_string()))?;
        Ok(Self {
            array,
            query_type,
            layout: Layout::default(),
            subarray: Subarray::new(schema.dimensions().len()),
            buffers: BTreeMap::new(),
            phase: PhaseTracker::new("query"),
        })
    }

    /// Array the query runs against.
    pub fn array(&self) -> &'a Array {
        self.array
    }

    /// Query direction.
    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Buffer cell order.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Sets the buffer cell order.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        self.check_unsubmitted()?;
        self.layout = layout;
        Ok(())
    }

    /// Current subarray.
    pub fn subarray(&self) -> &Subarray {
        &self.subarray
    }

    /// Restricts `dimension_id` to `range`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown dimension, a datatype
    /// mismatch, a range outside the domain, or a second range on the
    /// same dimension.
    pub fn add_range(&mut self, dimension_id: u32, range: Range) -> Result<()> {
        self.check_unsubmitted()?;
        if self.subarray.range(dimension_id).is_some() {
            return Err(DimLabelError::InvalidArgument(format!(
                "dimension {} already has a range",
                dimension_id
            )));
        }
        self.set_range(dimension_id, range)
    }

    /// Sets the range of a dimension resolved from labels.
    pub(crate) fn set_range(&mut self, dimension_id: u32, range: Range) -> Result<()> {
        self.check_range(dimension_id, &range)?;
        self.subarray.ranges[dimension_id as usize] = Some(range);
        Ok(())
    }

    /// Checks that `range` could be set on `dimension_id` without touching
    /// the subarray.
    pub(crate) fn check_range(&self, dimension_id: u32, range: &Range) -> Result<()> {
        let dimension = self.array.schema()?.dimension(dimension_id).ok_or_else(|| {
            DimLabelError::InvalidArgument(format!("no dimension with index {}", dimension_id))
        })?;
        if range.datatype() != dimension.datatype() {
            return Err(DimLabelError::InvalidArgument(format!(
                "range {} is {}, dimension '{}' is {}",
                range,
                range.datatype(),
                dimension.name(),
                dimension.datatype()
            )));
        }
        if !range.is_subset_of(dimension.domain()) {
            return Err(DimLabelError::InvalidArgument(format!(
                "range {} is outside the domain {} of dimension '{}'",
                range,
                dimension.domain(),
                dimension.name()
            )));
        }
        Ok(())
    }

    /// Makes the subarray select no cells.
    pub(crate) fn mark_empty(&mut self) {
        self.subarray.empty = true;
    }

    /// Sets the buffer that supplies or receives values of `attribute`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown attribute or a buffer of
    /// the wrong datatype.
    pub fn set_data_buffer(&mut self, attribute: &str, buffer: DataBuffer) -> Result<()> {
        self.check_unsubmitted()?;
        let expected = self
            .array
            .schema()?
            .attribute(attribute)
            .ok_or_else(|| {
                DimLabelError::InvalidArgument(format!("unknown attribute '{}'", attribute))
            })?
            .datatype();
        if buffer.datatype() != expected {
            return Err(DimLabelError::InvalidArgument(format!(
                "buffer for '{}' is {}, attribute is {}",
                attribute,
                buffer.datatype(),
                expected
            )));
        }
        self.buffers.insert(attribute.to_string(), buffer);
        Ok(())
    }

    /// Buffer registered for `attribute`.
    pub fn buffer(&self, attribute: &str) -> Option<&DataBuffer> {
        self.buffers.get(attribute)
    }

    /// Removes and returns the buffer registered for `attribute`.
    pub fn take_buffer(&mut self, attribute: &str) -> Option<DataBuffer> {
        self.buffers.remove(attribute)
    }

    /// Status of the query.
    pub fn status(&self) -> QueryStatus {
        self.phase.status()
    }

    /// Executes the query once.
    ///
    /// Reads fill every registered buffer and set its size. Writes need a
    /// buffer for every attribute holding exactly one value per cell.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if already submitted, `BufferUnset` if
    /// buffers are missing, `BufferTooSmall` if a read does not fit, or the
    /// underlying storage error. Any error leaves the status `Failed`.
    pub fn submit(&mut self) -> Result<()> {
        self.phase.begin(0)?;
        let outcome = match self.query_type {
            QueryType::Read => self.run_read(),
            QueryType::Write => self.run_write(),
        };
        debug!(
            "{} query on {} finished: {}",
            self.query_type,
            self.array.uri().display(),
            if outcome.is_ok() { "ok" } else { "failed" }
        );
        self.phase.finish(outcome)
    }

    fn run_read(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(DimLabelError::BufferUnset(
                "read query has no attribute buffers".to_string(),
            ));
        }
        if self.subarray.empty {
            self.buffers.values_mut().for_each(DataBuffer::clear);
            return Ok(());
        }

        let bounds = self.subarray.bounds(self.array.schema()?);
        let cells = fragment::cell_count(&bounds)?;
        for buffer in self.buffers.values() {
            buffer.check_fits(cells)?;
        }
        for (name, buffer) in self.buffers.iter_mut() {
            let data = self.array.read(name, &bounds, self.layout)?;
            buffer.fill(&data)?;
        }
        Ok(())
    }

    fn run_write(&mut self) -> Result<()> {
        if self.subarray.empty {
            return Err(DimLabelError::InvalidArgument(
                "cannot write to an empty subarray".to_string(),
            ));
        }
        let bounds = self.subarray.bounds(self.array.schema()?);
        let columns = self
            .buffers
            .iter()
            .map(|(name, buffer)| (name.clone(), buffer.as_bytes().to_vec()))
            .collect();
        self.array.write(&bounds, self.layout, columns).map(|_| ())
    }

    fn check_unsubmitted(&self) -> Result<()> {
        if self.phase.status() != QueryStatus::Uninitialized {
            return Err(DimLabelError::OrderingViolation(format!(
                "query already {}",
                self.phase.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, SyncMode};
    use crate::datatype::Datatype;
    use crate::storage::{Attribute, Dimension, EncryptionKey, StorageManager};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create(temp_dir: &TempDir) -> (Arc<StorageManager>, std::path::PathBuf) {
        let storage = Arc::new(StorageManager::new(
            StorageConfig::default().with_sync_mode(SyncMode::None),
        ));
        let uri = temp_dir.path().join("main");
        let schema = ArraySchema::new(
            vec![Dimension::new("d", Range::new(1u64, 8u64).unwrap(), 8).unwrap()],
            vec![Attribute::new("a", Datatype::Float32)],
        )
        .unwrap();
        storage
            .create_array(&uri, &schema, &EncryptionKey::none())
            .unwrap();
        (storage, uri)
    }

    #[test]
    fn test_write_then_read_range() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, uri) = create(&temp_dir);

        let mut writer = Array::new(&uri, Arc::clone(&storage));
        writer.open(QueryType::Write, &EncryptionKey::none()).unwrap();
        let mut query = Query::new(&writer).unwrap();
        let values: Vec<f32> = (1..=8).map(|i| i as f32).collect();
        query
            .set_data_buffer("a", DataBuffer::from_values(&values).unwrap())
            .unwrap();
        query.submit().unwrap();
        assert_eq!(query.status(), QueryStatus::Completed);
        assert!(query.submit().is_err());

        let mut reader = Array::new(&uri, storage);
        reader.open(QueryType::Read, &EncryptionKey::none()).unwrap();
        let mut query = Query::new(&reader).unwrap();
        query.add_range(0, Range::new(3u64, 5u64).unwrap()).unwrap();
        query
            .set_data_buffer("a", DataBuffer::with_capacity::<f32>(8).unwrap())
            .unwrap();
        query.submit().unwrap();
        assert_eq!(
            query.buffer("a").unwrap().values::<f32>().unwrap(),
            vec![3.0, 4.0, 5.0]
        );
    }

    #[test]
    fn test_add_range_validation() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, uri) = create(&temp_dir);
        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();
        let mut query = Query::new(&array).unwrap();

        assert!(query.add_range(1, Range::new(1u64, 2u64).unwrap()).is_err());
        assert!(query.add_range(0, Range::new(1i64, 2i64).unwrap()).is_err());
        assert!(query.add_range(0, Range::new(0u64, 2u64).unwrap()).is_err());
        query.add_range(0, Range::new(1u64, 2u64).unwrap()).unwrap();
        assert!(query.add_range(0, Range::new(1u64, 2u64).unwrap()).is_err());
        assert!(query
            .set_data_buffer("a", DataBuffer::with_capacity::<f64>(2).unwrap())
            .is_err());
    }

    #[test]
    fn test_read_failures() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, uri) = create(&temp_dir);
        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();

        let mut query = Query::new(&array).unwrap();
        let err = query.submit().unwrap_err();
        assert!(matches!(err, DimLabelError::BufferUnset(_)));
        assert_eq!(query.status(), QueryStatus::Failed);

        let mut query = Query::new(&array).unwrap();
        query
            .set_data_buffer("a", DataBuffer::with_capacity::<f32>(2).unwrap())
            .unwrap();
        let err = query.submit().unwrap_err();
        assert!(matches!(err, DimLabelError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_huge_read_fails_before_allocating() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::new(
            StorageConfig::default().with_sync_mode(SyncMode::None),
        ));
        let uri = temp_dir.path().join("huge");
        let schema = ArraySchema::new(
            vec![Dimension::new("d", Range::new(0u64, 1u64 << 50).unwrap(), 1024).unwrap()],
            vec![Attribute::new("a", Datatype::Float32)],
        )
        .unwrap();
        storage
            .create_array(&uri, &schema, &EncryptionKey::none())
            .unwrap();

        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();
        let mut query = Query::new(&array).unwrap();
        query
            .set_data_buffer("a", DataBuffer::with_capacity::<f32>(4).unwrap())
            .unwrap();

        let err = query.submit().unwrap_err();
        assert!(matches!(
            err,
            DimLabelError::BufferTooSmall { available: 16, .. }
        ));
        assert_eq!(query.status(), QueryStatus::Failed);
    }

    #[test]
    fn test_check_range_leaves_subarray_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, uri) = create(&temp_dir);
        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();
        let mut query = Query::new(&array).unwrap();

        query.check_range(0, &Range::new(2u64, 4u64).unwrap()).unwrap();
        assert!(query.check_range(0, &Range::new(4u64, 9u64).unwrap()).is_err());
        assert!(query.check_range(0, &Range::new(2i64, 4i64).unwrap()).is_err());
        assert!(query.check_range(3, &Range::new(2u64, 4u64).unwrap()).is_err());
        assert_eq!(query.subarray().range(0), None);

        assert!(query.set_range(0, Range::new(4u64, 9u64).unwrap()).is_err());
        assert_eq!(query.subarray().range(0), None);
    }

    #[test]
    fn test_empty_subarray_reads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (storage, uri) = create(&temp_dir);
        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();

        let mut query = Query::new(&array).unwrap();
        query
            .set_data_buffer("a", DataBuffer::with_capacity::<f32>(2).unwrap())
            .unwrap();
        query.mark_empty();
        query.submit().unwrap();
        assert_eq!(query.buffer("a").unwrap().size(), 0);
        assert!(query.subarray().is_empty());
    }
}
