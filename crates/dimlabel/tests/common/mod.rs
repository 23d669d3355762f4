//! Shared fixtures: a main array with one labelled dimension.
//!
//! The default dataset has 16 cells. Index `i + 1` carries label `i - 16`
//! and attribute `a1 = 0.1 * (i + 1)` for `i` in `[0, 16)`.

#![allow(dead_code)]

use alopex_dimlabel::storage::{
    Array, ArraySchema, Attribute, DataBuffer, Dimension, EncryptionKey, Query, QueryType,
};
use alopex_dimlabel::{
    Datatype, DimensionLabelSchema, LabelOrder, LabelPair, LabelResolver, Range, StorageConfig,
    StorageManager, SyncMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const LABEL_NAME: &str = "x";
pub const ATTRIBUTE: &str = "a1";

pub struct Fixture {
    pub temp_dir: TempDir,
    pub storage: Arc<StorageManager>,
    pub array_uri: PathBuf,
    pub cells: u64,
}

impl Fixture {
    pub fn label_uri(&self) -> PathBuf {
        self.array_uri.join("__labels").join(LABEL_NAME)
    }

    pub fn pair(&self) -> Arc<LabelPair> {
        Arc::new(LabelPair::new(self.label_uri(), Arc::clone(&self.storage)))
    }

    pub fn open_pair(&self, mode: QueryType) -> Arc<LabelPair> {
        let pair = self.pair();
        pair.open(mode, &EncryptionKey::none()).unwrap();
        pair
    }

    pub fn open_array(&self, mode: QueryType) -> Array {
        let mut array = Array::new(&self.array_uri, Arc::clone(&self.storage));
        array.open(mode, &EncryptionKey::none()).unwrap();
        array
    }

    /// Writes `labels` against indices `1..=labels.len()`.
    pub fn write_labels(&self, labels: &[i64]) {
        let pair = self.open_pair(QueryType::Write);
        let mut resolver = LabelResolver::new(Arc::clone(&pair));
        resolver
            .set_data_buffer(DataBuffer::from_values(labels).unwrap(), true)
            .unwrap();
        resolver
            .set_index_ranges(vec![Range::new(1u64, labels.len() as u64).unwrap()])
            .unwrap();
        resolver.submit_data_query().unwrap();
        pair.close().unwrap();
    }

    pub fn write_attribute(&self) {
        let array = self.open_array(QueryType::Write);
        let mut query = Query::new(&array).unwrap();
        query
            .set_data_buffer(
                ATTRIBUTE,
                DataBuffer::from_values(&attribute_values(self.cells)).unwrap(),
            )
            .unwrap();
        query.submit().unwrap();
    }
}

pub fn storage() -> Arc<StorageManager> {
    Arc::new(StorageManager::new(
        StorageConfig::default().with_sync_mode(SyncMode::None),
    ))
}

pub fn label_schema(order: LabelOrder, cells: u64, label_domain: Range) -> DimensionLabelSchema {
    DimensionLabelSchema::new(
        order,
        Range::new(1u64, cells).unwrap(),
        cells,
        label_domain,
        cells,
    )
    .unwrap()
}

/// Creates a one-dimensional array over `[1, cells]` with label `x`.
pub fn create_fixture_with(order: LabelOrder, cells: u64, label_domain: Range) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let storage = storage();
    let array_uri = temp_dir.path().join("array");

    let mut schema = ArraySchema::new(
        vec![Dimension::new("dim0", Range::new(1u64, cells).unwrap(), cells).unwrap()],
        vec![Attribute::new(ATTRIBUTE, Datatype::Float32)],
    )
    .unwrap();
    schema
        .add_dimension_label(0, LABEL_NAME, label_schema(order, cells, label_domain))
        .unwrap();
    storage
        .create_array(&array_uri, &schema, &EncryptionKey::none())
        .unwrap();

    Fixture {
        temp_dir,
        storage,
        array_uri,
        cells,
    }
}

pub fn create_fixture(order: LabelOrder) -> Fixture {
    create_fixture_with(order, 16, Range::new(-16i64, -1i64).unwrap())
}

/// The 16-cell dataset with labels and attribute values written.
pub fn populated_fixture(order: LabelOrder) -> Fixture {
    let fixture = create_fixture(order);
    fixture.write_labels(&labels(order));
    fixture.write_attribute();
    fixture
}

/// Labels of the default dataset in index order.
pub fn labels(order: LabelOrder) -> Vec<i64> {
    match order {
        LabelOrder::Increasing => (0..16).map(|i| i - 16).collect(),
        LabelOrder::Decreasing => (0..16).map(|i| -1 - i).collect(),
    }
}

pub fn attribute_values(cells: u64) -> Vec<f32> {
    (0..cells).map(|i| 0.1f32 * (i + 1) as f32).collect()
}
