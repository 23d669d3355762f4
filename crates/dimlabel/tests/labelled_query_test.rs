//! End-to-end labelled queries against a main array.

mod common;

use alopex_dimlabel::storage::{
    Array, ArraySchema, Attribute, DataBuffer, Dimension, EncryptionKey, Query, QueryType,
};
use alopex_dimlabel::{
    Datatype, DimLabelError, DimensionLabelSchema, ErrorKind, LabelOrder, LabelPair,
    LabelResolver, LabelState, LabelledQuery, PoolConfig, QueryStatus, Range, WorkerPool,
};
use common::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn read_query(array: &Array, cells: usize) -> Query<'_> {
    let mut query = Query::new(array).unwrap();
    query
        .set_data_buffer(ATTRIBUTE, DataBuffer::with_capacity::<f32>(cells).unwrap())
        .unwrap();
    query
}

#[test]
fn test_read_by_label_range() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 4));
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    query
        .add_label_range(0, Range::new(-8i64, -5i64).unwrap())
        .unwrap();
    query
        .set_label_data_buffer(LABEL_NAME, DataBuffer::with_capacity::<i64>(4).unwrap())
        .unwrap();

    query.submit_labels().unwrap();
    assert_eq!(query.state(), LabelState::Resolved);
    assert_eq!(query.status_labels(), QueryStatus::Completed);
    query.apply_labels().unwrap();
    assert_eq!(
        query.query().subarray().range(0),
        Some(&Range::new(9u64, 12u64).unwrap())
    );
    query.submit().unwrap();

    assert_eq!(query.status(), QueryStatus::Completed);
    assert_eq!(query.status_label_data(), QueryStatus::Completed);
    assert_eq!(
        query.buffer(ATTRIBUTE).unwrap().values::<f32>().unwrap(),
        attribute_values(16)[8..12].to_vec()
    );
    assert_eq!(
        query
            .label_data_buffer(LABEL_NAME)
            .unwrap()
            .values::<i64>()
            .unwrap(),
        vec![-8, -7, -6, -5]
    );
}

#[test]
fn test_apply_before_submit_labels_is_rejected() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 4));
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    query
        .add_label_range(0, Range::new(-8i64, -5i64).unwrap())
        .unwrap();

    let err = query.apply_labels().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    assert_eq!(query.state(), LabelState::Collecting);
    assert!(query.query().subarray().range(0).is_none());
    assert!(!query.query().subarray().is_empty());
}

#[test]
fn test_submit_with_pending_or_unapplied_labels_is_rejected() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 4));
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    query
        .add_label_range(0, Range::new(-8i64, -5i64).unwrap())
        .unwrap();
    assert_eq!(
        query.submit().unwrap_err().kind(),
        ErrorKind::OrderingViolation
    );

    query.submit_labels().unwrap();
    assert_eq!(
        query.submit().unwrap_err().kind(),
        ErrorKind::OrderingViolation
    );
    assert_eq!(query.status(), QueryStatus::Uninitialized);

    // Labels cannot be re-submitted or extended once resolved.
    assert!(query.submit_labels().is_err());
    assert!(query
        .add_label_range(0, Range::new(-2i64, -1i64).unwrap())
        .is_err());
}

#[test]
fn test_empty_label_intersection_reads_nothing() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 16));
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    query
        .add_label_range(0, Range::new(100i64, 200i64).unwrap())
        .unwrap();
    query
        .set_label_data_buffer(LABEL_NAME, DataBuffer::with_capacity::<i64>(16).unwrap())
        .unwrap();

    query.submit_labels().unwrap();
    assert!(query.resolution(0).unwrap().is_empty());
    query.apply_labels().unwrap();
    assert!(query.query().subarray().is_empty());
    query.submit().unwrap();

    assert_eq!(query.status(), QueryStatus::Completed);
    assert_eq!(query.buffer(ATTRIBUTE).unwrap().size(), 0);
    assert!(query.label_data_buffer(LABEL_NAME).unwrap().is_empty());
}

#[test]
fn test_label_data_without_label_ranges() {
    let fixture = populated_fixture(LabelOrder::Decreasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut inner = read_query(&array, 3);
    inner.add_range(0, Range::new(2u64, 4u64).unwrap()).unwrap();
    let mut query = LabelledQuery::new(inner);
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    query
        .set_label_data_buffer(LABEL_NAME, DataBuffer::with_capacity::<i64>(3).unwrap())
        .unwrap();

    // A dimension with an index range takes no label range.
    assert!(query
        .add_label_range(0, Range::new(-4i64, -2i64).unwrap())
        .is_err());

    query.submit().unwrap();
    assert_eq!(
        query
            .label_data_buffer(LABEL_NAME)
            .unwrap()
            .values::<i64>()
            .unwrap(),
        vec![-2, -3, -4]
    );
    assert_eq!(
        query.buffer(ATTRIBUTE).unwrap().values::<f32>().unwrap(),
        attribute_values(16)[1..4].to_vec()
    );
}

#[test]
fn test_label_range_needs_attached_label() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 4));
    let err = query
        .add_label_range(0, Range::new(-8i64, -5i64).unwrap())
        .unwrap_err();
    assert!(matches!(err, DimLabelError::OrderingViolation(_)));
}

#[test]
fn test_attach_checks_mode_and_schema() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let mut query = LabelledQuery::new(read_query(&array, 4));

    let closed = fixture.pair();
    assert!(matches!(
        query.attach_label(0, LABEL_NAME, closed).unwrap_err(),
        DimLabelError::NotOpen(_)
    ));

    let writer = fixture.open_pair(QueryType::Write);
    assert!(matches!(
        query.attach_label(0, LABEL_NAME, writer).unwrap_err(),
        DimLabelError::InvalidMode(_)
    ));

    // A label built for an eight-cell dimension does not fit this one.
    let other = create_fixture_with(
        LabelOrder::Increasing,
        8,
        Range::new(-16i64, -1i64).unwrap(),
    );
    let mismatched = other.open_pair(QueryType::Read);
    let err = query.attach_label(0, "y", mismatched).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);

    assert!(query
        .attach_label(1, LABEL_NAME, fixture.open_pair(QueryType::Read))
        .is_err());
}

#[test]
fn test_attach_same_pair_twice_is_noop() {
    let fixture = populated_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Read);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(read_query(&array, 4));
    query.attach_label(0, LABEL_NAME, Arc::clone(&pair)).unwrap();
    query.attach_label(0, LABEL_NAME, Arc::clone(&pair)).unwrap();
    assert!(query.attach_label(0, "other", pair).is_err());
}

#[test]
fn test_label_data_buffer_rejected_on_write_query() {
    let fixture = create_fixture(LabelOrder::Increasing);
    let array = fixture.open_array(QueryType::Write);
    let pair = fixture.open_pair(QueryType::Read);

    let mut query = LabelledQuery::new(Query::new(&array).unwrap());
    query.attach_label(0, LABEL_NAME, pair).unwrap();
    let err = query
        .set_label_data_buffer(LABEL_NAME, DataBuffer::with_capacity::<i64>(4).unwrap())
        .unwrap_err();
    assert!(matches!(err, DimLabelError::InvalidArgument(_)));
}

#[test]
fn test_write_by_label_range() {
    let fixture = create_fixture(LabelOrder::Increasing);
    fixture.write_labels(&labels(LabelOrder::Increasing));

    {
        let array = fixture.open_array(QueryType::Write);
        let mut inner = Query::new(&array).unwrap();
        inner
            .set_data_buffer(
                ATTRIBUTE,
                DataBuffer::from_values(&[1.5f32, 2.5, 3.5]).unwrap(),
            )
            .unwrap();
        let mut query = LabelledQuery::new(inner);
        query
            .attach_label(0, LABEL_NAME, fixture.open_pair(QueryType::Read))
            .unwrap();
        query
            .add_label_range(0, Range::new(-3i64, -1i64).unwrap())
            .unwrap();
        query.submit_labels().unwrap();
        query.apply_labels().unwrap();
        query.submit().unwrap();
    }

    let array = fixture.open_array(QueryType::Read);
    let mut query = read_query(&array, 3);
    query.add_range(0, Range::new(14u64, 16u64).unwrap()).unwrap();
    query.submit().unwrap();
    assert_eq!(
        query.buffer(ATTRIBUTE).unwrap().values::<f32>().unwrap(),
        vec![1.5, 2.5, 3.5]
    );
}

/// A 4x4 array whose rows carry increasing labels and whose columns carry
/// decreasing ones. Cell `(r, c)` holds `10 * r + c`.
struct Grid {
    _temp_dir: TempDir,
    storage: Arc<alopex_dimlabel::StorageManager>,
    uri: std::path::PathBuf,
}

fn write_grid_labels(storage: &Arc<alopex_dimlabel::StorageManager>, uri: &Path, labels: &[i64]) {
    let pair = Arc::new(LabelPair::new(uri, Arc::clone(storage)));
    pair.open(QueryType::Write, &EncryptionKey::none()).unwrap();
    let mut resolver = LabelResolver::new(Arc::clone(&pair));
    resolver
        .set_data_buffer(DataBuffer::from_values(labels).unwrap(), true)
        .unwrap();
    resolver
        .set_index_ranges(vec![Range::new(1u64, 4u64).unwrap()])
        .unwrap();
    resolver.submit_data_query().unwrap();
    pair.close().unwrap();
}

fn create_grid() -> Grid {
    let temp_dir = TempDir::new().unwrap();
    let storage = common::storage();
    let uri = temp_dir.path().join("grid");

    let mut schema = ArraySchema::new(
        vec![
            Dimension::new("row", Range::new(1u64, 4u64).unwrap(), 2).unwrap(),
            Dimension::new("col", Range::new(1u64, 4u64).unwrap(), 2).unwrap(),
        ],
        vec![Attribute::new(ATTRIBUTE, Datatype::Float32)],
    )
    .unwrap();
    for (dim, name, order) in [(0, "r", LabelOrder::Increasing), (1, "c", LabelOrder::Decreasing)] {
        let label = DimensionLabelSchema::new(
            order,
            Range::new(1u64, 4u64).unwrap(),
            2,
            Range::new(0i64, 100i64).unwrap(),
            10,
        )
        .unwrap();
        schema.add_dimension_label(dim, name, label).unwrap();
    }
    storage
        .create_array(&uri, &schema, &EncryptionKey::none())
        .unwrap();

    write_grid_labels(&storage, &uri.join("__labels").join("r"), &[10, 20, 30, 40]);
    write_grid_labels(&storage, &uri.join("__labels").join("c"), &[40, 30, 20, 10]);

    let mut array = Array::new(&uri, Arc::clone(&storage));
    array.open(QueryType::Write, &EncryptionKey::none()).unwrap();
    let values: Vec<f32> = (1..=4)
        .flat_map(|r| (1..=4).map(move |c| (10 * r + c) as f32))
        .collect();
    let mut query = Query::new(&array).unwrap();
    query
        .set_data_buffer(ATTRIBUTE, DataBuffer::from_values(&values).unwrap())
        .unwrap();
    query.submit().unwrap();
    array.close().unwrap();

    Grid {
        _temp_dir: temp_dir,
        storage,
        uri,
    }
}

impl Grid {
    fn open_pair(&self, name: &str) -> Arc<LabelPair> {
        let pair = Arc::new(LabelPair::new(
            self.uri.join("__labels").join(name),
            Arc::clone(&self.storage),
        ));
        pair.open(QueryType::Read, &EncryptionKey::none()).unwrap();
        pair
    }
}

fn run_grid_query(grid: &Grid, pool: Option<Arc<WorkerPool>>) -> Vec<f32> {
    let mut array = Array::new(&grid.uri, Arc::clone(&grid.storage));
    array.open(QueryType::Read, &EncryptionKey::none()).unwrap();

    let mut query = LabelledQuery::new(read_query(&array, 4));
    if let Some(pool) = pool {
        query = query.with_pool(pool);
    }
    query.attach_label(0, "r", grid.open_pair("r")).unwrap();
    query.attach_label(1, "c", grid.open_pair("c")).unwrap();
    query
        .add_label_range(0, Range::new(20i64, 30i64).unwrap())
        .unwrap();
    query
        .add_label_range(1, Range::new(15i64, 30i64).unwrap())
        .unwrap();
    query.submit_labels().unwrap();

    assert_eq!(
        query.resolution(0).unwrap().range(),
        Some(&Range::new(2u64, 3u64).unwrap())
    );
    assert_eq!(
        query.resolution(1).unwrap().range(),
        Some(&Range::new(2u64, 3u64).unwrap())
    );
    query.apply_labels().unwrap();
    query.submit().unwrap();
    query.buffer(ATTRIBUTE).unwrap().values::<f32>().unwrap()
}

#[test]
fn test_two_labelled_dimensions() {
    let grid = create_grid();
    assert_eq!(run_grid_query(&grid, None), vec![22.0, 23.0, 32.0, 33.0]);
}

#[test]
fn test_parallel_resolution_on_pool() {
    let grid = create_grid();
    let pool = Arc::new(WorkerPool::new(PoolConfig::default().with_threads(2)).unwrap());
    for _ in 0..4 {
        assert_eq!(
            run_grid_query(&grid, Some(Arc::clone(&pool))),
            vec![22.0, 23.0, 32.0, 33.0]
        );
    }
    pool.shutdown();
}

#[test]
fn test_failed_dimension_fails_whole_query() {
    let grid = create_grid();
    let mut array = Array::new(&grid.uri, Arc::clone(&grid.storage));
    array.open(QueryType::Read, &EncryptionKey::none()).unwrap();
    let pool = Arc::new(WorkerPool::new(PoolConfig::default().with_threads(2)).unwrap());

    let mut query = LabelledQuery::new(read_query(&array, 4)).with_pool(pool);
    query.attach_label(0, "r", grid.open_pair("r")).unwrap();
    query.attach_label(1, "c", grid.open_pair("c")).unwrap();
    query
        .add_label_range(0, Range::new(20i64, 30i64).unwrap())
        .unwrap();
    // Two ranges on one label cannot be resolved.
    query
        .add_label_range(1, Range::new(10i64, 15i64).unwrap())
        .unwrap();
    query
        .add_label_range(1, Range::new(30i64, 40i64).unwrap())
        .unwrap();

    let err = query.submit_labels().unwrap_err();
    assert!(matches!(err, DimLabelError::InvalidArgument(_)));
    assert_eq!(query.state(), LabelState::Failed);
    assert_eq!(query.status_labels(), QueryStatus::Failed);
    assert!(query.resolution(0).is_none());
    assert_eq!(
        query.apply_labels().unwrap_err().kind(),
        ErrorKind::OrderingViolation
    );
    assert_eq!(
        query.submit().unwrap_err().kind(),
        ErrorKind::OrderingViolation
    );
    assert!(query.query().subarray().range(0).is_none());
}
