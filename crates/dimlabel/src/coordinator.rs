//! Two-phase labelled queries: resolve label ranges, splice the resulting
//! index ranges into the main query, then run it.
//!
//! ```text
//! attach_label* -> add_label_range* -> submit_labels -> apply_labels -> submit
//!   Collecting                          Resolved         Applied
//!                                  \-> Failed
//! ```

use crate::datatype::Range;
use crate::error::{DimLabelError, Result};
use crate::label::{LabelPair, LabelResolver, Resolution};
use crate::pool::WorkerPool;
use crate::queue::SyncQueue;
use crate::status::QueryStatus;
use crate::storage::{DataBuffer, Query, QueryType};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol state of a [`LabelledQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelState {
    /// Accepting labels and label ranges.
    Collecting,
    /// Every pending label range resolved; nothing applied yet.
    Resolved,
    /// Resolved index ranges spliced into the main query.
    Applied,
    /// Label resolution failed; the main query will not run.
    Failed,
}

impl fmt::Display for LabelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Collecting => "collecting",
            Self::Resolved => "resolved",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LabelBinding {
    name: String,
    pair: Arc<LabelPair>,
    ranges: Vec<Range>,
    resolver: Option<LabelResolver>,
    data_buffer: Option<DataBuffer>,
}

impl LabelBinding {
    fn resolution(&self) -> Option<&Resolution> {
        self.resolver.as_ref().and_then(LabelResolver::resolution)
    }
}

type ResolveOutcome = (u32, Result<LabelResolver>);

/// A main-array query whose dimensions may be addressed by label.
///
/// # Examples
/// ```rust,ignore
/// use alopex_dimlabel::{LabelledQuery, Range};
///
/// let mut query = LabelledQuery::new(Query::new(&array)?);
/// query.attach_label(0, "x", pair)?;
/// query.add_label_range(0, Range::new(-8i64, -5i64)?)?;
/// query.submit_labels()?;
/// query.apply_labels()?;
/// query.submit()?;
/// ```
#[derive(Debug)]
pub struct LabelledQuery<'a> {
    query: Query<'a>,
    pool: Option<Arc<WorkerPool>>,
    labels: BTreeMap<u32, LabelBinding>,
    state: LabelState,
    resolve_status: QueryStatus,
    label_data_status: QueryStatus,
}

impl<'a> LabelledQuery<'a> {
    /// Wraps a main-array query.
    pub fn new(query: Query<'a>) -> Self {
        Self {
            query,
            pool: None,
            labels: BTreeMap::new(),
            state: LabelState::Collecting,
            resolve_status: QueryStatus::Uninitialized,
            label_data_status: QueryStatus::Uninitialized,
        }
    }

    /// Resolves labelled dimensions in parallel on `pool`.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The wrapped main-array query.
    pub fn query(&self) -> &Query<'a> {
        &self.query
    }

    /// Unwraps the main-array query.
    pub fn into_query(self) -> Query<'a> {
        self.query
    }

    /// Protocol state.
    pub fn state(&self) -> LabelState {
        self.state
    }

    /// Associates `dimension_id` with an open label pair.
    ///
    /// Attaching the same pair under the same name twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` once labels were submitted,
    /// `InvalidArgument` if the dimension is unknown or already has a
    /// different label, `InvalidMode` if the pair is not open for reading,
    /// and `SchemaMismatch` if the pair does not index the dimension.
    pub fn attach_label(
        &mut self,
        dimension_id: u32,
        label_name: &str,
        pair: Arc<LabelPair>,
    ) -> Result<()> {
        self.check_state(LabelState::Collecting, "attach a label")?;
        if let Some(existing) = self.labels.get(&dimension_id) {
            if existing.name == label_name && Arc::ptr_eq(&existing.pair, &pair) {
                return Ok(());
            }
            return Err(DimLabelError::InvalidArgument(format!(
                "dimension {} already has label '{}'",
                dimension_id, existing.name
            )));
        }
        if self.labels.values().any(|b| b.name == label_name) {
            return Err(DimLabelError::InvalidArgument(format!(
                "label '{}' is already attached to another dimension",
                label_name
            )));
        }

        let schema = self.query.array().schema()?;
        let dimension = schema.dimension(dimension_id).ok_or_else(|| {
            DimLabelError::InvalidArgument(format!("no dimension with index {}", dimension_id))
        })?;
        match pair.query_type() {
            Some(QueryType::Read) => {}
            Some(mode) => {
                return Err(DimLabelError::InvalidMode(format!(
                    "label '{}' is open for {}, queries need it open for READ",
                    label_name, mode
                )))
            }
            None => return Err(DimLabelError::NotOpen(pair.uri().display().to_string())),
        }
        pair.schema()?.check_compatible(dimension)?;

        debug!("Attached label '{}' to dimension {}", label_name, dimension_id);
        self.labels.insert(
            dimension_id,
            LabelBinding {
                name: label_name.to_string(),
                pair,
                ranges: Vec::new(),
                resolver: None,
                data_buffer: None,
            },
        );
        Ok(())
    }

    /// Queues a label range on `dimension_id`. Nothing is resolved until
    /// [`submit_labels`](Self::submit_labels).
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if the dimension has no attached label or
    /// labels were already submitted, and `InvalidArgument` for a range of
    /// the wrong datatype or a dimension that already has an index range.
    pub fn add_label_range(&mut self, dimension_id: u32, range: Range) -> Result<()> {
        self.check_state(LabelState::Collecting, "add a label range")?;
        if self.query.subarray().range(dimension_id).is_some() {
            return Err(DimLabelError::InvalidArgument(format!(
                "dimension {} already has an index range",
                dimension_id
            )));
        }
        let binding = self.labels.get_mut(&dimension_id).ok_or_else(|| {
            DimLabelError::OrderingViolation(format!(
                "dimension {} has no attached label",
                dimension_id
            ))
        })?;
        let label_type = binding.pair.schema()?.label_type();
        if range.datatype() != label_type {
            return Err(DimLabelError::InvalidArgument(format!(
                "label range {} is {}, label '{}' holds {}",
                range,
                range.datatype(),
                binding.name,
                label_type
            )));
        }
        binding.ranges.push(range);
        Ok(())
    }

    /// Registers a buffer that receives the label values of the cells the
    /// main query reads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown label, a buffer of the
    /// wrong datatype, or a write query.
    pub fn set_label_data_buffer(&mut self, label_name: &str, buffer: DataBuffer) -> Result<()> {
        if self.query.query_type() != QueryType::Read {
            return Err(DimLabelError::InvalidArgument(
                "label data can only be read alongside a read query".to_string(),
            ));
        }
        if self.query.status() != QueryStatus::Uninitialized {
            return Err(DimLabelError::OrderingViolation(
                "query already submitted".to_string(),
            ));
        }
        let binding = self
            .labels
            .values_mut()
            .find(|b| b.name == label_name)
            .ok_or_else(|| {
                DimLabelError::InvalidArgument(format!("no label named '{}'", label_name))
            })?;
        let label_type = binding.pair.schema()?.label_type();
        if buffer.datatype() != label_type {
            return Err(DimLabelError::InvalidArgument(format!(
                "label buffer is {}, label '{}' holds {}",
                buffer.datatype(),
                label_name,
                label_type
            )));
        }
        binding.data_buffer = Some(buffer);
        Ok(())
    }

    /// Resolves every pending label range.
    ///
    /// All or nothing: if any dimension fails, nothing is kept and the
    /// query moves to `Failed`. An empty intersection is not a failure.
    /// With a worker pool and more than one pending dimension, dimensions
    /// resolve in parallel; this call returns once every one has finished.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` unless collecting, or the first error
    /// by dimension order.
    pub fn submit_labels(&mut self) -> Result<()> {
        self.check_state(LabelState::Collecting, "submit labels")?;
        self.resolve_status = QueryStatus::InProgress;

        let pending: Vec<(u32, Arc<LabelPair>, Vec<Range>)> = self
            .labels
            .iter()
            .filter(|(_, b)| !b.ranges.is_empty())
            .map(|(&dim, b)| (dim, Arc::clone(&b.pair), b.ranges.clone()))
            .collect();

        let mut outcomes: Vec<ResolveOutcome> = match &self.pool {
            Some(pool) if pending.len() > 1 => resolve_on_pool(pool, pending),
            _ => pending
                .into_iter()
                .map(|(dim, pair, ranges)| (dim, resolve_dimension(pair, ranges)))
                .collect(),
        };
        outcomes.sort_by_key(|(dim, _)| *dim);

        let mut resolved = Vec::with_capacity(outcomes.len());
        for (dim, outcome) in outcomes {
            match outcome {
                Ok(resolver) => resolved.push((dim, resolver)),
                Err(e) => {
                    self.state = LabelState::Failed;
                    self.resolve_status = QueryStatus::Failed;
                    debug!("Label resolution failed on dimension {}: {}", dim, e);
                    return Err(e);
                }
            }
        }

        let count = resolved.len();
        for (dim, resolver) in resolved {
            if let Some(binding) = self.labels.get_mut(&dim) {
                binding.resolver = Some(resolver);
            }
        }
        self.state = LabelState::Resolved;
        self.resolve_status = QueryStatus::Completed;
        debug!("Resolved labels on {} dimensions", count);
        Ok(())
    }

    /// Splices resolved index ranges into the main query. A dimension
    /// whose labels matched nothing makes the main query select no cells.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` unless labels were just resolved
    /// successfully; the main query is left untouched in that case.
    pub fn apply_labels(&mut self) -> Result<()> {
        self.check_state(LabelState::Resolved, "apply labels")?;
        let mut ranges = Vec::new();
        let mut empty = false;
        for (&dim, binding) in &self.labels {
            match binding.resolution() {
                Some(Resolution::Range(range)) => ranges.push((dim, range.clone())),
                Some(Resolution::Empty { .. }) => empty = true,
                None => {}
            }
        }
        if let Err(e) = self.splice_ranges(ranges, empty) {
            self.state = LabelState::Failed;
            return Err(e);
        }
        self.state = LabelState::Applied;
        debug!(
            "Applied labels; main query empty: {}",
            self.query.subarray().is_empty()
        );
        Ok(())
    }

    /// Sets every range on the main query, or none of them if any is
    /// rejected.
    fn splice_ranges(&mut self, ranges: Vec<(u32, Range)>, empty: bool) -> Result<()> {
        for (dim, range) in &ranges {
            self.query.check_range(*dim, range)?;
        }
        for (dim, range) in ranges {
            self.query.set_range(dim, range)?;
        }
        if empty {
            self.query.mark_empty();
        }
        Ok(())
    }

    /// Runs the main query, then reads label values into every label data
    /// buffer using the index range the query covered on that dimension.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` while label ranges are pending or
    /// unapplied, or after a resolution failure. Otherwise returns the
    /// main query or label data error.
    pub fn submit(&mut self) -> Result<()> {
        match self.state {
            LabelState::Applied => {}
            LabelState::Failed => {
                return Err(DimLabelError::OrderingViolation(
                    "label resolution failed; the query cannot run".to_string(),
                ))
            }
            LabelState::Collecting if self.labels.values().any(|b| !b.ranges.is_empty()) => {
                return Err(DimLabelError::OrderingViolation(
                    "label ranges pending; call submit_labels and apply_labels first".to_string(),
                ))
            }
            LabelState::Resolved if self.labels.values().any(|b| b.resolution().is_some()) => {
                return Err(DimLabelError::OrderingViolation(
                    "resolved label ranges have not been applied".to_string(),
                ))
            }
            LabelState::Collecting | LabelState::Resolved => {}
        }

        self.query.submit()?;
        self.read_label_data()
    }

    fn read_label_data(&mut self) -> Result<()> {
        if self.labels.values().all(|b| b.data_buffer.is_none()) {
            return Ok(());
        }
        self.label_data_status = QueryStatus::InProgress;
        let outcome = self.run_label_reads();
        self.label_data_status = if outcome.is_ok() {
            QueryStatus::Completed
        } else {
            QueryStatus::Failed
        };
        outcome
    }

    fn run_label_reads(&mut self) -> Result<()> {
        let empty = self.query.subarray().is_empty();
        let schema = self.query.array().schema()?;
        for (&dim, binding) in self.labels.iter_mut() {
            let Some(mut buffer) = binding.data_buffer.take() else {
                continue;
            };
            if empty {
                buffer.clear();
                binding.data_buffer = Some(buffer);
                continue;
            }

            let resolver = binding
                .resolver
                .get_or_insert_with(|| LabelResolver::new(Arc::clone(&binding.pair)));
            if resolver.index_range().is_none() {
                let range = match self.query.subarray().range(dim) {
                    Some(range) => range.clone(),
                    None => schema
                        .dimension(dim)
                        .map(|d| d.domain().clone())
                        .ok_or_else(|| {
                            DimLabelError::InvalidArgument(format!(
                                "no dimension with index {}",
                                dim
                            ))
                        })?,
                };
                resolver.set_index_ranges(vec![range])?;
            }
            resolver.set_data_buffer(buffer, false)?;
            resolver.submit_data_query()?;
        }
        Ok(())
    }

    /// Status of the main query.
    pub fn status(&self) -> QueryStatus {
        self.query.status()
    }

    /// Status of label resolution.
    pub fn status_labels(&self) -> QueryStatus {
        self.resolve_status
    }

    /// Status of the label data reads.
    pub fn status_label_data(&self) -> QueryStatus {
        self.label_data_status
    }

    /// Resolution of the label on `dimension_id`, once submitted.
    pub fn resolution(&self, dimension_id: u32) -> Option<&Resolution> {
        self.labels.get(&dimension_id)?.resolution()
    }

    /// Attribute buffer of the main query.
    pub fn buffer(&self, attribute: &str) -> Option<&DataBuffer> {
        self.query.buffer(attribute)
    }

    /// Label data buffer registered under `label_name`.
    pub fn label_data_buffer(&self, label_name: &str) -> Option<&DataBuffer> {
        let binding = self.labels.values().find(|b| b.name == label_name)?;
        binding
            .data_buffer
            .as_ref()
            .or_else(|| binding.resolver.as_ref()?.label_data_buffer())
    }

    fn check_state(&self, expected: LabelState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(DimLabelError::OrderingViolation(format!(
                "cannot {} while labels are {}",
                action, self.state
            )));
        }
        Ok(())
    }
}

fn resolve_dimension(pair: Arc<LabelPair>, ranges: Vec<Range>) -> Result<LabelResolver> {
    let mut resolver = LabelResolver::new(pair);
    for range in ranges {
        resolver.add_label_range(range)?;
    }
    resolver.resolve_labels()?;
    Ok(resolver)
}

/// Resolves each dimension as a pool job and waits for every result.
fn resolve_on_pool(
    pool: &WorkerPool,
    pending: Vec<(u32, Arc<LabelPair>, Vec<Range>)>,
) -> Vec<ResolveOutcome> {
    let results: Arc<SyncQueue<ResolveOutcome>> = Arc::new(SyncQueue::new());
    let mut outcomes = Vec::with_capacity(pending.len());
    let mut dispatched = 0;

    for (dim, pair, ranges) in pending {
        let sink = Arc::clone(&results);
        let submitted = pool.execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| resolve_dimension(pair, ranges)))
                .unwrap_or_else(|_| {
                    Err(DimLabelError::WorkerPanicked(format!(
                        "resolving labels of dimension {}",
                        dim
                    )))
                });
            if !sink.push((dim, outcome)) {
                warn!("Dropped label resolution result for dimension {}", dim);
            }
        });
        match submitted {
            Ok(()) => dispatched += 1,
            Err(e) => outcomes.push((dim, Err(e))),
        }
    }

    while dispatched > 0 {
        match results.pop() {
            Some(outcome) => {
                outcomes.push(outcome);
                dispatched -= 1;
            }
            None => break,
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, SyncMode};
    use crate::datatype::Datatype;
    use crate::storage::{Array, ArraySchema, Attribute, Dimension, EncryptionKey, StorageManager};
    use tempfile::TempDir;

    #[test]
    fn test_rejected_range_splices_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::new(
            StorageConfig::default().with_sync_mode(SyncMode::None),
        ));
        let uri = temp_dir.path().join("main");
        let schema = ArraySchema::new(
            vec![
                Dimension::new("rows", Range::new(1u64, 8u64).unwrap(), 8).unwrap(),
                Dimension::new("cols", Range::new(1u64, 4u64).unwrap(), 4).unwrap(),
            ],
            vec![Attribute::new("a", Datatype::Float32)],
        )
        .unwrap();
        storage
            .create_array(&uri, &schema, &EncryptionKey::none())
            .unwrap();
        let mut array = Array::new(&uri, storage);
        array.open(QueryType::Read, &EncryptionKey::none()).unwrap();

        let mut query = LabelledQuery::new(Query::new(&array).unwrap());
        let ranges = vec![
            (0, Range::new(2u64, 3u64).unwrap()),
            (1, Range::new(3u64, 6u64).unwrap()),
        ];
        assert!(query.splice_ranges(ranges, true).is_err());
        assert_eq!(query.query().subarray().range(0), None);
        assert_eq!(query.query().subarray().range(1), None);
        assert!(!query.query().subarray().is_empty());

        let ranges = vec![
            (0, Range::new(2u64, 3u64).unwrap()),
            (1, Range::new(3u64, 4u64).unwrap()),
        ];
        query.splice_ranges(ranges, false).unwrap();
        assert_eq!(
            query.query().subarray().range(1),
            Some(&Range::new(3u64, 4u64).unwrap())
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LabelState::Collecting.to_string(), "collecting");
        assert_eq!(LabelState::Failed.to_string(), "failed");
    }
}
