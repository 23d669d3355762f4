//! Conversion between label space and index space for one label pair.
//!
//! Label ranges are resolved against the labelled array, whose label
//! column is sorted per [`LabelOrder`], with two binary searches over
//! point reads. Index ranges are resolved against the indexed array by
//! reading the labels at both ends.

use crate::datatype::{Datatype, Range};
use crate::error::{DimLabelError, Result};
use crate::label::pair::{LabelPair, OpenPair};
use crate::label::schema::{LabelOrder, INDEX_ATTRIBUTE, LABEL_ATTRIBUTE};
use crate::status::{PhaseTracker, QueryStatus};
use crate::storage::{DataBuffer, Layout, QueryType};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Ranges submitted for conversion, all in one address space.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionRequest {
    /// Label ranges to convert into an index range.
    Labels(Vec<Range>),
    /// Index ranges to convert into a label range.
    Indices(Vec<Range>),
}

/// Outcome of a resolution that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The converse range.
    Range(Range),
    /// The request does not overlap stored data.
    Empty {
        /// The range that was requested.
        requested: Range,
    },
}

impl Resolution {
    /// The resolved range, or `None` for an empty intersection.
    pub fn range(&self) -> Option<&Range> {
        match self {
            Self::Range(range) => Some(range),
            Self::Empty { .. } => None,
        }
    }

    /// Returns true for an empty intersection.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    /// Converts an empty intersection into an `EmptyIntersection` error.
    pub fn into_range(self) -> Result<Range> {
        match self {
            Self::Range(range) => Ok(range),
            Self::Empty { requested } => Err(DimLabelError::EmptyIntersection {
                range: requested.to_string(),
            }),
        }
    }
}

/// Resolves ranges and moves label data for one [`LabelPair`].
///
/// Two phases are tracked independently: label resolution and the label
/// data query. Each runs once per pair generation.
#[derive(Debug)]
pub struct LabelResolver {
    pair: Arc<LabelPair>,
    label_ranges: Vec<Range>,
    index_ranges: Vec<Range>,
    label_buffer: Option<DataBuffer>,
    index_buffer: Option<DataBuffer>,
    resolve_phase: PhaseTracker,
    data_phase: PhaseTracker,
    resolved: Option<Resolution>,
}

impl LabelResolver {
    /// Creates a resolver for `pair`. The pair may be opened later.
    pub fn new(pair: Arc<LabelPair>) -> Self {
        Self {
            pair,
            label_ranges: Vec::new(),
            index_ranges: Vec::new(),
            label_buffer: None,
            index_buffer: None,
            resolve_phase: PhaseTracker::new("label resolution"),
            data_phase: PhaseTracker::new("label data"),
            resolved: None,
        }
    }

    /// Label pair this resolver runs against.
    pub fn pair(&self) -> &Arc<LabelPair> {
        &self.pair
    }

    /// Adds a label range for the next [`resolve_labels`](Self::resolve_labels).
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the pair is closed, or `InvalidArgument` if the
    /// range is not of the label datatype.
    pub fn add_label_range(&mut self, range: Range) -> Result<()> {
        let label_type = self.pair.schema()?.label_type();
        check_datatype("label", &range, label_type)?;
        self.label_ranges.push(range);
        Ok(())
    }

    /// Label ranges added so far.
    pub fn label_ranges(&self) -> &[Range] {
        &self.label_ranges
    }

    /// Replaces the index ranges used by the next data query.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a range has the wrong datatype or lies
    /// outside the index domain.
    pub fn set_index_ranges(&mut self, ranges: Vec<Range>) -> Result<()> {
        let schema = self.pair.schema()?;
        for range in &ranges {
            check_datatype("index", range, schema.index_type())?;
            if !range.is_subset_of(schema.index_domain()) {
                return Err(DimLabelError::InvalidArgument(format!(
                    "index range {} is outside the index domain {}",
                    range,
                    schema.index_domain()
                )));
            }
        }
        self.index_ranges = ranges;
        Ok(())
    }

    /// Index ranges set explicitly.
    pub fn index_ranges(&self) -> &[Range] {
        &self.index_ranges
    }

    /// Resolves the label ranges added with
    /// [`add_label_range`](Self::add_label_range) into an index range.
    pub fn resolve_labels(&mut self) -> Result<Resolution> {
        if self.label_ranges.is_empty() {
            return Err(DimLabelError::InvalidArgument(
                "no label ranges to resolve".to_string(),
            ));
        }
        self.resolve(ResolutionRequest::Labels(self.label_ranges.clone()))
    }

    /// Converts `request` into the converse range.
    ///
    /// An empty intersection is returned as [`Resolution::Empty`], with the
    /// resolution status set to `Failed`, and is not an error.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if this phase already ran against the
    /// current pair generation, `InvalidArgument` for anything other than
    /// exactly one range of the right datatype, or the storage error from
    /// reading the pair.
    pub fn resolve(&mut self, request: ResolutionRequest) -> Result<Resolution> {
        self.resolve_phase.begin(self.pair.generation())?;
        let outcome = self.pair.with_open(|open| match &request {
            ResolutionRequest::Labels(ranges) => {
                let range = single_range("label", ranges, open.schema.label_type())?;
                resolve_label_range(open, range)
            }
            ResolutionRequest::Indices(ranges) => {
                let range = single_range("index", ranges, open.schema.index_type())?;
                resolve_index_range(open, range)
            }
        });
        let resolution = self.resolve_phase.finish(outcome)?;

        debug!(
            "Resolved {:?} on {}: {:?}",
            request,
            self.pair.uri().display(),
            resolution
        );
        if resolution.is_empty() {
            self.resolve_phase.fail();
        }
        if matches!(request, ResolutionRequest::Labels(_)) {
            self.resolved = Some(resolution.clone());
        }
        Ok(resolution)
    }

    /// Outcome of the last label resolution.
    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolved.as_ref()
    }

    /// Index range produced by the last label resolution.
    pub fn index_range(&self) -> Option<&Range> {
        self.resolved.as_ref().and_then(Resolution::range)
    }

    /// Registers the buffer that receives (read) or supplies (write) label
    /// values for the data query.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the buffer datatype is not the label
    /// datatype or `is_write` disagrees with the pair's mode.
    pub fn set_data_buffer(&mut self, buffer: DataBuffer, is_write: bool) -> Result<()> {
        let schema = self.pair.schema()?;
        self.check_direction(is_write)?;
        if buffer.datatype() != schema.label_type() {
            return Err(DimLabelError::InvalidArgument(format!(
                "label buffer is {}, labels are {}",
                buffer.datatype(),
                schema.label_type()
            )));
        }
        self.label_buffer = Some(buffer);
        Ok(())
    }

    /// Registers the index values written alongside the label buffer.
    ///
    /// Write mode only. Takes precedence over an index range.
    pub fn set_index_data_buffer(&mut self, buffer: DataBuffer) -> Result<()> {
        let schema = self.pair.schema()?;
        self.check_direction(true)?;
        if buffer.datatype() != schema.index_type() {
            return Err(DimLabelError::InvalidArgument(format!(
                "index buffer is {}, indices are {}",
                buffer.datatype(),
                schema.index_type()
            )));
        }
        self.index_buffer = Some(buffer);
        Ok(())
    }

    fn check_direction(&self, is_write: bool) -> Result<()> {
        let mode = self
            .pair
            .query_type()
            .ok_or_else(|| DimLabelError::NotOpen(self.pair.uri().display().to_string()))?;
        if (mode == QueryType::Write) != is_write {
            return Err(DimLabelError::InvalidArgument(format!(
                "{} buffer on a label pair open for {}",
                if is_write { "write" } else { "read" },
                mode
            )));
        }
        Ok(())
    }

    /// Label buffer, with its size updated after a read.
    pub fn label_data_buffer(&self) -> Option<&DataBuffer> {
        self.label_buffer.as_ref()
    }

    /// Removes and returns the label buffer.
    pub fn take_label_data_buffer(&mut self) -> Option<DataBuffer> {
        self.label_buffer.take()
    }

    /// Runs the label data query.
    ///
    /// On a read-mode pair, reads the labels of the explicit index ranges,
    /// or else of the range from the last label resolution, into the label
    /// buffer. On a write-mode pair, writes the label buffer to both
    /// companion arrays.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if the phase already ran against this
    /// pair generation, `BufferUnset` / `BufferTooSmall` for buffer
    /// problems, `InvalidArgument` for unordered or out-of-domain labels,
    /// or the storage error. Any error leaves the status `Failed`.
    pub fn submit_data_query(&mut self) -> Result<()> {
        self.data_phase.begin(self.pair.generation())?;
        let pair = Arc::clone(&self.pair);
        let outcome = pair.with_open(|open| match open.mode {
            QueryType::Read => {
                let ranges = match (&self.resolved, self.index_ranges.is_empty()) {
                    (_, false) => self.index_ranges.clone(),
                    (Some(Resolution::Range(range)), true) => vec![range.clone()],
                    (Some(Resolution::Empty { .. }), true) => Vec::new(),
                    (None, true) => {
                        return Err(DimLabelError::OrderingViolation(
                            "no index ranges set and no labels resolved".to_string(),
                        ))
                    }
                };
                let buffer = self
                    .label_buffer
                    .as_mut()
                    .ok_or_else(|| DimLabelError::BufferUnset("label data buffer".to_string()))?;
                read_labels(open, &ranges, buffer)
            }
            QueryType::Write => {
                let labels = self
                    .label_buffer
                    .as_ref()
                    .ok_or_else(|| DimLabelError::BufferUnset("label data buffer".to_string()))?;
                write_labels(open, labels, self.index_buffer.as_ref(), &self.index_ranges)
            }
        });
        self.data_phase.finish(outcome)
    }

    /// Status of the label resolution phase.
    pub fn status_resolve_labels(&self) -> QueryStatus {
        self.resolve_phase.status()
    }

    /// Status of the label data phase.
    pub fn status_data_query(&self) -> QueryStatus {
        self.data_phase.status()
    }
}

fn check_datatype(what: &str, range: &Range, expected: Datatype) -> Result<()> {
    if range.datatype() != expected {
        return Err(DimLabelError::InvalidArgument(format!(
            "{} range {} is {}, expected {}",
            what,
            range,
            range.datatype(),
            expected
        )));
    }
    Ok(())
}

fn single_range<'a>(what: &str, ranges: &'a [Range], expected: Datatype) -> Result<&'a Range> {
    match ranges {
        [range] => {
            check_datatype(what, range, expected)?;
            Ok(range)
        }
        [] => Err(DimLabelError::InvalidArgument(format!(
            "no {} range to resolve",
            what
        ))),
        _ => Err(DimLabelError::InvalidArgument(format!(
            "resolving {} {} ranges at once is not supported",
            ranges.len(),
            what
        ))),
    }
}

/// First position in `[lo, hi)` where `go_left` holds, assuming it is false
/// then true along the range.
fn partition_point(
    mut lo: i128,
    mut hi: i128,
    mut go_left: impl FnMut(i128) -> Result<bool>,
) -> Result<i128> {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if go_left(mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

fn resolve_label_range(open: &OpenPair, requested: &Range) -> Result<Resolution> {
    let empty = || Resolution::Empty {
        requested: requested.clone(),
    };
    let Some(bounds) = open.labelled.non_empty_bounds()? else {
        return Ok(empty());
    };
    let (first, last) = bounds[0];
    let label_type = open.schema.label_type();
    let order = open.schema.label_order();
    let label_at = |position: i128| open.labelled.read_cell(LABEL_ATTRIBUTE, &[position]);
    let cmp = |position: i128, target: &[u8]| -> Result<Ordering> {
        Ok(label_type.compare(&label_at(position)?, target))
    };

    let (low, high) = (requested.start_bytes(), requested.end_bytes());
    // Positions holding labels inside [low, high] form [lower, upper_end).
    let (lower, upper_end) = match order {
        LabelOrder::Increasing => (
            partition_point(first, last + 1, |p| Ok(cmp(p, low)? != Ordering::Less))?,
            partition_point(first, last + 1, |p| Ok(cmp(p, high)? == Ordering::Greater))?,
        ),
        LabelOrder::Decreasing => (
            partition_point(first, last + 1, |p| Ok(cmp(p, high)? != Ordering::Greater))?,
            partition_point(first, last + 1, |p| Ok(cmp(p, low)? == Ordering::Less))?,
        ),
    };
    if lower >= upper_end {
        return Ok(empty());
    }

    let index_type = open.schema.index_type();
    let index_at = |position: i128| -> Result<i128> {
        let bytes = open.labelled.read_cell(INDEX_ATTRIBUTE, &[position])?;
        index_type.decode_i128(&bytes).ok_or_else(|| {
            DimLabelError::Corrupt(format!("unreadable index at position {}", position))
        })
    };
    let a = index_at(lower)?;
    let b = index_at(upper_end - 1)?;
    Range::from_i128(index_type, a.min(b), a.max(b)).map(Resolution::Range)
}

fn resolve_index_range(open: &OpenPair, requested: &Range) -> Result<Resolution> {
    let empty = || Resolution::Empty {
        requested: requested.clone(),
    };
    let Some(bounds) = open.indexed.non_empty_bounds()? else {
        return Ok(empty());
    };
    let (stored_lo, stored_hi) = bounds[0];
    let (req_lo, req_hi) = requested.to_i128().ok_or_else(|| {
        DimLabelError::InvalidArgument(format!("index range {} is not integer typed", requested))
    })?;
    let lo = req_lo.max(stored_lo);
    let hi = req_hi.min(stored_hi);
    if lo > hi {
        return Ok(empty());
    }

    let label_type = open.schema.label_type();
    let a = open.indexed.read_cell(LABEL_ATTRIBUTE, &[lo])?;
    let b = open.indexed.read_cell(LABEL_ATTRIBUTE, &[hi])?;
    let (min, max) = match label_type.compare(&a, &b) {
        Ordering::Greater => (b, a),
        _ => (a, b),
    };
    Range::from_bytes(label_type, &min, &max).map(Resolution::Range)
}

fn read_labels(open: &OpenPair, ranges: &[Range], buffer: &mut DataBuffer) -> Result<()> {
    let bounds = ranges
        .iter()
        .map(|range| {
            range.to_i128().ok_or_else(|| {
                DimLabelError::InvalidArgument(format!("index range {} is not integer typed", range))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let cells = bounds.iter().try_fold(0usize, |acc, &(lo, hi)| {
        usize::try_from(hi - lo + 1)
            .ok()
            .and_then(|extent| acc.checked_add(extent))
            .ok_or_else(|| DimLabelError::InvalidArgument("label read size overflows".to_string()))
    })?;
    buffer.check_fits(cells)?;

    let mut out = Vec::new();
    for (lo, hi) in bounds {
        out.extend(open.indexed.read(LABEL_ATTRIBUTE, &[(lo, hi)], Layout::RowMajor)?);
    }
    if out.is_empty() {
        buffer.clear();
        return Ok(());
    }
    buffer.fill(&out)
}

fn write_labels(
    open: &OpenPair,
    labels: &DataBuffer,
    index_buffer: Option<&DataBuffer>,
    index_ranges: &[Range],
) -> Result<()> {
    let schema = &open.schema;
    let index_type = schema.index_type();
    let label_type = schema.label_type();
    let count = labels.len();

    let indices: Vec<i128> = match (index_buffer, index_ranges) {
        (Some(buffer), _) => buffer
            .as_bytes()
            .chunks_exact(index_type.size())
            .map(|chunk| {
                index_type.decode_i128(chunk).ok_or_else(|| {
                    DimLabelError::InvalidArgument("unreadable index value".to_string())
                })
            })
            .collect::<Result<_>>()?,
        (None, [range]) => {
            let (lo, hi) = range.to_i128().ok_or_else(|| {
                DimLabelError::InvalidArgument(format!("index range {} is not integer typed", range))
            })?;
            if hi - lo + 1 != count as i128 {
                return Err(DimLabelError::InvalidArgument(format!(
                    "{} labels for index range {}",
                    count, range
                )));
            }
            (lo..=hi).collect()
        }
        (None, []) => {
            return Err(DimLabelError::BufferUnset(
                "index data buffer or index range".to_string(),
            ))
        }
        (None, _) => {
            return Err(DimLabelError::InvalidArgument(
                "label writes take a single index range".to_string(),
            ))
        }
    };

    if indices.len() != count {
        return Err(DimLabelError::InvalidArgument(format!(
            "{} labels for {} indices",
            count,
            indices.len()
        )));
    }
    let (domain_lo, domain_hi) = schema.index_bounds();
    let contiguous = indices.windows(2).all(|w| w[1] == w[0] + 1);
    if !contiguous || indices.first() != Some(&domain_lo) || indices.last() != Some(&domain_hi) {
        return Err(DimLabelError::InvalidArgument(format!(
            "label writes must cover the full index domain {} in increasing order",
            schema.index_domain()
        )));
    }

    let values: Vec<&[u8]> = labels.as_bytes().chunks_exact(label_type.size()).collect();
    if let Some(outside) = values.iter().find(|v| !schema.label_domain().contains(v)) {
        return Err(DimLabelError::InvalidArgument(format!(
            "label {} is outside the label domain {}",
            label_type.format_value(outside),
            schema.label_domain()
        )));
    }
    let order = schema.label_order();
    if let Some(position) = values
        .windows(2)
        .position(|w| !order.is_strictly_ordered(label_type, w[0], w[1]))
    {
        return Err(DimLabelError::InvalidArgument(format!(
            "labels must be strictly {}; violated at index {}",
            order,
            indices[position + 1]
        )));
    }

    let mut index_bytes = Vec::with_capacity(count * index_type.size());
    for &index in &indices {
        let encoded = index_type.encode_i128(index).ok_or_else(|| {
            DimLabelError::InvalidArgument(format!("{} does not fit {}", index, index_type))
        })?;
        index_bytes.extend_from_slice(&encoded);
    }

    open.indexed.write(
        &[(domain_lo, domain_hi)],
        Layout::RowMajor,
        vec![(LABEL_ATTRIBUTE.to_string(), labels.as_bytes().to_vec())],
    )?;
    // Labels are strictly ordered along the index, so position order
    // equals index order.
    open.labelled.write(
        &[(0, domain_hi - domain_lo)],
        Layout::RowMajor,
        vec![
            (LABEL_ATTRIBUTE.to_string(), labels.as_bytes().to_vec()),
            (INDEX_ATTRIBUTE.to_string(), index_bytes),
        ],
    )?;
    debug!("Wrote {} labels to {:?} pair", count, order);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_point() {
        let values = [1, 3, 3, 5, 8];
        let at = |p: i128| values[p as usize];
        assert_eq!(partition_point(0, 5, |p| Ok(at(p) >= 3)).unwrap(), 1);
        assert_eq!(partition_point(0, 5, |p| Ok(at(p) > 3)).unwrap(), 3);
        assert_eq!(partition_point(0, 5, |p| Ok(at(p) > 100)).unwrap(), 5);
        assert_eq!(partition_point(0, 5, |_| Ok(true)).unwrap(), 0);
        assert_eq!(partition_point(2, 2, |_| Ok(true)).unwrap(), 2);
    }

    #[test]
    fn test_single_range() {
        let a = Range::new(1i64, 2i64).unwrap();
        let b = Range::new(5i64, 6i64).unwrap();
        assert!(single_range("label", &[a.clone()], Datatype::Int64).is_ok());
        assert!(single_range("label", &[a.clone()], Datatype::Int32).is_err());
        assert!(single_range("label", &[], Datatype::Int64).is_err());
        assert!(single_range("label", &[a, b], Datatype::Int64).is_err());
    }

    #[test]
    fn test_resolution_into_range() {
        let range = Range::new(9u64, 12u64).unwrap();
        assert_eq!(
            Resolution::Range(range.clone()).into_range().unwrap(),
            range
        );
        let err = Resolution::Empty {
            requested: Range::new(100i64, 200i64).unwrap(),
        }
        .into_range()
        .unwrap_err();
        assert!(!err.is_fatal());
    }
}
