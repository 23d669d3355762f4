//! Handle to one dense array on disk.

use crate::datatype::Range;
use crate::error::{DimLabelError, Result};
use crate::storage::fragment::{self, Fragment, FragmentColumn};
use crate::storage::query::Layout;
use crate::storage::{ArraySchema, EncryptionKey, QueryType, StorageManager};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct OpenArray {
    query_type: QueryType,
    schema: ArraySchema,
    /// Loaded in read mode only, oldest first.
    fragments: Vec<Fragment>,
    next_generation: AtomicU64,
}

/// A dense array that can be opened for reading or writing.
///
/// Opening in read mode takes a snapshot of the fragments present at that
/// moment; later writes become visible after re-opening.
#[derive(Debug)]
pub struct Array {
    uri: PathBuf,
    storage: Arc<StorageManager>,
    state: Option<OpenArray>,
}

impl Array {
    /// Creates a closed handle for the array at `uri`.
    pub fn new(uri: impl Into<PathBuf>, storage: Arc<StorageManager>) -> Self {
        Self {
            uri: uri.into(),
            storage,
            state: None,
        }
    }

    /// Array location.
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    /// Returns true while the array is open.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Mode the array is open in.
    pub fn query_type(&self) -> Option<QueryType> {
        self.state.as_ref().map(|s| s.query_type)
    }

    /// Opens the array.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` if open, `EncryptionMismatch` if `key` does not
    /// match the array's encryption type, or the storage error raised while
    /// loading the schema or fragments.
    pub fn open(&mut self, query_type: QueryType, key: &EncryptionKey) -> Result<()> {
        if self.state.is_some() {
            return Err(DimLabelError::AlreadyOpen(self.uri.display().to_string()));
        }

        let schema = self.storage.load_schema(&self.uri)?;
        if schema.encryption_type() != key.encryption_type() {
            return Err(DimLabelError::EncryptionMismatch(format!(
                "array {} uses {:?}, opened with {:?}",
                self.uri.display(),
                schema.encryption_type(),
                key.encryption_type()
            )));
        }

        let (fragments, next_generation) = match query_type {
            QueryType::Read => {
                let fragments = self.storage.load_fragments(&self.uri)?;
                let next = fragments.last().map_or(1, |f| f.generation() + 1);
                (fragments, next)
            }
            QueryType::Write => (Vec::new(), Fragment::next_generation(&self.uri)?),
        };

        debug!(
            "Opened array {} for {} ({} fragments)",
            self.uri.display(),
            query_type,
            fragments.len()
        );
        self.state = Some(OpenArray {
            query_type,
            schema,
            fragments,
            next_generation: AtomicU64::new(next_generation),
        });
        Ok(())
    }

    /// Closes the array.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the array is not open.
    pub fn close(&mut self) -> Result<()> {
        match self.state.take() {
            Some(_) => {
                debug!("Closed array {}", self.uri.display());
                Ok(())
            }
            None => Err(DimLabelError::NotOpen(self.uri.display().to_string())),
        }
    }

    fn open_state(&self) -> Result<&OpenArray> {
        self.state
            .as_ref()
            .ok_or_else(|| DimLabelError::NotOpen(self.uri.display().to_string()))
    }

    fn open_state_for(&self, query_type: QueryType) -> Result<&OpenArray> {
        let state = self.open_state()?;
        if state.query_type != query_type {
            return Err(DimLabelError::InvalidMode(format!(
                "array {} is open for {}, not {}",
                self.uri.display(),
                state.query_type,
                query_type
            )));
        }
        Ok(state)
    }

    /// Schema of the open array.
    pub fn schema(&self) -> Result<&ArraySchema> {
        Ok(&self.open_state()?.schema)
    }

    /// Bounding box of all data written, or `None` if nothing was written.
    ///
    /// Requires read mode.
    pub fn non_empty_domain(&self) -> Result<Option<Vec<Range>>> {
        let state = self.open_state_for(QueryType::Read)?;
        match self.non_empty_bounds()? {
            None => Ok(None),
            Some(bounds) => state
                .schema
                .dimensions()
                .iter()
                .zip(bounds)
                .map(|(dim, (lo, hi))| Range::from_i128(dim.datatype(), lo, hi))
                .collect::<Result<Vec<_>>>()
                .map(Some),
        }
    }

    pub(crate) fn non_empty_bounds(&self) -> Result<Option<Vec<(i128, i128)>>> {
        let state = self.open_state_for(QueryType::Read)?;
        let mut fragments = state.fragments.iter();
        let Some(first) = fragments.next() else {
            return Ok(None);
        };
        let mut bounds = first.bounds().to_vec();
        for fragment in fragments {
            for (acc, &(lo, hi)) in bounds.iter_mut().zip(fragment.bounds()) {
                acc.0 = acc.0.min(lo);
                acc.1 = acc.1.max(hi);
            }
        }
        Ok(Some(bounds))
    }

    /// Reads one attribute value at `coords`.
    ///
    /// Cells no fragment covers read as zero bytes.
    pub fn read_cell(&self, attribute: &str, coords: &[i128]) -> Result<Vec<u8>> {
        let state = self.open_state_for(QueryType::Read)?;
        let size = attribute_size(&state.schema, attribute)?;
        check_within_domain(&state.schema, coords.iter().map(|&c| (c, c)))?;
        Ok(newest_cell(&state.fragments, attribute, coords)
            .map_or_else(|| vec![0; size], <[u8]>::to_vec))
    }

    /// Reads attribute values over a box of coordinates in `layout` order.
    pub fn read(&self, attribute: &str, subarray: &[(i128, i128)], layout: Layout) -> Result<Vec<u8>> {
        let state = self.open_state_for(QueryType::Read)?;
        let size = attribute_size(&state.schema, attribute)?;
        check_within_domain(&state.schema, subarray.iter().copied())?;

        let bytes = fragment::cell_count(subarray)?
            .checked_mul(size)
            .ok_or_else(|| DimLabelError::InvalidArgument("read size overflows".to_string()))?;
        let mut out = Vec::with_capacity(bytes);
        for_each_cell(subarray, layout, |coords| {
            match newest_cell(&state.fragments, attribute, coords) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => out.resize(out.len() + size, 0),
            }
        });
        Ok(out)
    }

    /// Writes one fragment covering `subarray`.
    ///
    /// `columns` must hold every attribute exactly once, each with one
    /// value per cell in `layout` order. Returns the fragment generation.
    pub fn write(
        &self,
        subarray: &[(i128, i128)],
        layout: Layout,
        columns: Vec<(String, Vec<u8>)>,
    ) -> Result<u64> {
        let state = self.open_state_for(QueryType::Write)?;
        let schema = &state.schema;
        check_within_domain(schema, subarray.iter().copied())?;

        if columns.len() != schema.attributes().len() {
            return Err(DimLabelError::BufferUnset(format!(
                "write needs all {} attributes, got {}",
                schema.attributes().len(),
                columns.len()
            )));
        }
        let mut fragment_columns = Vec::with_capacity(columns.len());
        for attribute in schema.attributes() {
            let data = columns
                .iter()
                .find(|(name, _)| name == attribute.name())
                .map(|(_, data)| data)
                .ok_or_else(|| {
                    DimLabelError::BufferUnset(format!("attribute '{}'", attribute.name()))
                })?;
            let data = match layout {
                Layout::RowMajor => data.clone(),
                Layout::ColMajor => to_row_major(subarray, data, attribute.datatype().size())?,
            };
            fragment_columns.push(FragmentColumn {
                name: attribute.name().to_string(),
                datatype: attribute.datatype(),
                data,
            });
        }

        let domain = schema
            .dimensions()
            .iter()
            .zip(subarray)
            .map(|(dim, &(lo, hi))| Range::from_i128(dim.datatype(), lo, hi))
            .collect::<Result<Vec<_>>>()?;
        let generation = state.next_generation.fetch_add(1, Ordering::SeqCst);
        let fragment = Fragment::new(generation, domain, fragment_columns)?;
        self.storage.write_fragment(&self.uri, &fragment)?;
        Ok(generation)
    }
}

fn attribute_size(schema: &ArraySchema, attribute: &str) -> Result<usize> {
    schema
        .attribute(attribute)
        .map(|a| a.datatype().size())
        .ok_or_else(|| DimLabelError::InvalidArgument(format!("unknown attribute '{}'", attribute)))
}

fn check_within_domain(
    schema: &ArraySchema,
    subarray: impl ExactSizeIterator<Item = (i128, i128)>,
) -> Result<()> {
    if subarray.len() != schema.dimensions().len() {
        return Err(DimLabelError::InvalidArgument(format!(
            "expected {} dimensions, got {}",
            schema.dimensions().len(),
            subarray.len()
        )));
    }
    for ((lo, hi), (dim_lo, dim_hi)) in subarray.zip(schema.domain_bounds()) {
        if lo > hi || lo < dim_lo || hi > dim_hi {
            return Err(DimLabelError::InvalidArgument(format!(
                "[{}, {}] is outside the domain [{}, {}]",
                lo, hi, dim_lo, dim_hi
            )));
        }
    }
    Ok(())
}

fn newest_cell<'a>(fragments: &'a [Fragment], attribute: &str, coords: &[i128]) -> Option<&'a [u8]> {
    fragments
        .iter()
        .rev()
        .find_map(|fragment| fragment.cell(attribute, coords))
}

/// Visits every cell of a box in `layout` order.
pub(crate) fn for_each_cell(bounds: &[(i128, i128)], layout: Layout, mut visit: impl FnMut(&[i128])) {
    if bounds.is_empty() || bounds.iter().any(|&(lo, hi)| lo > hi) {
        return;
    }
    let mut coords: Vec<i128> = bounds.iter().map(|&(lo, _)| lo).collect();
    let order: Vec<usize> = match layout {
        Layout::RowMajor => (0..bounds.len()).rev().collect(),
        Layout::ColMajor => (0..bounds.len()).collect(),
    };
    loop {
        visit(&coords);
        let mut carried = true;
        for &dim in &order {
            if coords[dim] < bounds[dim].1 {
                coords[dim] += 1;
                carried = false;
                break;
            }
            coords[dim] = bounds[dim].0;
        }
        if carried {
            return;
        }
    }
}

fn to_row_major(bounds: &[(i128, i128)], data: &[u8], size: usize) -> Result<Vec<u8>> {
    let cells = fragment::cell_count(bounds)?;
    if data.len() != cells * size {
        return Err(DimLabelError::InvalidArgument(format!(
            "column has {} bytes, expected {}",
            data.len(),
            cells * size
        )));
    }
    let mut out = vec![0; data.len()];
    let mut source = 0;
    for_each_cell(bounds, Layout::ColMajor, |coords| {
        if let Some(target) = fragment::row_major_offset(bounds, coords) {
            out[target * size..(target + 1) * size]
                .copy_from_slice(&data[source * size..(source + 1) * size]);
        }
        source += 1;
    });
    Ok(out)
}
