//! Immutable dense fragment files.
//!
//! A fragment covers one rectangular subarray of an array and stores every
//! attribute column for that region in row-major cell order. Fragments are
//! never modified; a newer generation shadows older ones cell by cell.

use crate::config::SyncMode;
use crate::datatype::{Datatype, Range};
use crate::error::{DimLabelError, Result};
use crate::storage::codec::{put_range, put_str, read_framed_file, write_framed_file, ByteReader};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes of a fragment file.
pub const FRAGMENT_MAGIC: [u8; 4] = *b"ADLF";

/// File extension of fragment files.
pub const FRAGMENT_EXTENSION: &str = "adf";

const FRAGMENT_PREFIX: &str = "__frag_";

/// One attribute column of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentColumn {
    /// Attribute name.
    pub name: String,
    /// Cell datatype.
    pub datatype: Datatype,
    /// Little-endian cell values in row-major order.
    pub data: Vec<u8>,
}

/// A decoded fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    generation: u64,
    domain: Vec<Range>,
    bounds: Vec<(i128, i128)>,
    columns: Vec<FragmentColumn>,
}

impl Fragment {
    /// Builds a fragment over `domain`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a domain range is not integer typed or a
    /// column does not hold exactly one value per cell.
    pub fn new(generation: u64, domain: Vec<Range>, columns: Vec<FragmentColumn>) -> Result<Self> {
        let bounds = domain
            .iter()
            .map(|range| {
                range.to_i128().ok_or_else(|| {
                    DimLabelError::InvalidArgument(format!(
                        "fragment domain {} is not integer typed",
                        range
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cells = cell_count(&bounds)?;
        for column in &columns {
            let expected = cells.checked_mul(column.datatype.size()).ok_or_else(|| {
                DimLabelError::InvalidArgument("fragment is too large".to_string())
            })?;
            if column.data.len() != expected {
                return Err(DimLabelError::InvalidArgument(format!(
                    "column '{}' has {} bytes, expected {} for {} cells",
                    column.name,
                    column.data.len(),
                    expected,
                    cells
                )));
            }
        }

        Ok(Self {
            generation,
            domain,
            bounds,
            columns,
        })
    }

    /// Generates the file name of a fragment generation.
    ///
    /// # Examples
    /// ```rust,ignore
    /// use alopex_dimlabel::storage::fragment::Fragment;
    ///
    /// assert_eq!(Fragment::file_name(1), "__frag_0000000000000001.adf");
    /// ```
    pub fn file_name(generation: u64) -> String {
        format!("{}{:016x}.{}", FRAGMENT_PREFIX, generation, FRAGMENT_EXTENSION)
    }

    /// Parses a fragment file name back into its generation.
    pub fn parse_file_name(name: &str) -> Option<u64> {
        let hex = name
            .strip_suffix(FRAGMENT_EXTENSION)?
            .strip_suffix('.')?
            .strip_prefix(FRAGMENT_PREFIX)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }

    /// Lists the fragments in `dir` sorted by generation, oldest first.
    pub fn scan(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(generation) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(Self::parse_file_name)
            {
                found.push((generation, path));
            }
        }
        found.sort_by_key(|(generation, _)| *generation);
        Ok(found)
    }

    /// Returns the generation after the newest fragment in `dir`.
    pub fn next_generation(dir: &Path) -> Result<u64> {
        Ok(Self::scan(dir)?
            .last()
            .map_or(1, |(generation, _)| generation + 1))
    }

    /// Loads every fragment in `dir`, oldest first.
    pub fn load_all(dir: &Path, verify_checksums: bool) -> Result<Vec<Fragment>> {
        Self::scan(dir)?
            .into_iter()
            .map(|(_, path)| Self::read(&path, verify_checksums))
            .collect()
    }

    /// Reads one fragment file.
    pub fn read(path: &Path, verify_checksums: bool) -> Result<Self> {
        let body = read_framed_file(path, FRAGMENT_MAGIC, verify_checksums)?;
        Self::decode(&body)
    }

    /// Writes the fragment into `dir` and returns its path.
    pub fn write(&self, dir: &Path, sync_mode: SyncMode) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(self.generation));
        write_framed_file(&path, FRAGMENT_MAGIC, &self.encode(), sync_mode)?;
        debug!(
            "Wrote fragment {} covering {} cells",
            path.display(),
            self.cell_count()
        );
        Ok(path)
    }

    /// Fragment generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Covered subarray, one range per dimension.
    pub fn domain(&self) -> &[Range] {
        &self.domain
    }

    pub(crate) fn bounds(&self) -> &[(i128, i128)] {
        &self.bounds
    }

    /// Number of cells covered.
    pub fn cell_count(&self) -> usize {
        cell_count(&self.bounds).unwrap_or(0)
    }

    /// Column by attribute name.
    pub fn column(&self, name: &str) -> Option<&FragmentColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Bytes of attribute `name` at `coords`, if this fragment covers them.
    pub fn cell(&self, name: &str, coords: &[i128]) -> Option<&[u8]> {
        let column = self.column(name)?;
        let offset = row_major_offset(&self.bounds, coords)?;
        let size = column.datatype.size();
        column.data.get(offset * size..(offset + 1) * size)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&(self.domain.len() as u32).to_le_bytes());
        for range in &self.domain {
            put_range(&mut out, range);
        }
        out.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            put_str(&mut out, &column.name);
            out.push(column.datatype as u8);
            out.extend_from_slice(&(column.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&column.data);
        }
        out
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let generation = reader.read_u64()?;

        let dim_count = reader.read_u32()?;
        let mut domain = Vec::new();
        for _ in 0..dim_count {
            domain.push(reader.read_range()?);
        }

        let column_count = reader.read_u32()?;
        let mut columns = Vec::new();
        for _ in 0..column_count {
            let name = reader.read_str()?;
            let datatype = reader.read_datatype()?;
            let len = usize::try_from(reader.read_u64()?)
                .map_err(|_| DimLabelError::Corrupt("column length overflows".to_string()))?;
            let data = reader.read_bytes(len)?.to_vec();
            columns.push(FragmentColumn {
                name,
                datatype,
                data,
            });
        }

        if reader.remaining() != 0 {
            return Err(DimLabelError::Corrupt(format!(
                "{} trailing bytes after fragment",
                reader.remaining()
            )));
        }
        Self::new(generation, domain, columns)
            .map_err(|e| DimLabelError::Corrupt(format!("invalid fragment: {}", e)))
    }
}

/// Number of cells in a box of inclusive bounds.
pub(crate) fn cell_count(bounds: &[(i128, i128)]) -> Result<usize> {
    bounds.iter().try_fold(1usize, |acc, &(lo, hi)| {
        let extent = usize::try_from(hi - lo + 1).map_err(|_| {
            DimLabelError::InvalidArgument(format!("invalid extent [{}, {}]", lo, hi))
        })?;
        acc.checked_mul(extent)
            .ok_or_else(|| DimLabelError::InvalidArgument("cell count overflows".to_string()))
    })
}

/// Row-major position of `coords` inside `bounds`, or `None` if outside.
pub(crate) fn row_major_offset(bounds: &[(i128, i128)], coords: &[i128]) -> Option<usize> {
    if bounds.len() != coords.len() {
        return None;
    }
    let mut offset: i128 = 0;
    for (&(lo, hi), &c) in bounds.iter().zip(coords) {
        if c < lo || c > hi {
            return None;
        }
        offset = offset * (hi - lo + 1) + (c - lo);
    }
    usize::try_from(offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::encode_values;
    use tempfile::TempDir;

    fn sample(generation: u64) -> Fragment {
        Fragment::new(
            generation,
            vec![
                Range::new(0u32, 1u32).unwrap(),
                Range::new(10u32, 12u32).unwrap(),
            ],
            vec![FragmentColumn {
                name: "a".to_string(),
                datatype: Datatype::Int32,
                data: encode_values(&[0i32, 1, 2, 3, 4, 5]),
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = Fragment::file_name(0x2a);
        assert_eq!(name, "__frag_000000000000002a.adf");
        assert_eq!(Fragment::parse_file_name(&name), Some(0x2a));
        assert_eq!(Fragment::parse_file_name("__frag_2a.adf"), None);
        assert_eq!(Fragment::parse_file_name("__frag_000000000000002a.tmp"), None);
    }

    #[test]
    fn test_row_major_offset() {
        let bounds = [(0, 1), (10, 12)];
        assert_eq!(row_major_offset(&bounds, &[0, 10]), Some(0));
        assert_eq!(row_major_offset(&bounds, &[0, 12]), Some(2));
        assert_eq!(row_major_offset(&bounds, &[1, 10]), Some(3));
        assert_eq!(row_major_offset(&bounds, &[2, 10]), None);
        assert_eq!(row_major_offset(&bounds, &[0]), None);
    }

    #[test]
    fn test_cell_lookup() {
        let fragment = sample(1);
        assert_eq!(fragment.cell_count(), 6);
        assert_eq!(fragment.cell("a", &[1, 11]), Some(&4i32.to_le_bytes()[..]));
        assert_eq!(fragment.cell("a", &[1, 13]), None);
        assert_eq!(fragment.cell("b", &[1, 11]), None);
    }

    #[test]
    fn test_column_length_checked() {
        let err = Fragment::new(
            1,
            vec![Range::new(0u32, 3u32).unwrap()],
            vec![FragmentColumn {
                name: "a".to_string(),
                datatype: Datatype::Int32,
                data: vec![0; 12],
            }],
        )
        .unwrap_err();
        assert!(matches!(err, DimLabelError::InvalidArgument(_)));
    }

    #[test]
    fn test_write_scan_read() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(Fragment::next_generation(temp_dir.path()).unwrap(), 1);

        sample(1).write(temp_dir.path(), SyncMode::None).unwrap();
        sample(3).write(temp_dir.path(), SyncMode::None).unwrap();
        fs::write(temp_dir.path().join("unrelated.txt"), b"x").unwrap();

        assert_eq!(Fragment::next_generation(temp_dir.path()).unwrap(), 4);
        let loaded = Fragment::load_all(temp_dir.path(), true).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], sample(1));
        assert_eq!(loaded[1].generation(), 3);
    }
}
