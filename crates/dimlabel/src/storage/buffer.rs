//! Owned, typed data buffers for query input and output.

use crate::datatype::{decode_values, encode_values, Datatype, NativeType};
use crate::error::{DimLabelError, Result};

/// A typed byte buffer that supplies write values or receives read values.
///
/// `capacity()` is fixed at construction. `size()` is the number of bytes
/// holding valid data: the whole buffer for a write buffer, and the bytes
/// actually produced after a read completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    datatype: Datatype,
    data: Vec<u8>,
    size: usize,
}

impl DataBuffer {
    /// Creates a zeroed buffer of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `capacity` is a positive multiple of
    /// the element size.
    pub fn for_read(datatype: Datatype, capacity: usize) -> Result<Self> {
        check_capacity(datatype, capacity)?;
        Ok(Self {
            datatype,
            data: vec![0; capacity],
            size: capacity,
        })
    }

    /// Creates a zeroed buffer for `count` values of `T`.
    pub fn with_capacity<T: NativeType>(count: usize) -> Result<Self> {
        Self::for_read(T::DATATYPE, count.saturating_mul(T::DATATYPE.size()))
    }

    /// Creates a buffer holding `values`.
    pub fn from_values<T: NativeType>(values: &[T]) -> Result<Self> {
        Self::from_bytes(T::DATATYPE, encode_values(values))
    }

    /// Creates a buffer from raw little-endian bytes.
    pub fn from_bytes(datatype: Datatype, data: Vec<u8>) -> Result<Self> {
        check_capacity(datatype, data.len())?;
        let size = data.len();
        Ok(Self {
            datatype,
            data,
            size,
        })
    }

    /// Element datatype.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Total bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes holding valid data.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of valid elements.
    pub fn len(&self) -> usize {
        self.size / self.datatype.size()
    }

    /// Returns true if no valid elements are held.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Valid bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Valid elements decoded as `T`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `T` is not the buffer's datatype.
    pub fn values<T: NativeType>(&self) -> Result<Vec<T>> {
        decode_values(self.datatype, self.as_bytes())
    }

    /// Replaces the contents with `bytes` and records the new size.
    ///
    /// Fails with `BufferTooSmall` and leaves the buffer untouched if
    /// `bytes` does not fit.
    pub(crate) fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.data.len() {
            return Err(DimLabelError::BufferTooSmall {
                required: bytes.len() as u64,
                available: self.data.len() as u64,
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
        Ok(())
    }

    /// Fails with `BufferTooSmall` unless `cells` values fit.
    pub(crate) fn check_fits(&self, cells: usize) -> Result<()> {
        let required = (cells as u64).saturating_mul(self.datatype.size() as u64);
        if required > self.data.len() as u64 {
            return Err(DimLabelError::BufferTooSmall {
                required,
                available: self.data.len() as u64,
            });
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.size = 0;
    }
}

fn check_capacity(datatype: Datatype, capacity: usize) -> Result<()> {
    if capacity == 0 || capacity % datatype.size() != 0 {
        return Err(DimLabelError::InvalidArgument(format!(
            "buffer size {} must be a positive multiple of the {} element size {}",
            capacity,
            datatype,
            datatype.size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_validation() {
        assert!(DataBuffer::for_read(Datatype::Int64, 0).is_err());
        assert!(DataBuffer::for_read(Datatype::Int64, 12).is_err());
        assert!(DataBuffer::from_values::<f32>(&[]).is_err());

        let buffer = DataBuffer::with_capacity::<i64>(4).unwrap();
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(buffer.datatype(), Datatype::Int64);
    }

    #[test]
    fn test_fill_updates_size() {
        let mut buffer = DataBuffer::with_capacity::<i32>(4).unwrap();
        buffer.fill(&encode_values(&[7i32, 8])).unwrap();
        assert_eq!(buffer.size(), 8);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.values::<i32>().unwrap(), vec![7, 8]);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fill_too_small() {
        let mut buffer = DataBuffer::from_values(&[1u8, 2]).unwrap();
        let err = buffer.fill(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            DimLabelError::BufferTooSmall {
                required: 3,
                available: 2
            }
        ));
        assert_eq!(buffer.values::<u8>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_check_fits() {
        let buffer = DataBuffer::with_capacity::<f32>(4).unwrap();
        buffer.check_fits(4).unwrap();
        let err = buffer.check_fits(1 << 50).unwrap_err();
        assert!(matches!(
            err,
            DimLabelError::BufferTooSmall {
                required,
                available: 16
            } if required == 4 << 50
        ));
        assert!(buffer.check_fits(usize::MAX).is_err());
    }

    #[test]
    fn test_values_checks_type() {
        let buffer = DataBuffer::from_values(&[1.5f64]).unwrap();
        assert!(buffer.values::<i64>().is_err());
    }
}
