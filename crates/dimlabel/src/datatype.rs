//! Cell datatypes and typed inclusive ranges.
//!
//! Values travel through the storage layer as little-endian bytes tagged
//! with a [`Datatype`]. Comparison always interprets the bytes as the
//! declared type, never as raw byte strings.

use crate::error::{DimLabelError, Result};
use std::cmp::Ordering;
use std::fmt;

/// Datatype of a dimension, attribute or label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Datatype {
    /// Signed 8-bit integer.
    Int8 = 0,
    /// Signed 16-bit integer.
    Int16 = 1,
    /// Signed 32-bit integer.
    Int32 = 2,
    /// Signed 64-bit integer.
    Int64 = 3,
    /// Unsigned 8-bit integer.
    UInt8 = 4,
    /// Unsigned 16-bit integer.
    UInt16 = 5,
    /// Unsigned 32-bit integer.
    UInt32 = 6,
    /// Unsigned 64-bit integer.
    UInt64 = 7,
    /// 32-bit IEEE float.
    Float32 = 8,
    /// 64-bit IEEE float.
    Float64 = 9,
}

impl Datatype {
    /// Converts a u8 code to a datatype.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Int8),
            1 => Some(Self::Int16),
            2 => Some(Self::Int32),
            3 => Some(Self::Int64),
            4 => Some(Self::UInt8),
            5 => Some(Self::UInt16),
            6 => Some(Self::UInt32),
            7 => Some(Self::UInt64),
            8 => Some(Self::Float32),
            9 => Some(Self::Float64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Returns true for the integer types.
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    /// Lower-case type name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// Compares two encoded values of this datatype.
    ///
    /// Both slices must hold at least one element; floats use `total_cmp`.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Int8 => cmp_as::<i8>(a, b),
            Self::Int16 => cmp_as::<i16>(a, b),
            Self::Int32 => cmp_as::<i32>(a, b),
            Self::Int64 => cmp_as::<i64>(a, b),
            Self::UInt8 => cmp_as::<u8>(a, b),
            Self::UInt16 => cmp_as::<u16>(a, b),
            Self::UInt32 => cmp_as::<u32>(a, b),
            Self::UInt64 => cmp_as::<u64>(a, b),
            Self::Float32 => match (f32::from_le_slice(a), f32::from_le_slice(b)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.cmp(b),
            },
            Self::Float64 => match (f64::from_le_slice(a), f64::from_le_slice(b)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.cmp(b),
            },
        }
    }

    /// Decodes an integer value as `i128`. Returns None for floats.
    pub fn decode_i128(self, bytes: &[u8]) -> Option<i128> {
        match self {
            Self::Int8 => i8::from_le_slice(bytes).map(i128::from),
            Self::Int16 => i16::from_le_slice(bytes).map(i128::from),
            Self::Int32 => i32::from_le_slice(bytes).map(i128::from),
            Self::Int64 => i64::from_le_slice(bytes).map(i128::from),
            Self::UInt8 => u8::from_le_slice(bytes).map(i128::from),
            Self::UInt16 => u16::from_le_slice(bytes).map(i128::from),
            Self::UInt32 => u32::from_le_slice(bytes).map(i128::from),
            Self::UInt64 => u64::from_le_slice(bytes).map(i128::from),
            Self::Float32 | Self::Float64 => None,
        }
    }

    /// Encodes an `i128` as this integer type, if it fits.
    pub fn encode_i128(self, value: i128) -> Option<Vec<u8>> {
        let bytes = match self {
            Self::Int8 => i8::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::Int16 => i16::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::Int32 => i32::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::Int64 => i64::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::UInt8 => u8::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::UInt16 => u16::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::UInt32 => u32::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::UInt64 => u64::try_from(value).ok()?.to_le_bytes().to_vec(),
            Self::Float32 | Self::Float64 => return None,
        };
        Some(bytes)
    }

    /// Formats one encoded value for messages.
    pub fn format_value(self, bytes: &[u8]) -> String {
        let formatted = match self {
            Self::Float32 => f32::from_le_slice(bytes).map(|v| v.to_string()),
            Self::Float64 => f64::from_le_slice(bytes).map(|v| v.to_string()),
            _ => self.decode_i128(bytes).map(|v| v.to_string()),
        };
        formatted.unwrap_or_else(|| format!("{:?}", bytes))
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn cmp_as<T: NativeType>(a: &[u8], b: &[u8]) -> Ordering {
    match (T::from_le_slice(a), T::from_le_slice(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// A Rust primitive that maps to a [`Datatype`].
pub trait NativeType: Copy + PartialOrd + fmt::Debug + Send + Sync + 'static {
    /// The datatype tag for this primitive.
    const DATATYPE: Datatype;

    /// Appends the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes the first element of `bytes`, if long enough.
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_native_type {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const DATATYPE: Datatype = Datatype::$dt;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    let raw = bytes.get(..std::mem::size_of::<$ty>())?;
                    Some(<$ty>::from_le_bytes(raw.try_into().ok()?))
                }
            }
        )*
    };
}

impl_native_type!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
);

/// Encodes a slice of native values as little-endian bytes.
pub fn encode_values<T: NativeType>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * std::mem::size_of::<T>());
    for value in values {
        value.write_le(&mut out);
    }
    out
}

/// Decodes little-endian bytes into native values of type `T`.
///
/// # Errors
///
/// Returns `InvalidArgument` if `datatype` is not `T`'s datatype or the
/// byte length is not a multiple of the element size.
pub fn decode_values<T: NativeType>(datatype: Datatype, bytes: &[u8]) -> Result<Vec<T>> {
    if datatype != T::DATATYPE {
        return Err(DimLabelError::InvalidArgument(format!(
            "cannot decode {} values as {}",
            datatype,
            T::DATATYPE
        )));
    }
    let size = datatype.size();
    if bytes.len() % size != 0 {
        return Err(DimLabelError::InvalidArgument(format!(
            "{} bytes is not a multiple of the {} element size",
            bytes.len(),
            datatype
        )));
    }
    Ok(bytes
        .chunks_exact(size)
        .filter_map(T::from_le_slice)
        .collect())
}

/// Inclusive `[low, high]` range of typed values.
///
/// The same type describes label ranges and index ranges; which one a
/// given range is depends on where it came from, and the two are only
/// converted into each other by a label resolver.
#[derive(Debug, Clone)]
pub struct Range {
    datatype: Datatype,
    /// `low` followed by `high`, each `datatype.size()` bytes.
    data: Vec<u8>,
}

impl Range {
    /// Creates a range from native bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `low > high`.
    pub fn new<T: NativeType>(low: T, high: T) -> Result<Self> {
        let mut data = Vec::with_capacity(2 * std::mem::size_of::<T>());
        low.write_le(&mut data);
        high.write_le(&mut data);
        Self::from_data(T::DATATYPE, data)
    }

    /// Creates a range from encoded bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a bound has the wrong length or
    /// `low > high`.
    pub fn from_bytes(datatype: Datatype, low: &[u8], high: &[u8]) -> Result<Self> {
        let size = datatype.size();
        if low.len() != size || high.len() != size {
            return Err(DimLabelError::InvalidArgument(format!(
                "range bounds must be {} bytes for {}",
                size, datatype
            )));
        }
        let mut data = Vec::with_capacity(2 * size);
        data.extend_from_slice(low);
        data.extend_from_slice(high);
        Self::from_data(datatype, data)
    }

    /// Creates an integer range from `i128` bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a bound does not fit `datatype`.
    pub fn from_i128(datatype: Datatype, low: i128, high: i128) -> Result<Self> {
        let encode = |value: i128| {
            datatype.encode_i128(value).ok_or_else(|| {
                DimLabelError::InvalidArgument(format!("{} does not fit {}", value, datatype))
            })
        };
        let low = encode(low)?;
        let high = encode(high)?;
        Self::from_bytes(datatype, &low, &high)
    }

    fn from_data(datatype: Datatype, data: Vec<u8>) -> Result<Self> {
        let range = Self { datatype, data };
        if datatype.compare(range.start_bytes(), range.end_bytes()) == Ordering::Greater {
            return Err(DimLabelError::InvalidArgument(format!(
                "range lower bound exceeds upper bound: {}",
                range
            )));
        }
        Ok(range)
    }

    /// Datatype of the bounds.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Encoded lower bound.
    pub fn start_bytes(&self) -> &[u8] {
        &self.data[..self.datatype.size()]
    }

    /// Encoded upper bound.
    pub fn end_bytes(&self) -> &[u8] {
        &self.data[self.datatype.size()..]
    }

    /// Both bounds, encoded back to back.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Typed bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `T` is not the range's datatype.
    pub fn bounds<T: NativeType>(&self) -> Result<(T, T)> {
        if self.datatype != T::DATATYPE {
            return Err(DimLabelError::InvalidArgument(format!(
                "range is {}, requested as {}",
                self.datatype,
                T::DATATYPE
            )));
        }
        match (
            T::from_le_slice(self.start_bytes()),
            T::from_le_slice(self.end_bytes()),
        ) {
            (Some(low), Some(high)) => Ok((low, high)),
            _ => Err(DimLabelError::Corrupt("truncated range bounds".to_string())),
        }
    }

    /// Integer bounds as `i128`; None for float ranges.
    pub fn to_i128(&self) -> Option<(i128, i128)> {
        Some((
            self.datatype.decode_i128(self.start_bytes())?,
            self.datatype.decode_i128(self.end_bytes())?,
        ))
    }

    /// Number of integer cells covered; None for float ranges.
    pub fn cell_count(&self) -> Option<u128> {
        let (low, high) = self.to_i128()?;
        u128::try_from(high - low + 1).ok()
    }

    /// Whether an encoded value lies within the range.
    pub fn contains(&self, value: &[u8]) -> bool {
        self.datatype.compare(value, self.start_bytes()) != Ordering::Less
            && self.datatype.compare(value, self.end_bytes()) != Ordering::Greater
    }

    /// Whether the two ranges share at least one value.
    pub fn intersects(&self, other: &Range) -> bool {
        self.datatype == other.datatype
            && self.datatype.compare(self.start_bytes(), other.end_bytes()) != Ordering::Greater
            && self.datatype.compare(other.start_bytes(), self.end_bytes()) != Ordering::Greater
    }

    /// The overlapping part of two ranges, if any.
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        if !self.intersects(other) {
            return None;
        }
        let dt = self.datatype;
        let low = match dt.compare(self.start_bytes(), other.start_bytes()) {
            Ordering::Less => other.start_bytes(),
            _ => self.start_bytes(),
        };
        let high = match dt.compare(self.end_bytes(), other.end_bytes()) {
            Ordering::Greater => other.end_bytes(),
            _ => self.end_bytes(),
        };
        Range::from_bytes(dt, low, high).ok()
    }

    /// Whether every value of `self` lies within `other`.
    pub fn is_subset_of(&self, other: &Range) -> bool {
        self.datatype == other.datatype
            && other.contains(self.start_bytes())
            && other.contains(self.end_bytes())
    }
}

impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        self.datatype == other.datatype
            && self.datatype.compare(self.start_bytes(), other.start_bytes()) == Ordering::Equal
            && self.datatype.compare(self.end_bytes(), other.end_bytes()) == Ordering::Equal
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.datatype.format_value(self.start_bytes()),
            self.datatype.format_value(self.end_bytes())
        )
    }
}
