//! Alopex dimension labels
//!
//! This crate lets a dimension of a dense array be addressed by an ordered
//! label value (a timestamp, a depth, ...) instead of its ordinal index.
//!
//! # Components
//!
//! - [`LabelPair`]: the indexed and labelled companion arrays of one label
//! - [`LabelResolver`]: label range <-> index range conversion and label data I/O
//! - [`LabelledQuery`]: the resolve / apply / submit protocol around a main query
//! - [`SyncQueue`] / [`WorkerPool`]: producer-consumer handoff for parallel resolution
//! - [`storage`]: the dense array storage everything above runs on
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_dimlabel::{LabelPair, LabelledQuery, Range};
//! use alopex_dimlabel::storage::{Array, EncryptionKey, Query, QueryType};
//!
//! let pair = Arc::new(LabelPair::new(uri.join("__labels/x"), Arc::clone(&storage)));
//! pair.open(QueryType::Read, &EncryptionKey::none())?;
//!
//! let mut array = Array::new(&uri, storage);
//! array.open(QueryType::Read, &EncryptionKey::none())?;
//!
//! let mut query = LabelledQuery::new(Query::new(&array)?);
//! query.attach_label(0, "x", pair)?;
//! query.add_label_range(0, Range::new(-8i64, -5i64)?)?;
//! query.submit_labels()?;
//! query.apply_labels()?;
//! query.submit()?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod datatype;
pub mod error;
pub mod label;
pub mod pool;
pub mod queue;
pub mod status;
pub mod storage;

pub use config::{PoolConfig, StorageConfig, SyncMode};
pub use coordinator::{LabelState, LabelledQuery};
pub use datatype::{Datatype, NativeType, Range};
pub use error::{DimLabelError, ErrorKind, Result};
pub use label::{
    DimensionLabelSchema, LabelOrder, LabelPair, LabelResolver, Resolution, ResolutionRequest,
};
pub use pool::WorkerPool;
pub use queue::SyncQueue;
pub use status::QueryStatus;
pub use storage::StorageManager;
