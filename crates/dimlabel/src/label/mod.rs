//! Dimension labels: schemas, label pairs, and range resolution.

pub mod pair;
pub mod resolver;
pub mod schema;

pub use pair::LabelPair;
pub use resolver::{LabelResolver, Resolution, ResolutionRequest};
pub use schema::{DimensionLabelSchema, LabelOrder};

pub(crate) use schema::create_label_pair;
