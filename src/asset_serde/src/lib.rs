//! Asset inventory ingestion: flattening nested asset records, loading them
//! into a schema-typed SQLite store and answering ownership questions over it.

pub mod chunk;
pub mod cmd;
pub mod config;
pub mod error;
pub mod flatten;
pub mod load;
pub mod ownership;
pub mod persist;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod transform;

pub use config::{IngestConfig, LoadMode};
pub use error::{IngestError, IngestResult};
pub use load::{LoadReport, Loader};
pub use ownership::{OwnershipAnalyser, OwnershipReport};
pub use registry::{AssetStore, Readiness, StoreRegistry};
pub use schema::SchemaRegistry;
pub use transform::{TransformReport, Transformer};
