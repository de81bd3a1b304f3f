//! In-memory dataset cache and filter engine for single-cell expression
//! viewers.
//!
//! A [`Session`] loads a dataset bundle through an [`ExtractionAdapter`],
//! derives a filter schema from its metadata, turns filter states into
//! selections and projects the slice of data each plot needs.

pub mod color;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod paths;
pub mod registry;
pub mod session;

pub use config::Settings;
pub use data::filter::{FilterState, Predicate};
pub use data::loader::{ExtractionAdapter, FileAdapter};
pub use data::projector::{PlotKind, ProjectedTable};
pub use error::{ScopeError, ScopeResult};
pub use export::{FilterConfig, PlotArtifact};
pub use registry::{DatasetKey, SelectionKey};
pub use session::{LoadOutcome, Session};
