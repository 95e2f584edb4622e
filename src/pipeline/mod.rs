//! Media pipelines
//!
//! Split into three layers: [`description`] is plain data, [`builder`] maps
//! configuration to descriptions, [`runtime`] realizes and supervises live
//! graphs.

pub mod builder;
pub mod description;
pub mod runtime;

pub use description::{PipelineDescription, PipelineKind, PropertyValue, SourceRef};
pub use runtime::{PipelineEvent, PipelineHandle, PipelineSnapshot, PipelineState};
