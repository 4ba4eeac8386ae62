//! pvcast ingest: assembles model-ready batches from NWP sources, site
//! metadata and optional generation history.
//!
//! NWP acquisition and regridding happen upstream; this crate only consumes
//! the regridded per-site tensors through the `NwpSource` trait.

pub mod assembler;
pub mod batch;
pub mod source;

pub use assembler::{Assembly, InputAssembler, TargetModel};
pub use batch::{HistoryBatch, InputSchema, ModelBatch, NwpBatch};
pub use source::{GenerationReading, GenerationSource, JsonNwpSource, NwpFetch, NwpSource};
