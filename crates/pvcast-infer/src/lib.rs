//! pvcast Infer: model registry, model artifacts, batched inference.
//!
//! Models are stored as `model.json` artifacts in a local cache, keyed by
//! `(id, version)`. The built-in `linear` kind needs no runtime; the `onnx`
//! kind is available when the `onnx` feature is enabled.

pub mod hub;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx_model;
pub mod registry;
pub mod runner;

pub use hub::{model_dir, DirectoryHub, ModelHub};
pub use model::{
    load_artifact, ForecastModel, LinearModel, LinearParams, ModelInput, ModelSchema, OutputSchema,
};
pub use registry::{ModelHandle, ModelRegistry};
pub use runner::{InferenceRunner, ModelRun};
