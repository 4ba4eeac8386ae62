//! ONNX-backed forecast model. Requires the `onnx` feature.
//!
//! The network takes a single `[sites, horizons, features]` float tensor.
//! Features are laid out per source in name order: every variable of the
//! source (name order), then one availability channel. Unavailable sources
//! contribute zeros. When the model consumes history, the most recent
//! normalised reading is appended as a final feature at every horizon.
//! The output must be `[sites, horizons, output_width]`.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array3;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::info;

use pvcast_core::{Error, Result};

use crate::model::{ForecastModel, ModelInput, ModelSchema};

pub struct OnnxModel {
    session: Arc<Mutex<Session>>,
    schema: ModelSchema,
}

impl OnnxModel {
    pub fn load(path: &Path, schema: ModelSchema) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ModelUnavailable(format!(
                "ONNX file not found: {}",
                path.display()
            )));
        }

        // With load-dynamic, ORT_DYLIB_PATH must point to libonnxruntime.so
        ort::init().commit();

        let session = Session::builder()
            .map_err(|e| Error::ModelUnavailable(format!("session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| Error::ModelUnavailable(format!("threads: {}", e)))?
            .commit_from_file(path)
            .map_err(|e| Error::ModelUnavailable(format!("load {}: {}", path.display(), e)))?;

        info!("ONNX model loaded from {}", path.display());
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            schema,
        })
    }

    fn features(&self, input: &ModelInput) -> (usize, Vec<f32>) {
        let n = input.len();
        let horizons = input.horizons;
        let mut columns: Vec<Box<dyn Fn(usize, usize) -> f32 + '_>> = Vec::new();

        for source in &self.schema.inputs.sources {
            let available = move |row: usize| input.is_available(source, row);
            if let Some(variables) = input.nwp.get(source) {
                for values in variables.values() {
                    columns.push(Box::new(move |row, h| {
                        if available(row) {
                            values[[row, h]]
                        } else {
                            0.0
                        }
                    }));
                }
            }
            columns.push(Box::new(move |row, _| if available(row) { 1.0 } else { 0.0 }));
        }
        if self.schema.inputs.uses_history {
            columns.push(Box::new(move |row, _| input.latest_history(row)));
        }

        let width = columns.len();
        let mut data = Vec::with_capacity(n * horizons * width);
        for row in 0..n {
            for h in 0..horizons {
                for column in &columns {
                    data.push(column(row, h));
                }
            }
        }
        (width, data)
    }
}

impl ForecastModel for OnnxModel {
    fn forward(&self, input: &ModelInput) -> Result<Array3<f32>> {
        let (width, data) = self.features(input);
        let tensor = Tensor::from_array(([input.len(), input.horizons, width], data))
            .map_err(|e| Error::Inference(format!("input tensor: {}", e)))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| Error::Inference(format!("ONNX inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("output tensor: {}", e)))?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        if dims.len() != 3 {
            return Err(Error::Inference(format!("unexpected output rank: {:?}", dims)));
        }

        Array3::from_shape_vec((dims[0], dims[1], dims[2]), data.to_vec())
            .map_err(|e| Error::Inference(format!("output reshape: {}", e)))
    }
}
