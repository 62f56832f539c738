//! In-memory sessions and loader standing in for the ONNX runtime in tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    backend::{DimOverride, OptLevel},
    errors::{Result, RunError, SegError},
    provider::Provider,
    tensor::{TensorData, TensorDataMut, TensorMut, TensorView},
    traits::{InferenceSession, ModelLoader},
};

/// Input as the mock saw it: shape plus a copy of f32 data.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInput {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// Scripted session. Output `k` is split into `fills[k].len()` equal chunks and
/// chunk `c` is filled with `fills[k][c]`.
#[derive(Debug, Clone)]
pub struct MockSession {
    inputs: Vec<String>,
    outputs: Vec<String>,
    output_shapes: Vec<Vec<i64>>,
    fills: Vec<Vec<f32>>,
    /// Shape reported back for output 0 after a run.
    runtime_shape: Option<Vec<i64>>,
    fail: bool,
    runs: Arc<AtomicUsize>,
    last_inputs: Arc<Mutex<Vec<RecordedInput>>>,
}

impl MockSession {
    pub fn new(inputs: &[&str], outputs: &[(&str, &[i64])]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|(n, _)| n.to_string()).collect(),
            output_shapes: outputs.iter().map(|(_, s)| s.to_vec()).collect(),
            fills: vec![Vec::new(); outputs.len()],
            runtime_shape: None,
            fail: false,
            runs: Arc::new(AtomicUsize::new(0)),
            last_inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_fill(mut self, output: usize, values: &[f32]) -> Self {
        if let Some(f) = self.fills.get_mut(output) {
            *f = values.to_vec();
        }
        self
    }

    pub fn with_runtime_shape(mut self, shape: &[i64]) -> Self {
        self.runtime_shape = Some(shape.to_vec());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Calls to `run` across every clone of this session.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_inputs(&self) -> Vec<RecordedInput> {
        self.last_inputs.lock().clone()
    }
}

impl InferenceSession for MockSession {
    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn input_name(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).map(String::as_str)
    }

    fn output_name(&self, index: usize) -> Option<&str> {
        self.outputs.get(index).map(String::as_str)
    }

    fn output_shape(&self, index: usize) -> Option<&[i64]> {
        self.output_shapes.get(index).map(Vec::as_slice)
    }

    fn run(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> std::result::Result<(), RunError> {
        if inputs.len() != self.inputs.len() {
            return Err(RunError::IoCountMismatch {
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }
        if outputs.len() != self.outputs.len() {
            return Err(RunError::IoCountMismatch {
                expected: self.outputs.len(),
                got: outputs.len(),
            });
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_inputs.lock() = inputs
            .iter()
            .map(|t| RecordedInput {
                shape: t.shape.clone(),
                data: match t.data {
                    TensorData::F32(d) => d.to_vec(),
                    _ => Vec::new(),
                },
            })
            .collect();
        if self.fail {
            return Err(RunError::Execution("scripted failure".to_string()));
        }

        for (k, out) in outputs.iter_mut().enumerate() {
            let TensorDataMut::F32(buf) = &mut out.data else {
                return Err(RunError::InvalidTensor {
                    index: k,
                    reason: "mock only fills f32 outputs".to_string(),
                });
            };
            let fill = &self.fills[k];
            if fill.is_empty() || buf.is_empty() {
                continue;
            }
            let chunk = (buf.len() / fill.len()).max(1);
            for (c, part) in buf.chunks_mut(chunk).enumerate() {
                part.fill(fill[c.min(fill.len() - 1)]);
            }
        }
        if let (Some(shape), Some(out)) = (&self.runtime_shape, outputs.first_mut()) {
            out.shape = shape.clone();
        }
        Ok(())
    }
}

/// One `load_session` call as the loader saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRecord {
    pub file: String,
    pub provider: Provider,
    pub opt: OptLevel,
    pub overrides: Vec<DimOverride>,
}

/// Hands out clones of template sessions. Clones share run counters with the
/// templates, so tests can observe calls through [`MockLoader::decoder`].
#[derive(Debug)]
pub struct MockLoader {
    pub model_id: String,
    pub encoder: MockSession,
    pub decoder: MockSession,
    /// Served instead of `decoder` when dimension overrides are requested.
    pub reload_decoder: Option<MockSession>,
    /// Encoders loaded on anything but CPU fail every run.
    pub fail_accelerated_encode: bool,
    provider: Mutex<Provider>,
    loads: Mutex<Vec<LoadRecord>>,
}

pub const MOCK_MODEL_ID: &str = "mock-sam";

impl MockLoader {
    pub fn new(encoder: MockSession, decoder: MockSession) -> Self {
        Self {
            model_id: MOCK_MODEL_ID.to_string(),
            encoder,
            decoder,
            reload_decoder: None,
            fail_accelerated_encode: false,
            provider: Mutex::new(Provider::Auto),
            loads: Mutex::new(Vec::new()),
        }
    }

    /// Multi-mask decoder with three 16x16 candidates; candidate 1 scores best.
    pub fn multi_mask() -> Self {
        let encoder = MockSession::new(
            &["image"],
            &[
                ("high_res_feats_0", &[1, 2, 8, 8]),
                ("image_embeddings", &[1, 2, 4, 4]),
            ],
        )
        .with_fill(0, &[0.25])
        .with_fill(1, &[0.5]);
        let decoder = MockSession::new(
            &[
                "image_embeddings",
                "high_res_feats_0",
                "point_coords",
                "point_labels",
                "mask_input",
                "has_mask_input",
            ],
            &[
                ("masks", &[1, 3, 16, 16]),
                ("iou_predictions", &[1, 3]),
                ("low_res_masks", &[1, 3, 16, 16]),
            ],
        )
        .with_fill(0, &[-5.0, 5.0, 0.0])
        .with_fill(1, &[0.2, 0.9, 0.5])
        .with_fill(2, &[0.1, 0.2, 0.3]);
        Self::new(encoder, decoder)
    }

    /// Single-mask decoder producing a 16x16 probability map of 0.8.
    pub fn single_mask() -> Self {
        let encoder = MockSession::new(&["image"], &[("embeddings", &[1, 2, 4, 4])]).with_fill(0, &[1.0]);
        let decoder = MockSession::new(
            &["embeddings", "point_coords", "point_labels", "prev_mask"],
            &[("mask", &[1, 1, 16, 16])],
        )
        .with_fill(0, &[0.8]);
        Self::new(encoder, decoder)
    }

    pub fn loads(&self) -> Vec<LoadRecord> {
        self.loads.lock().clone()
    }
}

impl ModelLoader for MockLoader {
    type Session = MockSession;

    fn load_session(
        &self,
        model_id: &str,
        file: &str,
        provider: Provider,
        opt: OptLevel,
        overrides: &[DimOverride],
    ) -> Result<MockSession> {
        if model_id != self.model_id {
            return Err(SegError::ModelNotFound {
                id: model_id.to_string(),
            });
        }
        let provider = match provider {
            Provider::Auto => *self.provider.lock(),
            p => p,
        };
        self.loads.lock().push(LoadRecord {
            file: file.to_string(),
            provider,
            opt,
            overrides: overrides.to_vec(),
        });

        match file {
            "encoder.onnx" => {
                let session = self.encoder.clone();
                if self.fail_accelerated_encode && provider != Provider::Cpu {
                    Ok(session.failing())
                } else {
                    Ok(session)
                }
            }
            "decoder.onnx" => match (&self.reload_decoder, overrides.is_empty()) {
                (Some(reloaded), false) => Ok(reloaded.clone()),
                _ => Ok(self.decoder.clone()),
            },
            other => Err(SegError::FileSystem {
                path: other.into(),
                operation: "mock load".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such mock file"),
            }),
        }
    }

    fn provider(&self) -> Provider {
        *self.provider.lock()
    }

    fn set_provider(&self, provider: Provider) {
        *self.provider.lock() = provider;
    }
}
