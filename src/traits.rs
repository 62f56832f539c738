use crate::backend::{DimOverride, OptLevel};
use crate::errors::{Result, RunError};
use crate::provider::Provider;
use crate::tensor::{TensorMut, TensorView};

/// A loaded inference session, as seen by the segmentation pipeline.
///
/// Implemented by the runtime-backed [`crate::Context`] and by the test mocks.
pub trait InferenceSession: Send {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn input_name(&self, index: usize) -> Option<&str>;

    fn output_name(&self, index: usize) -> Option<&str>;

    /// Static output shape, symbolic dimensions as `-1`.
    fn output_shape(&self, index: usize) -> Option<&[i64]>;

    /// Run on caller buffers. Output shapes may be rewritten.
    fn run(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> std::result::Result<(), RunError>;
}

/// Source of sessions for a model id.
pub trait ModelLoader: Send + Sync {
    type Session: InferenceSession + 'static;

    /// Load `file` from the model's directory. `Provider::Auto` means the loader's
    /// own preference.
    fn load_session(
        &self,
        model_id: &str,
        file: &str,
        provider: Provider,
        opt: OptLevel,
        overrides: &[DimOverride],
    ) -> Result<Self::Session>;

    fn provider(&self) -> Provider;

    fn set_provider(&self, provider: Provider);
}

/// One closed outline produced by vectorization.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskPath {
    pub points: Vec<(f32, f32)>,
    /// `true` for an outer boundary, `false` for a hole.
    pub outer: bool,
}

/// Raster-to-curves collaborator.
///
/// Receives the inverted mask (background = 1.0), row-major.
pub trait MaskVectorizer {
    fn vectorize(&self, inverted: &[f32], width: usize, height: usize) -> Result<Vec<MaskPath>>;
}
