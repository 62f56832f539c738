pub mod backend;
pub mod config;
pub mod environment;
pub mod errors;
pub mod float16;
pub mod maskops;
pub mod prompt;
pub mod provider;
pub mod scheduler;
pub mod segmentation;
pub mod tensor;
pub mod traits;

pub mod mocks;

pub use backend::{Context, DimOverride, OptLevel, TensorInfo};
pub use config::{Config, MaskSettings};
pub use environment::{Environment, ModelInfo};
pub use errors::{Result, RunError, SegError};
pub use maskops::{postprocess, vectorize_mask};
pub use prompt::{box_prompt, resample_brush_stroke, seed_from_points};
pub use provider::{probe, Provider};
pub use scheduler::{EncodeState, MaskSession};
pub use segmentation::{Mask, ModelFamily, PointLabel, SegPoint, SegmentationContext, SegmentationOptions};
pub use tensor::{element_count, DType, TensorData, TensorDataMut, TensorMut, TensorView};
pub use traits::*;
