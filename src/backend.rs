//! Single-model sessions: load with provider fallback, introspect, run.

use std::{path::Path, thread, time::Instant};

use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn};
use ort::{
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session, SessionInputValue,
    },
    value::{DynValue, TensorRef, ValueType},
};
use tracing::{debug, error, info, warn};

use crate::{
    environment::runtime,
    errors::{RunError, Result, SegError},
    float16,
    provider::{self, Accelerator, Provider},
    tensor::{element_count, DType, TensorData, TensorDataMut, TensorMut, TensorView},
    traits::InferenceSession,
};

/// Graph optimization level applied at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    #[default]
    All,
    /// Needed by graphs with dynamic output shapes that trip the aggressive
    /// optimizer's shape inference.
    Basic,
    Disabled,
}

impl OptLevel {
    fn native(self) -> GraphOptimizationLevel {
        match self {
            Self::All => GraphOptimizationLevel::Level3,
            Self::Basic => GraphOptimizationLevel::Level1,
            Self::Disabled => GraphOptimizationLevel::Disable,
        }
    }
}

/// Fixes a symbolic dimension to a concrete size at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimOverride {
    pub name: String,
    pub value: i64,
}

impl DimOverride {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Name, element type and static shape of one session input or output.
///
/// Symbolic dimensions are reported as `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<i64>,
}

/// A loaded model session.
///
/// Not shareable across threads for concurrent `run`; distinct contexts may run on
/// distinct threads. Dropping it releases the session.
pub struct Context {
    session: Session,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
    dynamic_outputs: bool,
    provider: Provider,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dynamic_outputs", &self.dynamic_outputs)
            .field("provider", &self.provider)
            .finish()
    }
}

fn model_err(operation: impl Into<String>, e: ort::Error) -> SegError {
    SegError::Model {
        operation: operation.into(),
        source: Box::new(e),
    }
}

/// Base session options: thread count, optimization level and overrides.
///
/// An override the runtime rejects is logged and skipped.
fn session_options(
    threads: usize,
    opt: OptLevel,
    overrides: &[DimOverride],
) -> ort::Result<SessionBuilder> {
    let base = || -> ort::Result<SessionBuilder> {
        Session::builder()?
            .with_intra_threads(threads)?
            .with_optimization_level(opt.native())
    };

    let mut builder = base()?;
    let mut accepted: Vec<&DimOverride> = Vec::new();
    for ov in overrides {
        match builder.with_dimension_override(&ov.name, ov.value) {
            Ok(b) => {
                builder = b;
                accepted.push(ov);
            }
            Err(e) => {
                warn!(name = %ov.name, value = ov.value, error = %e, "dimension override rejected");
                // the failed call consumed the builder
                builder = accepted
                    .iter()
                    .try_fold(base()?, |b, a| b.with_dimension_override(&a.name, a.value))?;
            }
        }
    }
    Ok(builder)
}

/// `Auto` dropping to CPU is expected on machines without accelerators.
fn falls_back_silently(requested: Provider) -> bool {
    requested == Provider::Auto
}

fn describe<'a, I>(items: I) -> Result<Vec<TensorInfo>>
where
    I: IntoIterator<Item = (&'a str, &'a ValueType)>,
{
    items
        .into_iter()
        .map(|(name, ty)| {
            let native = ty.tensor_type().ok_or_else(|| SegError::UnsupportedType {
                tensor: name.to_string(),
                type_name: format!("{ty:?}"),
            })?;
            let dtype = DType::from_native(native).ok_or_else(|| SegError::UnsupportedType {
                tensor: name.to_string(),
                type_name: format!("{native:?}"),
            })?;
            let shape = ty
                .tensor_shape()
                .map(|s| s.iter().map(|&d| if d > 0 { d } else { -1 }).collect())
                .unwrap_or_default();
            Ok(TensorInfo {
                name: name.to_string(),
                dtype,
                shape,
            })
        })
        .collect()
}

impl Context {
    /// Load a model file.
    ///
    /// Tries the requested accelerator chain, falls through to CPU when none
    /// registers, and when session creation itself fails on a non-CPU provider,
    /// retries once with CPU-only options.
    pub fn load_from_path(
        path: &Path,
        provider: Provider,
        opt: OptLevel,
        overrides: &[DimOverride],
    ) -> Result<Self> {
        runtime()?;
        if !path.is_file() {
            return Err(SegError::FileSystem {
                path: path.to_path_buf(),
                operation: "open model".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file missing"),
            });
        }

        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1);
        let fresh = || session_options(threads, opt, overrides);

        let (builder, accelerator) = match provider::enable_accelerator(provider, fresh)
            .map_err(|e| model_err("session options", e))?
        {
            Some(found) => found,
            None => {
                if falls_back_silently(provider) {
                    debug!("no preferred accelerator registered, using CPU");
                } else {
                    warn!(provider = %provider, "no accelerator could be enabled, using CPU");
                }
                (fresh().map_err(|e| model_err("session options", e))?, None)
            }
        };

        let start = Instant::now();
        let (session, effective) = match builder.commit_from_file(path) {
            Ok(s) => (s, accelerator.map_or(Provider::Cpu, Accelerator::provider)),
            Err(e) if provider != Provider::Cpu => {
                warn!(
                    provider = %provider,
                    error = %e,
                    "session creation failed, retrying on CPU"
                );
                let session = fresh()
                    .and_then(|b| b.commit_from_file(path))
                    .map_err(|e| {
                        error!(path = %path.display(), error = %e, "CPU fallback failed");
                        model_err(format!("create session: {}", path.display()), e)
                    })?;
                (session, Provider::Cpu)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "session creation failed");
                return Err(model_err(format!("create session: {}", path.display()), e));
            }
        };

        let inputs = describe(
            session
                .inputs
                .iter()
                .map(|i| (i.name.as_str(), &i.input_type)),
        )?;
        let outputs = describe(
            session
                .outputs
                .iter()
                .map(|o| (o.name.as_str(), &o.output_type)),
        )?;
        let dynamic_outputs = outputs.iter().any(|o| o.shape.iter().any(|&d| d <= 0));

        info!(
            path = %path.display(),
            provider = %effective,
            inputs = inputs.len(),
            outputs = outputs.len(),
            dynamic_outputs,
            elapsed = ?start.elapsed(),
            "model loaded"
        );

        Ok(Self {
            session,
            inputs,
            outputs,
            dynamic_outputs,
            provider: effective,
        })
    }

    pub fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    pub fn input_type(&self, index: usize) -> Option<DType> {
        self.inputs.get(index).map(|i| i.dtype)
    }

    pub fn output_type(&self, index: usize) -> Option<DType> {
        self.outputs.get(index).map(|o| o.dtype)
    }

    pub fn input_shape(&self, index: usize) -> Option<&[i64]> {
        self.inputs.get(index).map(|i| i.shape.as_slice())
    }

    pub fn has_dynamic_outputs(&self) -> bool {
        self.dynamic_outputs
    }

    /// Provider actually in effect after any fallback.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Run inference on caller buffers.
    ///
    /// Float32 inputs bound to float16 session inputs are converted into scratch
    /// tensors that live only for this call. Outputs whose shape the caller can't
    /// know up front (dynamic sessions, or float32 requested against a float16
    /// output) get their shape rewritten to what the runtime produced, and as many
    /// elements as fit are copied back.
    pub fn run(
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

        let staged = inputs
            .iter()
            .zip(&self.inputs)
            .enumerate()
            .map(|(i, (t, info))| Staged::new(i, t, info.dtype))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut runtime_allocated = Vec::with_capacity(outputs.len());
        for (i, (t, info)) in outputs.iter().zip(&self.outputs).enumerate() {
            let index = inputs.len() + i;
            let n = element_count(&t.shape).ok_or_else(|| RunError::InvalidTensor {
                index,
                reason: format!("bad shape {:?}", t.shape),
            })?;
            let converted = t.dtype() == DType::Float32 && info.dtype == DType::Float16;
            if t.dtype() != info.dtype && !converted {
                return Err(RunError::InvalidTensor {
                    index,
                    reason: format!("{:?} buffer for {:?} output", t.dtype(), info.dtype),
                });
            }
            let dynamic = self.dynamic_outputs || converted;
            if !dynamic && t.data.len() < n {
                return Err(short_buffer(index, t.data.len(), n));
            }
            runtime_allocated.push(dynamic);
        }

        let values = staged
            .iter()
            .zip(&self.inputs)
            .map(|(s, info)| Ok((info.name.clone(), s.bind()?)))
            .collect::<std::result::Result<Vec<(String, SessionInputValue<'_>)>, RunError>>()?;

        let start = Instant::now();
        let results = self.session.run(values).map_err(|e| {
            error!(error = %e, "inference failed");
            RunError::Execution(e.to_string())
        })?;
        debug!(elapsed = ?start.elapsed(), "session run");

        for (i, (out, info)) in outputs.iter_mut().zip(&self.outputs).enumerate() {
            copy_output(&results[info.name.as_str()], out, info, runtime_allocated[i])?;
        }
        Ok(())
    }
}

/// Input buffers prepared for binding. Pass-through types borrow the caller's
/// memory; converted ones own their scratch copy.
enum Staged<'a> {
    F32(CowArray<'a, f32, IxDyn>),
    F16(CowArray<'a, half::f16, IxDyn>),
    U8(CowArray<'a, u8, IxDyn>),
    I8(CowArray<'a, i8, IxDyn>),
    I32(CowArray<'a, i32, IxDyn>),
    I64(CowArray<'a, i64, IxDyn>),
}

fn short_buffer(index: usize, len: usize, n: usize) -> RunError {
    RunError::InvalidTensor {
        index,
        reason: format!("buffer holds {len} of {n} elements"),
    }
}

fn view<'a, T>(
    index: usize,
    data: &'a [T],
    dims: &[usize],
    n: usize,
) -> std::result::Result<CowArray<'a, T, IxDyn>, RunError> {
    let data = data.get(..n).ok_or_else(|| short_buffer(index, data.len(), n))?;
    ArrayViewD::from_shape(IxDyn(dims), data)
        .map(CowArray::from)
        .map_err(|e| RunError::InvalidTensor {
            index,
            reason: e.to_string(),
        })
}

impl<'a> Staged<'a> {
    fn new(
        index: usize,
        t: &TensorView<'a>,
        expected: DType,
    ) -> std::result::Result<Self, RunError> {
        let n = element_count(&t.shape).ok_or_else(|| RunError::InvalidTensor {
            index,
            reason: format!("bad shape {:?}", t.shape),
        })?;
        let dims: Vec<usize> = t.shape.iter().map(|&d| d as usize).collect();

        let staged = match (t.data, expected) {
            (TensorData::F32(d), DType::Float16) => {
                let src = d.get(..n).ok_or_else(|| short_buffer(index, d.len(), n))?;
                let owned = ArrayD::from_shape_vec(IxDyn(&dims), float16::encode_slice(src))
                    .map_err(|e| RunError::InvalidTensor {
                        index,
                        reason: e.to_string(),
                    })?;
                Staged::F16(CowArray::from(owned))
            }
            (TensorData::F32(d), DType::Float32) => Staged::F32(view(index, d, &dims, n)?),
            (TensorData::F16(d), DType::Float16) => Staged::F16(view(index, d, &dims, n)?),
            (TensorData::U8(d), DType::Uint8) => Staged::U8(view(index, d, &dims, n)?),
            (TensorData::I8(d), DType::Int8) => Staged::I8(view(index, d, &dims, n)?),
            (TensorData::I32(d), DType::Int32) => Staged::I32(view(index, d, &dims, n)?),
            (TensorData::I64(d), DType::Int64) => Staged::I64(view(index, d, &dims, n)?),
            (data, expected) => {
                return Err(RunError::InvalidTensor {
                    index,
                    reason: format!("{:?} buffer for {:?} input", data.dtype(), expected),
                })
            }
        };
        Ok(staged)
    }

    fn bind(&self) -> std::result::Result<SessionInputValue<'_>, RunError> {
        let value: SessionInputValue<'_> = match self {
            Staged::F32(a) => TensorRef::from_array_view(a)?.into(),
            Staged::F16(a) => TensorRef::from_array_view(a)?.into(),
            Staged::U8(a) => TensorRef::from_array_view(a)?.into(),
            Staged::I8(a) => TensorRef::from_array_view(a)?.into(),
            Staged::I32(a) => TensorRef::from_array_view(a)?.into(),
            Staged::I64(a) => TensorRef::from_array_view(a)?.into(),
        };
        Ok(value)
    }
}

fn copy_elements<T: Copy>(src: &ArrayViewD<'_, T>, dst: &mut [T], n: usize) {
    for (d, s) in dst.iter_mut().zip(src.iter()).take(n) {
        *d = *s;
    }
}

/// Copy one runtime output into the caller's buffer.
fn copy_output(
    value: &DynValue,
    out: &mut TensorMut<'_>,
    info: &TensorInfo,
    runtime_allocated: bool,
) -> std::result::Result<(), RunError> {
    // validated before the run
    let expected = element_count(&out.shape).unwrap_or(0);

    macro_rules! extract {
        ($ty:ty) => {
            value.try_extract_array::<$ty>().map_err(|e| {
                RunError::Execution(format!("extract '{}': {}", info.name, e))
            })?
        };
    }

    let (actual_shape, actual) = match &mut out.data {
        TensorDataMut::F32(buf) if info.dtype == DType::Float16 => {
            let arr = extract!(half::f16);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            float16::decode_into(arr.iter().take(n), buf);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::F32(buf) => {
            let arr = extract!(f32);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::F16(buf) => {
            let arr = extract!(half::f16);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::U8(buf) => {
            let arr = extract!(u8);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::I8(buf) => {
            let arr = extract!(i8);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::I32(buf) => {
            let arr = extract!(i32);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
        TensorDataMut::I64(buf) => {
            let arr = extract!(i64);
            let n = settle(info, runtime_allocated, arr.len(), expected, buf.len());
            copy_elements(&arr, buf, n);
            (arr.shape().to_vec(), arr.len())
        }
    };

    if runtime_allocated {
        if actual != expected {
            debug!(
                output = %info.name,
                actual,
                expected,
                shape = ?actual_shape,
                "output element count differs from caller shape"
            );
        }
        out.shape = actual_shape.iter().map(|&d| d as i64).collect();
    }
    Ok(())
}

/// Number of elements to copy back: as many as both sides can hold.
///
/// A caller-shaped output whose element count disagrees with the runtime's is
/// logged and truncated rather than failed.
fn settle(
    info: &TensorInfo,
    runtime_allocated: bool,
    actual: usize,
    expected: usize,
    capacity: usize,
) -> usize {
    if !runtime_allocated && actual != expected {
        warn!(
            output = %info.name,
            actual,
            expected,
            "output element count mismatch, copying what fits"
        );
    }
    actual.min(expected).min(capacity)
}

impl InferenceSession for Context {
    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn input_name(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).map(|i| i.name.as_str())
    }

    fn output_name(&self, index: usize) -> Option<&str> {
        self.outputs.get(index).map(|o| o.name.as_str())
    }

    fn output_shape(&self, index: usize) -> Option<&[i64]> {
        self.outputs.get(index).map(|o| o.shape.as_slice())
    }

    fn run(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> std::result::Result<(), RunError> {
        Context::run(self, inputs, outputs)
    }
}
