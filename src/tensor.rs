//! Caller-owned tensor descriptors and the element types the backend speaks.

use ort::tensor::TensorElementType;

/// Element type of a tensor crossing the backend boundary.
///
/// Discriminants are stable and persisted by hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DType {
    Float32 = 1,
    Uint8 = 2,
    Int8 = 3,
    Int32 = 4,
    Int64 = 5,
    Float16 = 10,
}

impl DType {
    pub const ALL: [DType; 6] = [
        DType::Float32,
        DType::Uint8,
        DType::Int8,
        DType::Int32,
        DType::Int64,
        DType::Float16,
    ];

    pub const fn element_size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Uint8 | Self::Int8 => 1,
            Self::Int64 => 8,
            Self::Float16 => 2,
        }
    }

    pub const fn to_native(self) -> TensorElementType {
        match self {
            Self::Float32 => TensorElementType::Float32,
            Self::Uint8 => TensorElementType::Uint8,
            Self::Int8 => TensorElementType::Int8,
            Self::Int32 => TensorElementType::Int32,
            Self::Int64 => TensorElementType::Int64,
            Self::Float16 => TensorElementType::Float16,
        }
    }

    /// `None` for runtime types the backend does not handle.
    pub fn from_native(ty: TensorElementType) -> Option<Self> {
        match ty {
            TensorElementType::Float32 => Some(Self::Float32),
            TensorElementType::Uint8 => Some(Self::Uint8),
            TensorElementType::Int8 => Some(Self::Int8),
            TensorElementType::Int32 => Some(Self::Int32),
            TensorElementType::Int64 => Some(Self::Int64),
            TensorElementType::Float16 => Some(Self::Float16),
            _ => None,
        }
    }
}

/// Total element count of `shape`.
///
/// `None` when any dimension is non-positive or the product overflows. A rank-0
/// shape holds one element.
pub fn element_count(shape: &[i64]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| {
        if d <= 0 {
            return None;
        }
        acc.checked_mul(usize::try_from(d).ok()?)
    })
}

/// Borrowed input buffer.
#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
    F32(&'a [f32]),
    F16(&'a [half::f16]),
    U8(&'a [u8]),
    I8(&'a [i8]),
    I32(&'a [i32]),
    I64(&'a [i64]),
}

/// Borrowed output buffer.
#[derive(Debug)]
pub enum TensorDataMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [half::f16]),
    U8(&'a mut [u8]),
    I8(&'a mut [i8]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
}

macro_rules! buffer_accessors {
    ($ty:ident) => {
        impl $ty<'_> {
            pub fn dtype(&self) -> DType {
                match self {
                    Self::F32(_) => DType::Float32,
                    Self::F16(_) => DType::Float16,
                    Self::U8(_) => DType::Uint8,
                    Self::I8(_) => DType::Int8,
                    Self::I32(_) => DType::Int32,
                    Self::I64(_) => DType::Int64,
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    Self::F32(d) => d.len(),
                    Self::F16(d) => d.len(),
                    Self::U8(d) => d.len(),
                    Self::I8(d) => d.len(),
                    Self::I32(d) => d.len(),
                    Self::I64(d) => d.len(),
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }
        }
    };
}

buffer_accessors!(TensorData);
buffer_accessors!(TensorDataMut);

/// Input descriptor: a caller buffer plus the shape it should be read as.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    pub data: TensorData<'a>,
    pub shape: Vec<i64>,
}

impl<'a> TensorView<'a> {
    pub fn new(data: TensorData<'a>, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            data,
            shape: shape.into(),
        }
    }

    pub fn f32(data: &'a [f32], shape: impl Into<Vec<i64>>) -> Self {
        Self::new(TensorData::F32(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

/// Output descriptor.
///
/// `shape` is what the caller expects; `run` may rewrite it with the shape the
/// runtime actually produced.
#[derive(Debug)]
pub struct TensorMut<'a> {
    pub data: TensorDataMut<'a>,
    pub shape: Vec<i64>,
}

impl<'a> TensorMut<'a> {
    pub fn new(data: TensorDataMut<'a>, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            data,
            shape: shape.into(),
        }
    }

    pub fn f32(data: &'a mut [f32], shape: impl Into<Vec<i64>>) -> Self {
        Self::new(TensorDataMut::F32(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_native_round_trip() {
        for dt in DType::ALL {
            let back = DType::from_native(dt.to_native());
            assert_eq!(back, Some(dt));
            assert_eq!(back.map(DType::element_size), Some(dt.element_size()));
        }
    }

    #[test]
    fn unsupported_native_type() {
        assert_eq!(DType::from_native(TensorElementType::String), None);
        assert_eq!(DType::from_native(TensorElementType::Float64), None);
    }

    #[test]
    fn element_count_rejects_bad_dims() {
        assert_eq!(element_count(&[1, 3, 4, 4]), Some(48));
        assert_eq!(element_count(&[]), Some(1));
        assert_eq!(element_count(&[1, 0, 4]), None);
        assert_eq!(element_count(&[1, -1, 4]), None);
        assert_eq!(element_count(&[i64::MAX, i64::MAX]), None);
    }

    #[test]
    fn descriptor_types_follow_buffers() {
        let a = [0i64; 3];
        let view = TensorView::new(TensorData::I64(&a), [3]);
        assert_eq!(view.dtype(), DType::Int64);
        assert_eq!(view.data.len(), 3);

        let mut out = [half::f16::ZERO; 4];
        let m = TensorMut::new(TensorDataMut::F16(&mut out), [2, 2]);
        assert_eq!(m.dtype(), DType::Float16);
        assert!(!m.data.is_empty());
    }
}
