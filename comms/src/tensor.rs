use std::{error::Error, fmt};

use half::{bf16, f16};

use crate::Dtype;

/// A plain numeric type that can back a `Tensor`.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: Dtype;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_primitive_element {
    ($($t:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: Dtype = Dtype::$dtype;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_primitive_element!(
    f32 => F32,
    f64 => F64,
    i64 => I64,
    i32 => I32,
    i16 => I16,
    i8 => I8,
    u8 => U8,
);

impl Element for f16 {
    const DTYPE: Dtype = Dtype::F16;

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Element for bf16 {
    const DTYPE: Dtype = Dtype::BF16;

    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        bf16::from_f64(value)
    }
}

/// Runs `$body` with `$t` bound to the `Element` type backing `$dtype`.
///
/// `Bool` tensors are stored one byte per element and dispatch to `u8`.
#[macro_export]
macro_rules! with_element {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::Dtype::F32 => {
                type $t = f32;
                $body
            }
            $crate::Dtype::F16 => {
                type $t = $crate::half::f16;
                $body
            }
            $crate::Dtype::BF16 => {
                type $t = $crate::half::bf16;
                $body
            }
            $crate::Dtype::F64 => {
                type $t = f64;
                $body
            }
            $crate::Dtype::I64 => {
                type $t = i64;
                $body
            }
            $crate::Dtype::I32 => {
                type $t = i32;
                $body
            }
            $crate::Dtype::I16 => {
                type $t = i16;
                $body
            }
            $crate::Dtype::I8 => {
                type $t = i8;
                $body
            }
            $crate::Dtype::U8 | $crate::Dtype::Bool => {
                type $t = u8;
                $body
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorErr {
    LengthMismatch { expected: usize, got: usize },
    DtypeMismatch { expected: Dtype, got: Dtype },
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    Empty,
    Scalar,
}

impl fmt::Display for TensorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { expected, got } => {
                write!(f, "expected {expected} bytes of tensor data, got {got}")
            }
            Self::DtypeMismatch { expected, got } => {
                write!(f, "expected a {expected} tensor, got {got}")
            }
            Self::ShapeMismatch { expected, got } => {
                write!(f, "expected shape {expected:?}, got {got:?}")
            }
            Self::Empty => f.write_str("cannot stack an empty list of tensors"),
            Self::Scalar => f.write_str("operation needs at least one dimension"),
        }
    }
}

impl Error for TensorErr {}

pub type Result<T> = std::result::Result<T, TensorErr>;

/// A dense, contiguous, row-major tensor stored as little-endian bytes.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn zeros(dtype: Dtype, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();

        Self {
            dtype,
            shape: shape.to_vec(),
            data: vec![0; numel * dtype.size()],
        }
    }

    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(TensorErr::LengthMismatch {
                expected,
                got: data.len(),
            });
        }

        Ok(Self { dtype, shape, data })
    }

    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        Self::from_bytes(T::DTYPE, shape, bytemuck::cast_slice::<T, u8>(&values).to_vec())
    }

    pub fn from_bools(shape: Vec<usize>, values: &[bool]) -> Result<Self> {
        let data = values.iter().map(|&b| b as u8).collect();
        Self::from_bytes(Dtype::Bool, shape, data)
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            dtype: T::DTYPE,
            shape: Vec::new(),
            data: bytemuck::bytes_of(&value).to_vec(),
        }
    }

    /// Builds a tensor of `dtype` converting every value from `f64`.
    pub fn from_f64_slice(dtype: Dtype, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let data = if dtype == Dtype::Bool {
            values.iter().map(|&v| (v != 0.0) as u8).collect()
        } else {
            with_element!(dtype, T => {
                let typed: Vec<T> = values.iter().map(|&v| T::from_f64(v)).collect();
                bytemuck::cast_slice::<T, u8>(&typed).to_vec()
            })
        };

        Self::from_bytes(dtype, shape, data)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Copies the elements out as `T`, which must match the tensor's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let compatible = T::DTYPE == self.dtype || (self.dtype == Dtype::Bool && T::DTYPE == Dtype::U8);
        if !compatible {
            return Err(TensorErr::DtypeMismatch {
                expected: self.dtype,
                got: T::DTYPE,
            });
        }

        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Widens every element to `f64`. Integers above 2^53 lose precision.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_element!(self.dtype, T => {
            bytemuck::pod_collect_to_vec::<u8, T>(&self.data)
                .into_iter()
                .map(Element::to_f64)
                .collect()
        })
    }

    /// Converts the elements to `dtype`, cloning when they already match.
    pub fn cast(&self, dtype: Dtype) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }

        let values = self.to_f64_vec();
        let data = if dtype == Dtype::Bool {
            values.iter().map(|&v| (v != 0.0) as u8).collect()
        } else {
            with_element!(dtype, T => {
                let typed: Vec<T> = values.iter().map(|&v| T::from_f64(v)).collect();
                bytemuck::cast_slice::<T, u8>(&typed).to_vec()
            })
        };

        Self {
            dtype,
            shape: self.shape.clone(),
            data,
        }
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(TensorErr::ShapeMismatch {
                expected: self.shape,
                got: shape,
            });
        }

        Ok(Self { shape, ..self })
    }

    /// Stacks equally shaped tensors along a new leading dimension.
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors.first().ok_or(TensorErr::Empty)?;

        let mut data = Vec::with_capacity(first.nbytes() * tensors.len());
        for tensor in tensors {
            if tensor.dtype != first.dtype {
                return Err(TensorErr::DtypeMismatch {
                    expected: first.dtype,
                    got: tensor.dtype,
                });
            }

            if tensor.shape != first.shape {
                return Err(TensorErr::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: tensor.shape.clone(),
                });
            }

            data.extend_from_slice(&tensor.data);
        }

        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape);

        Ok(Self {
            dtype: first.dtype,
            shape,
            data,
        })
    }

    /// Splits along the leading dimension, dropping it from every part.
    pub fn unstack(&self) -> Result<Vec<Tensor>> {
        let (&parts, rest) = self.shape.split_first().ok_or(TensorErr::Scalar)?;
        if parts == 0 {
            return Ok(Vec::new());
        }

        let chunk = self.data.len() / parts;
        if chunk == 0 {
            return Ok(vec![Tensor::zeros(self.dtype, rest); parts]);
        }

        let tensors = self
            .data
            .chunks_exact(chunk)
            .map(|bytes| Self {
                dtype: self.dtype,
                shape: rest.to_vec(),
                data: bytes.to_vec(),
            })
            .collect();

        Ok(tensors)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("nbytes", &self.data.len())
            .finish()
    }
}
