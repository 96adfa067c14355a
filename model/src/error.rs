use std::{
    error::Error,
    fmt::{self, Display},
};

use comms::{Dtype, TensorErr};

/// Errors raised when reading or writing through a `ParameterRegistry`.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryErr {
    NotFound(String),
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    DtypeMismatch {
        name: String,
        expected: Dtype,
        got: Dtype,
    },
    Transform(TransformErr),
}

impl RegistryErr {
    /// Whether the offending write can be skipped while the caller carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::ShapeMismatch { .. } | Self::DtypeMismatch { .. }
        )
    }
}

impl Display for RegistryErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "parameter {name} is not in the registry"),
            Self::ShapeMismatch {
                name,
                expected,
                got,
            } => write!(f, "parameter {name} has shape {expected:?}, got {got:?}"),
            Self::DtypeMismatch {
                name,
                expected,
                got,
            } => write!(f, "parameter {name} has dtype {expected}, got {got}"),
            Self::Transform(e) => write!(f, "{e}"),
        }
    }
}

impl Error for RegistryErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransformErr> for RegistryErr {
    fn from(value: TransformErr) -> Self {
        Self::Transform(value)
    }
}

/// Errors raised by the tensor transforms.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformErr {
    /// The rotary permutation needs an even head dimension.
    OddHeadDim { head_dim: usize },
    HeadsDoNotDivide { rows: usize, n_heads: usize },
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    DtypeMismatch { expected: Dtype, got: Dtype },
    /// Sparse indices and values must pair up one to one.
    LengthMismatch { indices: usize, values: usize },
    /// A sparse index that is negative, fractional, non-finite or past the end.
    BadIndex { index: f64, len: usize },
    Empty,
    Tensor(TensorErr),
    Layout(String),
}

impl Display for TransformErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OddHeadDim { head_dim } => {
                write!(f, "rotary permutation needs an even head dim, got {head_dim}")
            }
            Self::HeadsDoNotDivide { rows, n_heads } => {
                write!(f, "{rows} rows can not be split into {n_heads} heads")
            }
            Self::ShapeMismatch { expected, got } => {
                write!(f, "expected trailing shape {expected:?}, got {got:?}")
            }
            Self::DtypeMismatch { expected, got } => write!(f, "expected dtype {expected}, got {got}"),
            Self::LengthMismatch { indices, values } => {
                write!(f, "got {indices} sparse indices for {values} values")
            }
            Self::BadIndex { index, len } => {
                write!(f, "sparse index {index} is not a position in {len} elements")
            }
            Self::Empty => f.write_str("nothing to concatenate"),
            Self::Tensor(e) => write!(f, "{e}"),
            Self::Layout(e) => write!(f, "array layout error: {e}"),
        }
    }
}

impl Error for TransformErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorErr> for TransformErr {
    fn from(value: TensorErr) -> Self {
        Self::Tensor(value)
    }
}

impl From<ndarray::ShapeError> for TransformErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Layout(value.to_string())
    }
}
