use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of element types a tensor may carry on the wire.
///
/// The integer codes are shared by every subsystem that encodes a dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Dtype {
    F32,
    F16,
    BF16,
    F64,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

/// A dtype code outside of the known table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownDtypeCode(pub i64);

impl fmt::Display for UnknownDtypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dtype code {}", self.0)
    }
}

impl std::error::Error for UnknownDtypeCode {}

impl Dtype {
    pub const ALL: [Dtype; 10] = [
        Dtype::F32,
        Dtype::F16,
        Dtype::BF16,
        Dtype::F64,
        Dtype::I64,
        Dtype::I32,
        Dtype::I16,
        Dtype::I8,
        Dtype::U8,
        Dtype::Bool,
    ];

    /// The wire code of this dtype.
    pub const fn code(self) -> i64 {
        match self {
            Dtype::F32 => 0,
            Dtype::F16 => 1,
            Dtype::BF16 => 2,
            Dtype::F64 => 3,
            Dtype::I64 => 4,
            Dtype::I32 => 5,
            Dtype::I16 => 6,
            Dtype::I8 => 7,
            Dtype::U8 => 8,
            Dtype::Bool => 9,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|dtype| dtype.code() == code)
    }

    /// Size in bytes of a single element.
    pub const fn size(self) -> usize {
        match self {
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F16 | Dtype::BF16 | Dtype::I16 => 2,
            Dtype::I8 | Dtype::U8 | Dtype::Bool => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Dtype::F32 | Dtype::F16 | Dtype::BF16 | Dtype::F64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "float32",
            Dtype::F16 => "float16",
            Dtype::BF16 => "bfloat16",
            Dtype::F64 => "float64",
            Dtype::I64 => "int64",
            Dtype::I32 => "int32",
            Dtype::I16 => "int16",
            Dtype::I8 => "int8",
            Dtype::U8 => "uint8",
            Dtype::Bool => "bool",
        }
    }
}

impl TryFrom<i64> for Dtype {
    type Error = UnknownDtypeCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(UnknownDtypeCode(code))
    }
}

impl From<Dtype> for i64 {
    fn from(dtype: Dtype) -> Self {
        dtype.code()
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_dense() {
        for (i, dtype) in Dtype::ALL.into_iter().enumerate() {
            assert_eq!(dtype.code(), i as i64);
            assert_eq!(Dtype::from_code(i as i64), Some(dtype));
        }

        assert_eq!(Dtype::from_code(10), None);
        assert_eq!(Dtype::from_code(-1), None);
    }

    #[test]
    fn serde_uses_the_integer_code() {
        assert_eq!(serde_json::to_string(&Dtype::BF16).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Dtype>("4").unwrap(), Dtype::I64);
        assert!(serde_json::from_str::<Dtype>("42").is_err());
    }
}
