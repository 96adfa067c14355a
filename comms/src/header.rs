//! Fixed size header that announces the next tensor of a broadcast.
//!
//! The header is `HEADER_CAPACITY` signed 64 bit slots laid out as
//! `[shutdown, name_len, name_bytes.., ndim, dims.., dtype_code, 0..]`
//! and travels as little-endian bytes.

use std::{error::Error, fmt};

use crate::Dtype;

pub const HEADER_CAPACITY: usize = 128;
pub const HEADER_BYTES: usize = HEADER_CAPACITY * size_of::<i64>();
pub const MAX_NAME_LEN: usize = 100;
/// Largest payload a header may announce, 64 GiB.
pub const MAX_TENSOR_BYTES: usize = 1 << 36;

const SHUTDOWN_FLAG: i64 = -1;

pub type HeaderBuf = [i64; HEADER_CAPACITY];

/// Name, shape and dtype of the tensor that follows a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl TensorMeta {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedTensorHeader {
    Parameter(TensorMeta),
    /// Terminates the receiving loop, every other slot is ignored.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderErr {
    NameTooLong { len: usize },
    TooManyDims { name: String, ndim: usize },
    Malformed(String),
    UnknownDtype { name: String, shape: Vec<usize>, code: i64 },
}

impl HeaderErr {
    /// Whether the broadcast stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownDtype { .. })
    }
}

impl fmt::Display for HeaderErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong { len } => write!(
                f,
                "parameter name of {len} bytes exceeds the {MAX_NAME_LEN} bytes limit"
            ),
            Self::TooManyDims { name, ndim } => write!(
                f,
                "parameter {name} has {ndim} dimensions which do not fit in a header"
            ),
            Self::Malformed(reason) => write!(f, "malformed tensor header: {reason}"),
            Self::UnknownDtype { name, shape, code } => write!(
                f,
                "parameter {name} with shape {shape:?} has unknown dtype code {code}"
            ),
        }
    }
}

impl Error for HeaderErr {}

pub type Result<T> = std::result::Result<T, HeaderErr>;

/// Encodes a tensor announcement, or the shutdown marker when `shutdown` is set.
///
/// # Arguments
/// * `name` - The parameter name, at most `MAX_NAME_LEN` bytes of UTF-8.
/// * `shape` - The tensor dimensions.
/// * `dtype` - The element type.
/// * `shutdown` - Whether to encode the shutdown marker instead.
///
/// # Returns
/// The header slots or an error if the layout does not fit.
pub fn encode_header(name: &str, shape: &[usize], dtype: Dtype, shutdown: bool) -> Result<HeaderBuf> {
    let mut buf = [0; HEADER_CAPACITY];

    if shutdown {
        buf[0] = SHUTDOWN_FLAG;
        return Ok(buf);
    }

    let name_bytes = name.as_bytes();
    if name_bytes.len() > MAX_NAME_LEN {
        return Err(HeaderErr::NameTooLong {
            len: name_bytes.len(),
        });
    }

    let used = 2 + name_bytes.len() + 1 + shape.len() + 1;
    if used > HEADER_CAPACITY {
        return Err(HeaderErr::TooManyDims {
            name: name.to_string(),
            ndim: shape.len(),
        });
    }

    let mut slots = buf.iter_mut();
    let mut push = |value: i64| {
        if let Some(slot) = slots.next() {
            *slot = value;
        }
    };

    push(0);
    push(name_bytes.len() as i64);
    name_bytes.iter().for_each(|&b| push(b as i64));
    push(shape.len() as i64);
    shape.iter().for_each(|&d| push(d as i64));
    push(dtype.code());

    Ok(buf)
}

/// Decodes a header produced by `encode_header`.
///
/// Any non-zero first slot is a shutdown marker regardless of the rest.
pub fn decode_header(buf: &HeaderBuf) -> Result<NamedTensorHeader> {
    if buf[0] != 0 {
        return Ok(NamedTensorHeader::Shutdown);
    }

    let name_len = slot_len(buf[1], "name length")?;
    if name_len > MAX_NAME_LEN {
        return Err(HeaderErr::NameTooLong { len: name_len });
    }

    let name_end = 2 + name_len;
    let name_bytes = buf[2..name_end]
        .iter()
        .map(|&v| u8::try_from(v))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| HeaderErr::Malformed("name slot is not a byte".into()))?;

    let name = String::from_utf8(name_bytes)
        .map_err(|_| HeaderErr::Malformed("name is not valid UTF-8".into()))?;

    let ndim = slot_len(buf[name_end], "ndim")?;
    let dims_start = name_end + 1;
    let dtype_slot = dims_start + ndim;
    if dtype_slot >= HEADER_CAPACITY {
        return Err(HeaderErr::Malformed(format!(
            "{ndim} dimensions overflow the header for {name}"
        )));
    }

    let shape = buf[dims_start..dtype_slot]
        .iter()
        .map(|&d| slot_len(d, "dimension"))
        .collect::<Result<Vec<_>>>()?;

    let code = buf[dtype_slot];
    let Some(dtype) = Dtype::from_code(code) else {
        return Err(HeaderErr::UnknownDtype { name, shape, code });
    };

    let fits = shape
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .is_some_and(|nbytes| nbytes <= MAX_TENSOR_BYTES);
    if !fits {
        return Err(HeaderErr::Malformed(format!(
            "{name} with shape {shape:?} exceeds {MAX_TENSOR_BYTES} bytes"
        )));
    }

    Ok(NamedTensorHeader::Parameter(TensorMeta { name, shape, dtype }))
}

fn slot_len(value: i64, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| HeaderErr::Malformed(format!("negative {what} {value}")))
}

/// Serializes header slots into their little-endian wire bytes.
pub fn to_wire_bytes(buf: &HeaderBuf) -> [u8; HEADER_BYTES] {
    let mut bytes = [0; HEADER_BYTES];
    for (chunk, slot) in bytes.chunks_exact_mut(size_of::<i64>()).zip(buf) {
        chunk.copy_from_slice(&slot.to_le_bytes());
    }

    bytes
}

pub fn from_wire_bytes(bytes: &[u8; HEADER_BYTES]) -> HeaderBuf {
    let mut buf = [0; HEADER_CAPACITY];
    for (slot, chunk) in buf.iter_mut().zip(bytes.chunks_exact(size_of::<i64>())) {
        let mut le = [0; size_of::<i64>()];
        le.copy_from_slice(chunk);
        *slot = i64::from_le_bytes(le);
    }

    buf
}
