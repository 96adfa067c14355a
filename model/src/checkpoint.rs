//! Reading and writing named tensors as safetensors files.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use comms::{Dtype, Tensor, TensorErr};
use log::{debug, info};
use safetensors::{SafeTensors, View};

#[derive(Debug)]
pub enum CheckpointErr {
    Io { path: PathBuf, source: io::Error },
    Format { path: PathBuf, detail: String },
    UnsupportedDtype { name: String, dtype: String },
    Tensor(TensorErr),
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Format { path, detail } => write!(f, "{}: invalid safetensors: {detail}", path.display()),
            Self::UnsupportedDtype { name, dtype } => {
                write!(f, "tensor {name} has unsupported dtype {dtype}")
            }
            Self::Tensor(e) => write!(f, "{e}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorErr> for CheckpointErr {
    fn from(value: TensorErr) -> Self {
        Self::Tensor(value)
    }
}

impl From<CheckpointErr> for io::Error {
    fn from(value: CheckpointErr) -> Self {
        match value {
            CheckpointErr::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// Reads every tensor stored in the file at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| CheckpointErr::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let file = SafeTensors::deserialize(&bytes).map_err(|e| CheckpointErr::Format {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let mut tensors = Vec::with_capacity(file.len());
    for (name, view) in file.tensors() {
        let dtype = from_safetensors(&name, view.dtype())?;
        let tensor = Tensor::from_bytes(dtype, view.shape().to_vec(), view.data().to_vec())?;
        tensors.push((name, tensor));
    }

    debug!(path:% = path.display(), tensors = tensors.len(); "loaded checkpoint");
    Ok(tensors)
}

/// Reads and merges several files, later files win on duplicate names.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<BTreeMap<String, Tensor>> {
    let mut merged = BTreeMap::new();
    for path in paths {
        merged.extend(load(path)?);
    }

    info!(files = paths.len(), tensors = merged.len(); "checkpoint loaded");
    Ok(merged)
}

/// Writes `params` into a single file at `path`.
pub fn save(path: impl AsRef<Path>, params: &BTreeMap<String, Tensor>) -> Result<()> {
    let path = path.as_ref();
    let views = params.iter().map(|(name, tensor)| (name.as_str(), TensorView(tensor)));

    safetensors::serialize_to_file(views, &None, path).map_err(|e| CheckpointErr::Format {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

struct TensorView<'a>(&'a Tensor);

impl View for TensorView<'_> {
    fn dtype(&self) -> safetensors::Dtype {
        to_safetensors(self.0.dtype())
    }

    fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.0.as_bytes())
    }

    fn data_len(&self) -> usize {
        self.0.nbytes()
    }
}

fn from_safetensors(name: &str, dtype: safetensors::Dtype) -> Result<Dtype> {
    use safetensors::Dtype as St;

    Ok(match dtype {
        St::F32 => Dtype::F32,
        St::F16 => Dtype::F16,
        St::BF16 => Dtype::BF16,
        St::F64 => Dtype::F64,
        St::I64 => Dtype::I64,
        St::I32 => Dtype::I32,
        St::I16 => Dtype::I16,
        St::I8 => Dtype::I8,
        St::U8 => Dtype::U8,
        St::BOOL => Dtype::Bool,
        other => {
            return Err(CheckpointErr::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{other:?}"),
            });
        }
    })
}

fn to_safetensors(dtype: Dtype) -> safetensors::Dtype {
    use safetensors::Dtype as St;

    match dtype {
        Dtype::F32 => St::F32,
        Dtype::F16 => St::F16,
        Dtype::BF16 => St::BF16,
        Dtype::F64 => St::F64,
        Dtype::I64 => St::I64,
        Dtype::I32 => St::I32,
        Dtype::I16 => St::I16,
        Dtype::I8 => St::I8,
        Dtype::U8 => St::U8,
        Dtype::Bool => St::BOOL,
    }
}
