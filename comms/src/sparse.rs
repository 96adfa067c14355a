//! Transfer of sparse optimizer results from the sender rank to every peer.
//!
//! A batch of results is sent parameter by parameter: every result's index
//! tensor for a parameter is stacked along a new leading dimension and
//! broadcast once, then the same for the value tensors.

use std::{error::Error, fmt};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    Dtype, Tensor, TensorErr,
    collective::{self, Collective, CollectiveErr},
};

/// One parameter's compressed result.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseResult {
    pub sparse_idx: Tensor,
    pub sparse_val: Tensor,
    /// The dense shape the result decompresses into.
    pub xshape: Vec<usize>,
    /// The element count of the dense parameter.
    pub totalk: usize,
}

/// Shapes and dtypes a receiver needs to allocate a batch of results.
///
/// The four lists hold one entry per parameter and must be equally long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseResultMetadata {
    pub sparse_idx_size: Vec<Vec<usize>>,
    pub sparse_idx_dtype: Dtype,
    pub sparse_val_size: Vec<Vec<usize>>,
    pub sparse_val_dtype: Dtype,
    pub xshape: Vec<Vec<usize>>,
    pub totalk: Vec<usize>,
}

#[derive(Debug)]
pub enum SparseErr {
    MetadataMismatch {
        idx: usize,
        val: usize,
        xshape: usize,
        totalk: usize,
    },
    InconsistentResults(String),
    Tensor(TensorErr),
    Collective(CollectiveErr),
}

impl fmt::Display for SparseErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataMismatch {
                idx,
                val,
                xshape,
                totalk,
            } => write!(
                f,
                "sparse metadata lists differ in length: idx {idx}, val {val}, xshape {xshape}, totalk {totalk}"
            ),
            Self::InconsistentResults(reason) => write!(f, "inconsistent sparse results: {reason}"),
            Self::Tensor(e) => write!(f, "tensor error: {e}"),
            Self::Collective(e) => write!(f, "collective error: {e}"),
        }
    }
}

impl Error for SparseErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tensor(e) => Some(e),
            Self::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorErr> for SparseErr {
    fn from(value: TensorErr) -> Self {
        Self::Tensor(value)
    }
}

impl From<CollectiveErr> for SparseErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

pub type Result<T> = std::result::Result<T, SparseErr>;

impl SparseResultMetadata {
    /// The amount of parameters described, checking the four lists agree.
    pub fn params_len(&self) -> Result<usize> {
        let idx = self.sparse_idx_size.len();
        let val = self.sparse_val_size.len();
        let xshape = self.xshape.len();
        let totalk = self.totalk.len();

        if idx != val || val != xshape || xshape != totalk {
            return Err(SparseErr::MetadataMismatch {
                idx,
                val,
                xshape,
                totalk,
            });
        }

        Ok(idx)
    }

    /// Derives the metadata of a batch of results indexed `[result][param]`.
    ///
    /// # Returns
    /// `None` for an empty batch, or an error if the results disagree on
    /// parameter count, shapes or dtypes.
    pub fn from_results(results: &[Vec<SparseResult>]) -> Result<Option<Self>> {
        let Some(first) = results.first() else {
            return Ok(None);
        };

        let inconsistent = |reason: String| Err(SparseErr::InconsistentResults(reason));

        let (sparse_idx_dtype, sparse_val_dtype) = match first.first() {
            Some(param) => (param.sparse_idx.dtype(), param.sparse_val.dtype()),
            None => return inconsistent("results carry no parameters".into()),
        };

        for (r, result) in results.iter().enumerate() {
            if result.len() != first.len() {
                return inconsistent(format!(
                    "result {r} has {} parameters, result 0 has {}",
                    result.len(),
                    first.len()
                ));
            }

            for (p, (param, reference)) in result.iter().zip(first).enumerate() {
                if param.sparse_idx.dtype() != sparse_idx_dtype
                    || param.sparse_val.dtype() != sparse_val_dtype
                {
                    return inconsistent(format!("result {r} parameter {p} has a different dtype"));
                }

                let same_shape = param.sparse_idx.shape() == reference.sparse_idx.shape()
                    && param.sparse_val.shape() == reference.sparse_val.shape()
                    && param.xshape == reference.xshape
                    && param.totalk == reference.totalk;

                if !same_shape {
                    return inconsistent(format!("result {r} parameter {p} has a different shape"));
                }
            }
        }

        Ok(Some(Self {
            sparse_idx_size: first.iter().map(|p| p.sparse_idx.shape().to_vec()).collect(),
            sparse_idx_dtype,
            sparse_val_size: first.iter().map(|p| p.sparse_val.shape().to_vec()).collect(),
            sparse_val_dtype,
            xshape: first.iter().map(|p| p.xshape.clone()).collect(),
            totalk: first.iter().map(|p| p.totalk).collect(),
        }))
    }
}

/// Receives a batch of `results_len` results described by `metadata`.
///
/// # Arguments
/// * `collective` - The group to receive from.
/// * `results_len` - The amount of results in the batch.
/// * `metadata` - The per parameter shapes and dtypes.
///
/// # Returns
/// The results indexed `[result][param]`.
pub async fn broadcast_sparse_results<C: Collective>(
    collective: &mut C,
    results_len: usize,
    metadata: &SparseResultMetadata,
) -> Result<Vec<Vec<SparseResult>>> {
    let params_len = metadata.params_len()?;
    if results_len == 0 {
        return Ok(Vec::new());
    }

    let mut results: Vec<Vec<SparseResult>> = (0..results_len)
        .map(|_| Vec::with_capacity(params_len))
        .collect();

    for param in 0..params_len {
        let mut idx = Tensor::zeros(
            metadata.sparse_idx_dtype,
            &leading(results_len, &metadata.sparse_idx_size[param]),
        );
        let mut val = Tensor::zeros(
            metadata.sparse_val_dtype,
            &leading(results_len, &metadata.sparse_val_size[param]),
        );

        collective::broadcast_tensor(collective, &mut idx).await?;
        collective::broadcast_tensor(collective, &mut val).await?;

        for (result, (sparse_idx, sparse_val)) in results
            .iter_mut()
            .zip(idx.unstack()?.into_iter().zip(val.unstack()?))
        {
            result.push(SparseResult {
                sparse_idx,
                sparse_val,
                xshape: metadata.xshape[param].clone(),
                totalk: metadata.totalk[param],
            });
        }
    }

    debug!(results_len = results_len, params_len = params_len; "received sparse results");
    Ok(results)
}

/// Sends a batch of results indexed `[result][param]` from the sender rank.
///
/// # Returns
/// The metadata peers need to receive the batch, `None` if it was empty.
pub async fn send_sparse_results<C: Collective>(
    collective: &mut C,
    results: &[Vec<SparseResult>],
) -> Result<Option<SparseResultMetadata>> {
    let Some(metadata) = SparseResultMetadata::from_results(results)? else {
        return Ok(None);
    };

    for param in 0..metadata.params_len()? {
        let idxs: Vec<Tensor> = results.iter().map(|r| r[param].sparse_idx.clone()).collect();
        let mut idx = Tensor::stack(&idxs)?;
        collective::broadcast_tensor(collective, &mut idx).await?;

        let vals: Vec<Tensor> = results.iter().map(|r| r[param].sparse_val.clone()).collect();
        let mut val = Tensor::stack(&vals)?;
        collective::broadcast_tensor(collective, &mut val).await?;
    }

    Ok(Some(metadata))
}

fn leading(len: usize, shape: &[usize]) -> Vec<usize> {
    let mut full = Vec::with_capacity(shape.len() + 1);
    full.push(len);
    full.extend_from_slice(shape);
    full
}
