//! Layout conversions between training side and inference side weights.

use comms::{Element, Tensor, with_element};
use ndarray::{Array1, Array4};

use crate::TransformErr;

type Result<T> = std::result::Result<T, TransformErr>;

/// Converts a q or k projection from interleaved rotary pairs to grouped halves.
///
/// The leading dimension `n_heads * head_dim` is viewed as
/// `(n_heads, head_dim / 2, 2)` and the last two axes are swapped.
///
/// # Arguments
/// * `w` - A weight of shape `(n_heads * head_dim, ..)` or a bias of shape `(n_heads * head_dim,)`.
/// * `n_heads` - The amount of heads the leading dimension holds.
///
/// # Returns
/// The permuted tensor with the same shape and dtype as `w`.
pub fn permute_for_rotary(w: &Tensor, n_heads: usize) -> Result<Tensor> {
    let head_dim = head_dim(w, n_heads)?;
    swap_head_axes(w, n_heads, (head_dim / 2, 2))
}

/// Inverse of `permute_for_rotary`, grouped halves back to interleaved pairs.
pub fn unpermute_for_rotary(w: &Tensor, n_heads: usize) -> Result<Tensor> {
    let head_dim = head_dim(w, n_heads)?;
    swap_head_axes(w, n_heads, (2, head_dim / 2))
}

fn head_dim(w: &Tensor, n_heads: usize) -> Result<usize> {
    let rows = w.shape().first().copied().unwrap_or(0);
    if n_heads == 0 || rows == 0 || rows % n_heads != 0 {
        return Err(TransformErr::HeadsDoNotDivide { rows, n_heads });
    }

    let head_dim = rows / n_heads;
    if head_dim % 2 != 0 {
        return Err(TransformErr::OddHeadDim { head_dim });
    }

    Ok(head_dim)
}

fn swap_head_axes(w: &Tensor, n_heads: usize, (a, b): (usize, usize)) -> Result<Tensor> {
    let inner: usize = w.shape()[1..].iter().product();

    let data = with_element!(w.dtype(), T => {
        let values = w.to_vec::<T>()?;
        let view = Array4::from_shape_vec((n_heads, a, b, inner), values)?;
        let swapped: Vec<T> = view.permuted_axes([0, 2, 1, 3]).iter().copied().collect();
        bytemuck::cast_slice::<T, u8>(&swapped).to_vec()
    });

    Ok(Tensor::from_bytes(w.dtype(), w.shape().to_vec(), data)?)
}

/// Concatenates tensors along their leading dimension.
///
/// Every part must share the dtype and every trailing dimension.
pub fn concat_rows(parts: &[&Tensor]) -> Result<Tensor> {
    let first = parts.first().ok_or(TransformErr::Empty)?;
    let trailing = first.shape().get(1..).unwrap_or_default();

    let mut rows = 0;
    let mut data = Vec::with_capacity(parts.iter().map(|p| p.nbytes()).sum());

    for part in parts {
        if part.dtype() != first.dtype() {
            return Err(TransformErr::DtypeMismatch {
                expected: first.dtype(),
                got: part.dtype(),
            });
        }

        let Some((&part_rows, part_trailing)) = part.shape().split_first() else {
            return Err(TransformErr::ShapeMismatch {
                expected: first.shape().to_vec(),
                got: Vec::new(),
            });
        };

        if part_trailing != trailing {
            return Err(TransformErr::ShapeMismatch {
                expected: trailing.to_vec(),
                got: part_trailing.to_vec(),
            });
        }

        rows += part_rows;
        data.extend_from_slice(part.as_bytes());
    }

    let mut shape = vec![rows];
    shape.extend_from_slice(trailing);
    Ok(Tensor::from_bytes(first.dtype(), shape, data)?)
}

/// Adds `delta` element-wise into `target`, converting `delta` to the target dtype.
pub fn add_assign(target: &mut Tensor, delta: &Tensor) -> Result<()> {
    if target.shape() != delta.shape() {
        return Err(TransformErr::ShapeMismatch {
            expected: target.shape().to_vec(),
            got: delta.shape().to_vec(),
        });
    }

    let sum = Array1::from(target.to_f64_vec()) + Array1::from(delta.to_f64_vec());
    let summed = Tensor::from_f64_slice(target.dtype(), target.shape().to_vec(), &sum.to_vec())?;
    target.as_bytes_mut().copy_from_slice(summed.as_bytes());

    Ok(())
}

/// Scatters `values` into the flattened `target` at `indices`, adding onto what is there.
///
/// Nothing is written unless every index is a valid position.
pub fn scatter_add<I: Element>(target: &mut Tensor, indices: &[I], values: &[f64]) -> Result<()> {
    if indices.len() != values.len() {
        return Err(TransformErr::LengthMismatch {
            indices: indices.len(),
            values: values.len(),
        });
    }

    let mut dense = target.to_f64_vec();
    let len = dense.len();

    for (&idx, &value) in indices.iter().zip(values) {
        let index = idx.to_f64();
        if !index.is_finite() || index < 0.0 || index.fract() != 0.0 || index >= len as f64 {
            return Err(TransformErr::BadIndex { index, len });
        }

        dense[index as usize] += value;
    }

    let updated = Tensor::from_f64_slice(target.dtype(), target.shape().to_vec(), &dense)?;
    target.as_bytes_mut().copy_from_slice(updated.as_bytes());

    Ok(())
}

#[cfg(test)]
mod tests {
    use comms::Dtype;

    use super::*;

    fn iota(shape: Vec<usize>) -> Tensor {
        let numel = shape.iter().product::<usize>();
        Tensor::from_vec(shape, (0..numel).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn permute_groups_interleaved_pairs() {
        // One head of dim 4 over a single column: rows [a0 b0 a1 b1] become [a0 a1 b0 b1].
        let w = Tensor::from_vec(vec![4, 1], vec![0.0f32, 1.0, 2.0, 3.0]).unwrap();
        let p = permute_for_rotary(&w, 1).unwrap();
        assert_eq!(p.to_vec::<f32>().unwrap(), vec![0.0, 2.0, 1.0, 3.0]);
        assert_eq!(p.shape(), w.shape());
    }

    #[test]
    fn unpermute_inverts_permute_for_every_even_head_dim() {
        for head_dim in [2, 4, 6, 8, 64] {
            for n_heads in [1, 3] {
                let w = iota(vec![n_heads * head_dim, 5]);
                let p = permute_for_rotary(&w, n_heads).unwrap();
                assert_eq!(unpermute_for_rotary(&p, n_heads).unwrap(), w);
            }
        }
    }

    #[test]
    fn permute_is_self_inverse_for_small_heads() {
        for head_dim in [2, 4] {
            let w = iota(vec![2 * head_dim, 3]);
            let once = permute_for_rotary(&w, 2).unwrap();
            assert_eq!(permute_for_rotary(&once, 2).unwrap(), w);
        }
    }

    #[test]
    fn permute_handles_bias_vectors() {
        let b = iota(vec![8]);
        let p = permute_for_rotary(&b, 2).unwrap();
        assert_eq!(p.shape(), &[8]);
        assert_eq!(p.to_vec::<f32>().unwrap(), vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn odd_head_dim_is_rejected() {
        let w = iota(vec![6, 2]);
        assert_eq!(
            permute_for_rotary(&w, 2).unwrap_err(),
            TransformErr::OddHeadDim { head_dim: 3 }
        );
        assert!(matches!(
            permute_for_rotary(&w, 4),
            Err(TransformErr::HeadsDoNotDivide { .. })
        ));
    }

    #[test]
    fn permute_keeps_half_precision_bits() {
        let w = iota(vec![4, 2]).cast(Dtype::BF16);
        let p = permute_for_rotary(&w, 1).unwrap();
        assert_eq!(p.dtype(), Dtype::BF16);
        assert_eq!(unpermute_for_rotary(&p, 1).unwrap(), w);
    }

    #[test]
    fn concat_stacks_rows_in_order() {
        let a = Tensor::from_vec(vec![1, 2], vec![1i32, 2]).unwrap();
        let b = Tensor::from_vec(vec![2, 2], vec![3i32, 4, 5, 6]).unwrap();

        let c = concat_rows(&[&a, &b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);

        let wide = Tensor::zeros(Dtype::I32, &[1, 3]);
        assert!(matches!(
            concat_rows(&[&a, &wide]),
            Err(TransformErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn add_assign_converts_the_delta() {
        let mut w = Tensor::from_vec(vec![3], vec![1.0f32, 2.0, 3.0]).unwrap();
        let delta = Tensor::from_vec(vec![3], vec![0.5f64, -2.0, 1.0]).unwrap();

        add_assign(&mut w, &delta).unwrap();
        assert_eq!(w.dtype(), Dtype::F32);
        assert_eq!(w.to_vec::<f32>().unwrap(), vec![1.5, 0.0, 4.0]);
    }

    #[test]
    fn scatter_add_touches_only_listed_positions() {
        let mut w = Tensor::zeros(Dtype::F32, &[2, 2]);
        scatter_add(&mut w, &[3i64, 0], &[1.0, -1.0]).unwrap();
        assert_eq!(w.to_vec::<f32>().unwrap(), vec![-1.0, 0.0, 0.0, 1.0]);

        assert_eq!(
            scatter_add(&mut w, &[4i64], &[1.0]).unwrap_err(),
            TransformErr::BadIndex { index: 4.0, len: 4 }
        );
        assert_eq!(
            scatter_add(&mut w, &[-1i64], &[5.0]).unwrap_err(),
            TransformErr::BadIndex { index: -1.0, len: 4 }
        );
        assert!(matches!(
            scatter_add(&mut w, &[f32::NAN], &[5.0]),
            Err(TransformErr::BadIndex { len: 4, .. })
        ));
        assert_eq!(
            scatter_add(&mut w, &[1i64, 0], &[7.0]).unwrap_err(),
            TransformErr::LengthMismatch { indices: 2, values: 1 }
        );

        assert_eq!(w.to_vec::<f32>().unwrap(), vec![-1.0, 0.0, 0.0, 1.0]);
    }
}
