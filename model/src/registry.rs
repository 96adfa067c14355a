use std::collections::{BTreeMap, HashMap};

use comms::{Dtype, Tensor};
use log::debug;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{RegistryErr, transforms};

pub type Result<T> = std::result::Result<T, RegistryErr>;

/// Named parameters that can be updated in place.
///
/// The set of names is fixed when the registry is built, every parameter
/// sits behind its own lock so writers to different parameters never
/// contend and two writers to the same one are serialized.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    params: HashMap<String, RwLock<Tensor>>,
}

impl ParameterRegistry {
    /// Creates a new `ParameterRegistry`.
    ///
    /// # Arguments
    /// * `params` - The initial value of every parameter.
    pub fn new<I>(params: I) -> Self
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let params = params
            .into_iter()
            .map(|(name, tensor)| (name, RwLock::new(tensor)))
            .collect();

        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Every parameter name in lexicographic order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.params.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Shape and dtype of `name`.
    pub fn meta(&self, name: &str) -> Option<(Vec<usize>, Dtype)> {
        let param = self.params.get(name)?.read();
        Some((param.shape().to_vec(), param.dtype()))
    }

    /// A copy of the current value of `name`.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        Ok(self.entry(name)?.read().clone())
    }

    /// Overwrites `name` with `value` without reallocating it.
    ///
    /// # Returns
    /// A recoverable error if the name is unknown or the shape or dtype differ.
    pub fn copy_into(&self, name: &str, value: &Tensor) -> Result<()> {
        let mut param = self.entry(name)?.write();
        check_compatible(name, &param, value)?;

        param.as_bytes_mut().copy_from_slice(value.as_bytes());
        debug!(name = name; "parameter overwritten");
        Ok(())
    }

    /// Adds `delta` onto `name`.
    pub fn add_into(&self, name: &str, delta: &Tensor) -> Result<()> {
        let mut param = self.entry(name)?.write();
        check_compatible(name, &param, delta)?;

        transforms::add_assign(&mut param, delta)?;
        debug!(name = name; "delta applied");
        Ok(())
    }

    /// Runs `f` with exclusive access to `name`.
    pub fn update_with<F, R>(&self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Tensor) -> R,
    {
        let mut param = self.entry(name)?.write();
        Ok(f(&mut param))
    }

    /// Copies every parameter, keyed and ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, Tensor> {
        self.params
            .par_iter()
            .map(|(name, param)| (name.clone(), param.read().clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }

    fn entry(&self, name: &str) -> Result<&RwLock<Tensor>> {
        self.params
            .get(name)
            .ok_or_else(|| RegistryErr::NotFound(name.to_string()))
    }
}

fn check_compatible(name: &str, param: &Tensor, value: &Tensor) -> Result<()> {
    if param.shape() != value.shape() {
        return Err(RegistryErr::ShapeMismatch {
            name: name.to_string(),
            expected: param.shape().to_vec(),
            got: value.shape().to_vec(),
        });
    }

    if param.dtype() != value.dtype() {
        return Err(RegistryErr::DtypeMismatch {
            name: name.to_string(),
            expected: param.dtype(),
            got: value.dtype(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn registry() -> ParameterRegistry {
        ParameterRegistry::new([
            ("a".to_string(), Tensor::zeros(Dtype::F32, &[2])),
            ("b".to_string(), Tensor::zeros(Dtype::BF16, &[2, 2])),
        ])
    }

    #[test]
    fn copy_into_requires_matching_shape_and_dtype() {
        let reg = registry();
        let value = Tensor::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap();

        reg.copy_into("a", &value).unwrap();
        assert_eq!(reg.get("a").unwrap(), value);

        let wrong_shape = Tensor::zeros(Dtype::F32, &[3]);
        let err = reg.copy_into("a", &wrong_shape).unwrap_err();
        assert!(matches!(err, RegistryErr::ShapeMismatch { .. }));
        assert!(err.is_recoverable());

        let wrong_dtype = Tensor::zeros(Dtype::F64, &[2]);
        assert!(matches!(
            reg.copy_into("a", &wrong_dtype),
            Err(RegistryErr::DtypeMismatch { .. })
        ));

        assert_eq!(
            reg.copy_into("missing", &value),
            Err(RegistryErr::NotFound("missing".into()))
        );
    }

    #[test]
    fn add_into_accumulates() {
        let reg = registry();
        let delta = Tensor::from_vec(vec![2], vec![0.5f32, -1.0]).unwrap();

        reg.add_into("a", &delta).unwrap();
        reg.add_into("a", &delta).unwrap();
        assert_eq!(reg.get("a").unwrap().to_vec::<f32>().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn concurrent_writers_are_serialized_per_parameter() {
        let reg = Arc::new(registry());
        let delta = Tensor::from_vec(vec![2], vec![1.0f32, 1.0]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let delta = delta.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        reg.add_into("a", &delta).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(reg.get("a").unwrap().to_vec::<f32>().unwrap(), vec![200.0, 200.0]);
    }

    #[test]
    fn snapshot_is_ordered_by_name() {
        let reg = registry();
        let snapshot = reg.snapshot();

        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert_eq!(reg.meta("b"), Some((vec![2, 2], Dtype::BF16)));
    }
}
