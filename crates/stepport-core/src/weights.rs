use std::collections::BTreeMap;

use crate::{Error, IOName, Result, Tensor};

/// Named weight tensors, kept on the host or mirrored from a device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightStore {
    tensors: BTreeMap<IOName, Tensor>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<IOName>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &IOName) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &IOName) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IOName, &Tensor)> {
        self.tensors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &IOName> {
        self.tensors.keys()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Overwrites every weight that `source` also holds. Each replacement must
    /// keep the stored dtype and shape; names only present in `source` are
    /// ignored. Returns how many weights were replaced.
    pub fn reset_from(&mut self, source: &WeightStore) -> Result<usize> {
        for (name, incoming) in source.iter() {
            if let Some(current) = self.tensors.get(name) {
                current.info.validate(name, incoming)?;
            }
        }

        let mut replaced = 0;
        for (name, current) in self.tensors.iter_mut() {
            if let Some(incoming) = source.get(name) {
                *current = incoming.clone();
                replaced += 1;
            }
        }

        if replaced == 0 && !self.tensors.is_empty() {
            return Err(Error::Model(
                "source model shares no weights with this session".to_string(),
            ));
        }
        Ok(replaced)
    }
}

impl FromIterator<(IOName, Tensor)> for WeightStore {
    fn from_iter<T: IntoIterator<Item = (IOName, Tensor)>>(iter: T) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape;

    fn w(values: &[f32]) -> Tensor {
        Tensor::from_f32(Shape::from_slice(&[values.len()]), values)
    }

    #[test]
    fn reset_replaces_shared_names_only() {
        let mut store: WeightStore = [
            (IOName::from("w0"), w(&[1.0, 1.0])),
            (IOName::from("w1"), w(&[2.0])),
        ]
        .into_iter()
        .collect();
        let source: WeightStore = [
            (IOName::from("w0"), w(&[5.0, 6.0])),
            (IOName::from("other"), w(&[9.0])),
        ]
        .into_iter()
        .collect();

        assert_eq!(store.reset_from(&source).unwrap(), 1);
        assert_eq!(store.get(&"w0".into()).unwrap().to_f32().unwrap(), vec![5.0, 6.0]);
        assert_eq!(store.get(&"w1".into()).unwrap().to_f32().unwrap(), vec![2.0]);
    }

    #[test]
    fn reset_is_all_or_nothing_on_shape_drift() {
        let mut store: WeightStore = [
            (IOName::from("a"), w(&[1.0])),
            (IOName::from("b"), w(&[1.0, 2.0])),
        ]
        .into_iter()
        .collect();
        let source: WeightStore = [
            (IOName::from("a"), w(&[7.0])),
            (IOName::from("b"), w(&[1.0, 2.0, 3.0])),
        ]
        .into_iter()
        .collect();

        assert!(matches!(store.reset_from(&source), Err(Error::ShapeMismatch { .. })));
        assert_eq!(store.get(&"a".into()).unwrap().to_f32().unwrap(), vec![1.0]);
    }
}
