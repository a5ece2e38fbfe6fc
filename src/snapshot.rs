use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};
use thiserror::Error;


#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("variable {0} is missing from the snapshot")]
    Missing(String),
    #[error("variable {name} has shape {live:?}, snapshot holds {stored:?}")]
    Shape { name: String, live: Vec<i64>, stored: Vec<i64> },
}


// Orders dotted variable paths component by component, numeric components as
// numbers, so that `stage1.2.conv1.weight` comes before `stage1.10.conv1.weight`.
fn path_order(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        let (x, y) = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => (x, y),
        };
        let order = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if order != Ordering::Equal {
            return order;
        }
    }
}


// On-disk form of one variable.
#[derive(Serialize, Deserialize)]
struct StoredTensor {
    name: String,
    shape: Vec<i64>,
    values: Vec<f32>,
}


/// Deep copy of every variable in a `VarStore`, trainable weights and
/// batch-norm running statistics alike, ordered by variable path with block
/// indices compared numerically.
#[derive(Debug)]
pub struct ParamSnapshot {
    params: Vec<(String, Tensor)>,
}

impl ParamSnapshot {
    pub fn capture(vs: &nn::VarStore) -> Self {
        let mut params: Vec<(String, Tensor)> = tch::no_grad(|| {
            vs.variables()
              .into_iter()
              .map(|(name, var)| {
                  let mut copy = var.zeros_like();
                  copy.copy_(&var);
                  (name, copy)
              })
              .collect()
        });
        params.sort_by(|a, b| path_order(&a.0, &b.0));
        ParamSnapshot { params }
    }

    /// Writes the snapshot back into the live variables of `vs`. Every live
    /// variable must be present with a matching shape.
    pub fn restore(&self, vs: &nn::VarStore) -> Result<(), SnapshotError> {
        let mut live = vs.variables();
        for name in live.keys() {
            if self.get(name).is_none() {
                return Err(SnapshotError::Missing(name.clone()));
            }
        }
        tch::no_grad(|| {
            for (name, stored) in self.params.iter() {
                let var = live.get_mut(name).ok_or_else(|| SnapshotError::Missing(name.clone()))?;
                if var.size() != stored.size() {
                    return Err(SnapshotError::Shape {
                        name: name.clone(),
                        live: var.size(),
                        stored: stored.size(),
                    });
                }
                var.copy_(stored);
            }
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Gzip-compressed bincode list of `(name, shape, f32 values)`, in
    /// snapshot order.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        let stored: Vec<StoredTensor> = self.params.iter()
            .map(|(name, tensor)| {
                let tensor = tensor.to_kind(Kind::Float).to_device(Device::Cpu);
                let numel = tensor.numel();
                let mut values = vec![0f32; numel];
                tensor.copy_data(&mut values, numel);
                StoredTensor { name: name.clone(), shape: tensor.size(), values }
            })
            .collect();

        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::serde::encode_into_std_write(&stored, &mut encoder, bincode::config::standard())?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
        let stored: Vec<StoredTensor> =
            bincode::serde::decode_from_std_read(&mut decoder, bincode::config::standard())?;
        let mut params: Vec<(String, Tensor)> = stored.into_iter()
            .map(|t| (t.name, Tensor::of_slice(&t.values).reshape(&t.shape)))
            .collect();
        params.sort_by(|a, b| path_order(&a.0, &b.0));
        Ok(ParamSnapshot { params })
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _w = root.randn_standard("w", &[3, 2]);
        let _b = root.zeros("b", &[2]);
        let _mean = root.zeros_no_train("running_mean", &[2]);
        vs
    }

    #[test]
    fn test_capture_is_a_copy() {
        let vs = store();
        let snapshot = ParamSnapshot::capture(&vs);
        let before = snapshot.get("w").unwrap() * 1.0;

        let mut live = vs.variables();
        tch::no_grad(|| live.get_mut("w").unwrap().fill_(5.0));

        assert_eq!(snapshot.get("w").unwrap(), &before);
        assert_eq!(snapshot.len(), 3);
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "running_mean", "w"]);
    }

    #[test]
    fn test_block_indices_sort_numerically() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        for idx in [10, 2, 0, 1] {
            let _w = (&root / "stage1" / idx).zeros("weight", &[1]);
        }
        let _stem = root.zeros("stem", &[1]);

        let snapshot = ParamSnapshot::capture(&vs);
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![
            "stage1.0.weight",
            "stage1.1.weight",
            "stage1.2.weight",
            "stage1.10.weight",
            "stem",
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.params");
        snapshot.save(&path).unwrap();
        let loaded = ParamSnapshot::load(&path).unwrap();
        let loaded_names: Vec<&str> = loaded.iter().map(|(n, _)| n).collect();
        assert_eq!(loaded_names, names);
    }

    #[test]
    fn test_path_order() {
        assert_eq!(path_order("a.2.w", "a.10.w"), Ordering::Less);
        assert_eq!(path_order("a.10", "a.10.w"), Ordering::Less);
        assert_eq!(path_order("bn1.weight", "bn1.bias"), Ordering::Greater);
        assert_eq!(path_order("a.1.w", "a.1.w"), Ordering::Equal);
    }

    #[test]
    fn test_restore() {
        let vs = store();
        let snapshot = ParamSnapshot::capture(&vs);

        let mut live = vs.variables();
        tch::no_grad(|| {
            live.get_mut("w").unwrap().fill_(5.0);
            live.get_mut("running_mean").unwrap().fill_(1.0);
        });
        snapshot.restore(&vs).unwrap();

        let live = vs.variables();
        assert_eq!(&live["w"], snapshot.get("w").unwrap());
        assert_eq!(live["running_mean"], Tensor::zeros(&[2], (Kind::Float, Device::Cpu)));
    }

    #[test]
    fn test_restore_rejects_other_topology() {
        let vs = store();
        let snapshot = ParamSnapshot::capture(&vs);

        let other = nn::VarStore::new(Device::Cpu);
        let _w = other.root().zeros("w", &[4, 4]);
        let _b = other.root().zeros("b", &[2]);
        let _mean = other.root().zeros_no_train("running_mean", &[2]);
        assert!(matches!(snapshot.restore(&other), Err(SnapshotError::Shape { .. })));

        let extra = store();
        let _x = extra.root().zeros("x", &[1]);
        assert!(matches!(snapshot.restore(&extra), Err(SnapshotError::Missing(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.params");

        let vs = store();
        let snapshot = ParamSnapshot::capture(&vs);
        snapshot.save(&path).unwrap();

        let loaded = ParamSnapshot::load(&path).unwrap();
        assert_eq!(loaded.len(), snapshot.len());
        for (name, tensor) in snapshot.iter() {
            assert_eq!(loaded.get(name).unwrap(), tensor);
        }
    }
}
