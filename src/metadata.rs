use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::configs::Config;
use crate::runner::StopReason;
use crate::snapshot::ParamSnapshot;


/// Everything recorded about a run: hyperparameters, per-iteration training
/// loss, per-checkpoint validation metrics and the optional test metrics.
/// Each log holds `(iteration, value)` pairs in iteration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(flatten)]
    pub config: Config,
    #[serde(with = "metric_log")]
    pub training_loss: Vec<(u64, f64)>,
    #[serde(with = "metric_log")]
    pub validation_loss: Vec<(u64, f64)>,
    #[serde(with = "metric_log")]
    pub validation_accuracy: Vec<(u64, f64)>,
    pub best_iteration: u64,
    pub best_validation_accuracy: f64,
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub testing_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub testing_accuracy: Option<f64>,
}

impl RunMetadata {
    pub fn new(config: Config) -> Self {
        RunMetadata {
            config,
            training_loss: Vec::new(),
            validation_loss: Vec::new(),
            validation_accuracy: Vec::new(),
            best_iteration: 0,
            best_validation_accuracy: 0.0,
            stop_reason: None,
            testing_loss: None,
            testing_accuracy: None,
        }
    }

    /// Gzip-compressed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let metadata = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;
        Ok(metadata)
    }
}


// JSON has no non-finite numbers. A diverged run still has to round-trip, so
// NaN and the infinities are written as the strings "NaN", "inf" and "-inf".
mod metric_log {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Finite(f64),
        Special(String),
    }

    fn encode(value: f64) -> Value {
        if value.is_finite() {
            Value::Finite(value)
        } else if value.is_nan() {
            Value::Special(String::from("NaN"))
        } else if value > 0.0 {
            Value::Special(String::from("inf"))
        } else {
            Value::Special(String::from("-inf"))
        }
    }

    fn decode<E: de::Error>(value: Value) -> Result<f64, E> {
        match value {
            Value::Finite(value) => Ok(value),
            Value::Special(name) => match name.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("unknown metric value {:?}", other))),
            },
        }
    }

    pub fn serialize<S: Serializer>(log: &[(u64, f64)], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(log.iter().map(|(iteration, value)| (*iteration, encode(*value))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(u64, f64)>, D::Error> {
        Vec::<(u64, Value)>::deserialize(deserializer)?
            .into_iter()
            .map(|(iteration, value)| decode(value).map(|value| (iteration, value)))
            .collect()
    }
}


/// Output files of a run, both keyed by the experiment name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPaths {
    pub metadata: PathBuf,
    pub params: PathBuf,
}

impl ResultPaths {
    pub fn new<P: AsRef<Path>>(results_dir: P, expt_name: &str) -> Self {
        let dir = results_dir.as_ref();
        ResultPaths {
            metadata: dir.join(format!("{}.mtd", expt_name)),
            params: dir.join(format!("{}.params", expt_name)),
        }
    }
}


/// Writes the metadata record and the best parameters. Any failure is fatal
/// to the caller; nothing is retried.
pub fn persist_run<P: AsRef<Path>>(
    results_dir: P,
    metadata: &RunMetadata,
    best_params: &ParamSnapshot
    ) -> Result<ResultPaths> {

    let results_dir = results_dir.as_ref();
    fs::create_dir_all(results_dir)
        .with_context(|| format!("creating results directory {}", results_dir.display()))?;
    let paths = ResultPaths::new(results_dir, &metadata.config.expt_name);

    log::info!("... serializing metadata to {}", paths.metadata.display());
    metadata.save(&paths.metadata)?;

    log::info!("... serializing parameters to {}", paths.params.display());
    best_params.save(&paths.params)
        .with_context(|| format!("writing {}", paths.params.display()))?;

    Ok(paths)
}



#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn sample_metadata() -> RunMetadata {
        let config = Config { expt_name: String::from("unit"), max_iter: 3, ..Default::default() };
        let mut metadata = RunMetadata::new(config);
        metadata.training_loss = vec![(1, 0.7), (2, 0.65), (3, 0.6)];
        metadata.validation_loss = vec![(3, 0.62)];
        metadata.validation_accuracy = vec![(3, 0.55)];
        metadata.best_iteration = 3;
        metadata.best_validation_accuracy = 0.55;
        metadata.stop_reason = Some(StopReason::MaxIterations);
        metadata
    }

    #[test]
    fn test_result_paths() {
        let paths = ResultPaths::new("results", "w_o_test");
        assert_eq!(paths.metadata, PathBuf::from("results/w_o_test.mtd"));
        assert_eq!(paths.params, PathBuf::from("results/w_o_test.params"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.mtd");
        let metadata = sample_metadata();
        metadata.save(&path).unwrap();

        let loaded = RunMetadata::load(&path).unwrap();
        assert_eq!(loaded.config.expt_name, "unit");
        assert_eq!(loaded.training_loss, metadata.training_loss);
        assert_eq!(loaded.validation_accuracy, metadata.validation_accuracy);
        assert_eq!(loaded.stop_reason, Some(StopReason::MaxIterations));
        assert_eq!(loaded.testing_loss, None);
    }

    #[test]
    fn test_non_finite_losses_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diverged.mtd");
        let mut metadata = sample_metadata();
        metadata.training_loss.push((4, f64::INFINITY));
        metadata.training_loss.push((5, f64::NAN));
        metadata.validation_loss.push((5, f64::NEG_INFINITY));
        metadata.stop_reason = Some(StopReason::NonFiniteLoss);

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["training_loss"][4], serde_json::json!([5, "NaN"]));
        assert_eq!(value["training_loss"][3], serde_json::json!([4, "inf"]));

        metadata.save(&path).unwrap();
        let loaded = RunMetadata::load(&path).unwrap();
        assert_eq!(loaded.training_loss.len(), 5);
        assert_eq!(&loaded.training_loss[..3], &metadata.training_loss[..3]);
        assert_eq!(loaded.training_loss[3], (4, f64::INFINITY));
        assert_eq!(loaded.training_loss[4].0, 5);
        assert!(loaded.training_loss[4].1.is_nan());
        assert_eq!(loaded.validation_loss[1], (5, f64::NEG_INFINITY));
        assert_eq!(loaded.stop_reason, Some(StopReason::NonFiniteLoss));
    }

    #[test]
    fn test_hyperparameters_are_top_level_fields() {
        let value = serde_json::to_value(sample_metadata()).unwrap();
        assert_eq!(value["learning_rate"], serde_json::json!(1e-3));
        assert_eq!(value["batch_size"], serde_json::json!(32));
        assert_eq!(value["training_loss"][1], serde_json::json!([2, 0.65]));
        assert!(value.get("testing_accuracy").is_none());
    }

    #[test]
    fn test_persist_run_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().join("results");

        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().zeros("w", &[2]);
        let snapshot = ParamSnapshot::capture(&vs);

        let paths = persist_run(&results_dir, &sample_metadata(), &snapshot).unwrap();
        assert!(paths.metadata.exists());
        assert!(paths.params.exists());
        assert_eq!(ParamSnapshot::load(&paths.params).unwrap().len(), 1);
    }

    #[test]
    fn test_persist_run_fails_on_unwritable_target() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the results directory should be.
        let blocker = dir.path().join("results");
        File::create(&blocker).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let snapshot = ParamSnapshot::capture(&vs);
        assert!(persist_run(&blocker, &sample_metadata(), &snapshot).is_err());
    }
}
