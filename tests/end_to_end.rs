use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tch::{Device, Kind, Tensor};

use wrn_verif::configs::Config;
use wrn_verif::data::Omniglot;
use wrn_verif::metadata::{persist_run, RunMetadata};
use wrn_verif::runner::{StopReason, Trainer};
use wrn_verif::snapshot::ParamSnapshot;


#[test]
fn test_train_test_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let results_dir = dir.path().join("results");

    let cfg = Config {
        expt_name: String::from("e2e"),
        image_size: 8,
        batch_size: 4,
        testing: true,
        max_iter: 4,
        depth: 1,
        width: 1,
        val_freq: 2,
        val_num_batches: 2,
        test_num_batches: 2,
        seed: Some(5),
        ..Default::default()
    };

    let images = Tensor::rand(&[25, 4, 12, 12], (Kind::Float, Device::Cpu));
    let worker = Omniglot::from_tensor(images, cfg.image_size, cfg.data_split, cfg.seed).unwrap();
    let mut trainer = Trainer::new(cfg, Device::Cpu, worker, Arc::new(AtomicBool::new(false))).unwrap();
    let state = trainer.run().unwrap();

    let paths = persist_run(&results_dir, &state.metadata, &state.best.params).unwrap();
    assert_eq!(paths.metadata, results_dir.join("e2e.mtd"));
    assert_eq!(paths.params, results_dir.join("e2e.params"));

    let metadata = RunMetadata::load(&paths.metadata).unwrap();
    assert_eq!(metadata.training_loss.len(), 4);
    assert_eq!(metadata.validation_loss.len(), 2);
    assert_eq!(metadata.stop_reason, Some(StopReason::MaxIterations));
    assert!(metadata.testing_loss.is_some());
    assert!(metadata.testing_accuracy.is_some());

    let params = ParamSnapshot::load(&paths.params).unwrap();
    assert_eq!(params.len(), trainer.var_store().variables().len());
    params.restore(trainer.var_store()).unwrap();
}
