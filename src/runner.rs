use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Tensor};

use crate::configs::{Config, SMOOTHING, SMOOTH_LOSS_SEED};
use crate::data::{BatchSource, Split};
use crate::loss::{evaluate, verification_loss, Evaluation};
use crate::metadata::RunMetadata;
use crate::snapshot::ParamSnapshot;
use crate::wrn::siamese_verifier;


/// Why the training loop stopped. None of these is an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    NonFiniteLoss,
    Interrupted,
}


/// Raises the stop flag. Returns `false` when it was already raised, which
/// means an earlier request went unanswered.
pub fn request_stop(stop: &AtomicBool) -> bool {
    !stop.swap(true, Ordering::SeqCst)
}


/// Exponential moving average of the batch loss.
pub fn smooth_loss(smooth: f64, batch_loss: f64) -> f64 {
    SMOOTHING * smooth + (1.0 - SMOOTHING) * batch_loss
}


/// Best validation accuracy seen so far, the iteration it was reached at and
/// an independent copy of the parameters at that point.
#[derive(Debug)]
pub struct BestModel {
    pub accuracy: f64,
    pub iteration: u64,
    pub params: ParamSnapshot,
}

impl BestModel {
    pub fn initial(vs: &nn::VarStore) -> Self {
        BestModel {
            accuracy: 0.0,
            iteration: 0,
            params: ParamSnapshot::capture(vs),
        }
    }

    /// Replaces all three fields together when `accuracy` is strictly better.
    pub fn offer(&mut self, iteration: u64, accuracy: f64, vs: &nn::VarStore) -> bool {
        if accuracy > self.accuracy {
            *self = BestModel {
                accuracy,
                iteration,
                params: ParamSnapshot::capture(vs),
            };
            return true;
        }
        false
    }
}


/// Mutable state of a run, threaded through the loop.
#[derive(Debug)]
pub struct TrainingState {
    pub iteration: u64,
    pub smooth_loss: f64,
    pub best: BestModel,
    pub metadata: RunMetadata,
}

impl TrainingState {
    pub fn new(cfg: &Config, vs: &nn::VarStore) -> Self {
        TrainingState {
            iteration: 0,
            smooth_loss: SMOOTH_LOSS_SEED,
            best: BestModel::initial(vs),
            metadata: RunMetadata::new(cfg.clone()),
        }
    }

    fn record_validation(&mut self, eval: Evaluation, vs: &nn::VarStore) -> bool {
        self.metadata.validation_loss.push((self.iteration, eval.loss));
        self.metadata.validation_accuracy.push((self.iteration, eval.accuracy));
        let improved = self.best.offer(self.iteration, eval.accuracy, vs);
        self.metadata.best_iteration = self.best.iteration;
        self.metadata.best_validation_accuracy = self.best.accuracy;
        improved
    }
}


pub struct Trainer<S: BatchSource> {
    cfg: Config,
    vs: nn::VarStore,
    model: nn::FuncT<'static>,
    opt: nn::Optimizer,
    source: S,
    stop: Arc<AtomicBool>,
}

impl<S: BatchSource> Trainer<S> {
    pub fn new(cfg: Config, device: Device, source: S, stop: Arc<AtomicBool>) -> Result<Self> {
        cfg.validate()?;
        if let Some(seed) = cfg.seed {
            tch::manual_seed(seed as i64);
        }

        let vs = nn::VarStore::new(device);
        let model = siamese_verifier(&vs.root(), &cfg);
        let opt = nn::Adam::default().build(&vs, cfg.learning_rate)?;

        Ok(Trainer { cfg, vs, model, opt, source, stop })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn next_batch(&mut self, batch_size: i64, split: Split) -> Result<(Tensor, Tensor)> {
        let batch = self.source.fetch_batch(batch_size, split)?.to_device(self.vs.device());
        let side = self.cfg.image_size;
        Ok((batch.images.view([-1, 1, side, side]), batch.labels))
    }

    /// One Adam step on a training batch. Returns the raw batch loss.
    fn train_step(&mut self) -> Result<f64> {
        let (images, labels) = self.next_batch(self.cfg.batch_size, Split::Train)?;
        let prediction = self.model.forward_t(&images, true);
        let loss = verification_loss(&prediction, &labels, &self.vs);
        self.opt.backward_step(&loss);
        Ok(loss.double_value(&[]))
    }

    // Averages `n_batches` inference-mode evaluations. Returns `None` when the
    // stop flag is raised between batches.
    fn evaluate_split(
        &mut self,
        split: Split,
        batch_size: i64,
        n_batches: usize
        ) -> Result<Option<Evaluation>> {

        let mut net_loss = 0.0;
        let mut net_acc = 0.0;
        for _ in 0..n_batches {
            if self.interrupted() {
                return Ok(None);
            }
            let (images, labels) = self.next_batch(batch_size, split)?;
            let eval = evaluate(&self.model, &self.vs, &images, &labels);
            net_loss += eval.loss;
            net_acc += eval.accuracy;
        }
        Ok(Some(Evaluation {
            loss: net_loss / n_batches as f64,
            accuracy: net_acc / n_batches as f64,
        }))
    }

    /// Runs the optimisation loop until the iteration cap, a non-finite loss
    /// or an interrupt, validating every `val_freq` iterations.
    pub fn train(&mut self) -> Result<TrainingState> {
        let mut state = TrainingState::new(&self.cfg, &self.vs);

        info!("... begin training");
        let reason = loop {
            if state.iteration >= self.cfg.max_iter {
                break StopReason::MaxIterations;
            }
            if self.interrupted() {
                warn!("interrupted before iteration {}", state.iteration + 1);
                break StopReason::Interrupted;
            }
            state.iteration += 1;

            let tick = Instant::now();
            let batch_loss = self.train_step()?;
            let elapsed = tick.elapsed();

            state.smooth_loss = smooth_loss(state.smooth_loss, batch_loss);
            info!(
                "iteration: {} | training loss: {:.6} | batch run time: {:.3} ms",
                state.iteration,
                state.smooth_loss,
                elapsed.as_secs_f64() * 1000.0
            );
            state.metadata.training_loss.push((state.iteration, batch_loss));

            if !batch_loss.is_finite() {
                error!("non-finite training loss ({}) at iteration {}, stopping", batch_loss, state.iteration);
                break StopReason::NonFiniteLoss;
            }

            if state.iteration % self.cfg.val_freq == 0 {
                let val_batch_size = self.cfg.val_batch_size();
                let val_num_batches = self.cfg.val_num_batches;
                let eval = match self.evaluate_split(Split::Val, val_batch_size, val_num_batches)? {
                    Some(eval) => eval,
                    None => {
                        warn!("interrupted during validation at iteration {}", state.iteration);
                        break StopReason::Interrupted;
                    }
                };

                info!("{}", "****".repeat(20));
                info!("validation loss: {:.6}", eval.loss);
                info!("validation accuracy: {:.2}%", eval.accuracy * 100.0);
                info!("{}", "****".repeat(20));

                if state.record_validation(eval, &self.vs) {
                    info!("new best model at iteration {}", state.iteration);
                }
            }
        };

        state.metadata.stop_reason = Some(reason);
        info!("... training done ({:?})", reason);
        info!(
            "best validation accuracy: {:.2}% at iteration number: {}",
            state.best.accuracy * 100.0,
            state.best.iteration
        );
        Ok(state)
    }

    /// Restores the best parameters into the network and evaluates them on
    /// the test split, recording the result in the run metadata. An interrupt
    /// here is not part of training and ends the run with an error.
    pub fn test(&mut self, state: &mut TrainingState) -> Result<Evaluation> {
        info!("... restoring parameters from iteration {}", state.best.iteration);
        state.best.params.restore(&self.vs)?;

        let batch_size = self.cfg.batch_size;
        let n_batches = self.cfg.test_num_batches;
        let eval = match self.evaluate_split(Split::Test, batch_size, n_batches)? {
            Some(eval) => eval,
            None => bail!("interrupted during the test phase"),
        };

        info!("{}", "====".repeat(20));
        info!("final testing loss: {:.6}", eval.loss);
        info!("final testing accuracy: {:.2}%", eval.accuracy * 100.0);
        info!("{}", "====".repeat(20));

        state.metadata.testing_loss = Some(eval.loss);
        state.metadata.testing_accuracy = Some(eval.accuracy);
        Ok(eval)
    }

    /// Training followed by the test phase when the config asks for it.
    pub fn run(&mut self) -> Result<TrainingState> {
        let mut state = self.train()?;
        if self.cfg.testing {
            self.test(&mut state)?;
        }
        Ok(state)
    }
}
