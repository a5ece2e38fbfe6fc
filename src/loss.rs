use tch::{nn, nn::ModuleT, Kind, Tensor};

use crate::configs::L2_COEFFICIENT;


/// Mean loss and accuracy over one or more batches.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}


/// Mean binary cross-entropy between sigmoid probabilities and `{0,1}` targets.
///
/// Written out rather than calling into the fused kernel so that a diverged
/// network yields a non-finite loss instead of an input range panic.
pub fn binary_cross_entropy(prediction: &Tensor, target: &Tensor) -> Tensor {
    let target = target.to_kind(prediction.kind());
    let positive = &target * prediction.log();
    let negative = (1.0 - &target) * (1.0 - prediction).log();
    -(positive + negative).mean(Kind::Float)
}


/// Sum of squares over every trainable variable in the store.
pub fn l2_penalty(vs: &nn::VarStore) -> Tensor {
    vs.trainable_variables()
        .iter()
        .fold(Tensor::zeros(&[], (Kind::Float, vs.device())), |acc, param| {
            acc + (param * param).sum(Kind::Float)
        })
}


/// Training objective: cross-entropy plus a fixed-coefficient L2 penalty.
pub fn verification_loss(prediction: &Tensor, target: &Tensor, vs: &nn::VarStore) -> Tensor {
    binary_cross_entropy(prediction, target) + L2_COEFFICIENT * l2_penalty(vs)
}


/// Fraction of pairs whose thresholded prediction matches the target.
pub fn accuracy(prediction: &Tensor, target: &Tensor) -> Tensor {
    prediction.gt(0.5)
              .to_kind(Kind::Float)
              .eq_tensor(&target.to_kind(Kind::Float))
              .to_kind(Kind::Float)
              .mean(Kind::Float)
}


/// Loss and accuracy of the inference-mode forward path, without gradients.
pub fn evaluate<M: ModuleT>(
    model: &M,
    vs: &nn::VarStore,
    images: &Tensor,
    labels: &Tensor
    ) -> Evaluation {

    tch::no_grad(|| {
        let prediction = model.forward_t(images, false);
        let loss = verification_loss(&prediction, labels, vs);
        Evaluation {
            loss: loss.double_value(&[]),
            accuracy: accuracy(&prediction, labels).double_value(&[]),
        }
    })
}
