use tch::{nn, Tensor};

use crate::configs::{Config, BN_EPS, DROPOUT_RATE, EMBEDDING_DIM};


fn he_normal(fan_in: i64, gain: f64) -> nn::Init {
    nn::Init::Randn {
        mean: 0.0,
        stdev: (gain / fan_in as f64).sqrt(),
    }
}

fn conv2d(
    vs: &nn::Path,
    c_in: i64,
    c_out: i64,
    kernel_size: i64,
    stride: i64,
    bias: bool
    ) -> nn::Conv2D {

    let conv2d_cfg = nn::ConvConfig {
        stride,
        padding: kernel_size / 2,
        bias,
        ws_init: he_normal(c_in * kernel_size * kernel_size, 2.0),
        ..Default::default()
    };
    return nn::conv2d(vs, c_in, c_out, kernel_size, conv2d_cfg);
}

// 1x1 projection on the skip path, no bias and default init.
fn projection(vs: &nn::Path, c_in: i64, c_out: i64, stride: i64) -> nn::Conv2D {
    let conv2d_cfg = nn::ConvConfig {
        stride,
        bias: false,
        ..Default::default()
    };
    return nn::conv2d(vs, c_in, c_out, 1, conv2d_cfg);
}

fn batch_norm(vs: &nn::Path, channels: i64) -> nn::BatchNorm {
    let bn_cfg = nn::BatchNormConfig {
        eps: BN_EPS,
        ..Default::default()
    };
    return nn::batch_norm2d(vs, channels, bn_cfg);
}


/// Pre-activation wide residual block.
///
/// `first` marks the block right after the stem: its input was already
/// normalised and rectified, so the pre-activation is skipped and the skip
/// path is projected to the new channel count. `increase_dim` halves the
/// spatial resolution, both on the branch and on the projected skip path.
/// The sum is returned without an activation.
pub fn residual_block(
    vs: &nn::Path,
    c_in: i64,
    filters: i64,
    increase_dim: bool,
    first: bool
    ) -> nn::FuncT<'static> {

    let first_stride = if increase_dim { 2 } else { 1 };

    let bn_pre = if first { None } else { Some(batch_norm(&(vs / "bn_pre"), c_in)) };
    let conv1  = conv2d(&(vs / "conv1"), c_in, filters, 3, first_stride, false);
    let bn1    = batch_norm(&(vs / "bn1"), filters);
    let conv2  = conv2d(&(vs / "conv2"), filters, filters, 3, 1, true);

    let skip = if increase_dim {
        Some(projection(&(vs / "projection"), c_in, filters, 2))
    } else if first {
        Some(projection(&(vs / "projection"), c_in, filters, 1))
    } else {
        None
    };

    return nn::func_t(move |xs, train| {
        let branch_in = match &bn_pre {
            Some(bn) => xs.apply_t(bn, train).relu(),
            None => xs.shallow_clone(),
        };
        let ys = branch_in.apply(&conv1)
                          .apply_t(&bn1, train)
                          .relu()
                          .dropout(DROPOUT_RATE, train)
                          .apply(&conv2);
        match &skip {
            Some(proj) => ys + xs.apply(proj),
            None => ys + xs,
        }
    });
}


fn stack_residual_blocks(
    vs: &nn::Path,
    c_in: i64,
    filters: i64,
    increase_dim: bool,
    first: bool,
    num_blocks: i64
    ) -> nn::SequentialT {

    let mut blocks = nn::seq_t().add(residual_block(&(vs / 0), c_in, filters, increase_dim, first));
    for block_idx in 1..num_blocks {
        blocks = blocks.add(residual_block(&(vs / block_idx), filters, filters, false, false));
    }
    return blocks;
}


/// Number of residual blocks in the three stages for a given depth.
pub fn n_blocks(depth: i64) -> i64 {
    depth + 2 * (depth + 2)
}


/// Per-image embedding: stem, three residual stages, post-activation,
/// global average pooling and a 128 unit rectified projection.
pub fn wide_resnet(vs: &nn::Path, cfg: &Config) -> nn::FuncT<'static> {
    let c0 = cfg.n_filters(0);
    let c1 = cfg.n_filters(1);
    let c2 = cfg.n_filters(2);
    let c3 = cfg.n_filters(3);

    let init_conv = conv2d(&(vs / "stem_conv"), 1, c0, 3, 1, false);
    let init_bn   = batch_norm(&(vs / "stem_bn"), c0);

    let stage1 = stack_residual_blocks(&(vs / "stage1"), c0, c1, false, true, cfg.depth);
    let stage2 = stack_residual_blocks(&(vs / "stage2"), c1, c2, true, false, cfg.depth + 2);
    let stage3 = stack_residual_blocks(&(vs / "stage3"), c2, c3, true, false, cfg.depth + 2);

    let bn_post = batch_norm(&(vs / "bn_post"), c3);
    let dense_cfg = nn::LinearConfig {
        ws_init: he_normal(c3, 1.0),
        ..Default::default()
    };
    let dense = nn::linear(vs / "dense", c3, EMBEDDING_DIM, dense_cfg);

    return nn::func_t(move |xs, train| {
        return xs.apply(&init_conv)
                 .apply_t(&init_bn, train)
                 .relu()
                 .apply_t(&stage1, train)
                 .apply_t(&stage2, train)
                 .apply_t(&stage3, train)
                 .apply_t(&bn_post, train)
                 .relu()
                 .adaptive_avg_pool2d(&[1, 1])
                 .view([-1, c3])
                 .apply(&dense)
                 .relu();
    });
}


/// Element-wise absolute difference between the two halves of a batch of
/// embeddings. Row `i` of the first half is paired with row `i` of the second.
///
/// Panics if the batch holds an odd number of rows.
pub fn pair_distance(embeddings: &Tensor) -> Tensor {
    let n = embeddings.size()[0];
    assert!(n % 2 == 0, "siamese batch must hold an even number of images, got {}", n);
    let half = n / 2;
    (embeddings.narrow(0, 0, half) - embeddings.narrow(0, half, half)).abs()
}


/// Full verification network. Input `(2B, 1, side, side)` holding set A
/// followed by set B, output `(B, 1)` same-class probabilities.
pub fn siamese_verifier(vs: &nn::Path, cfg: &Config) -> nn::FuncT<'static> {
    let embedding = wide_resnet(&(vs / "wrn"), cfg);
    let head = nn::linear(vs / "head", EMBEDDING_DIM, 1, Default::default());

    return nn::func_t(move |xs, train| {
        let embeddings = xs.apply_t(&embedding, train);
        pair_distance(&embeddings).apply(&head).sigmoid()
    });
}
