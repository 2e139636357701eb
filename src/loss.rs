use crate::box_coder::BoxCoder;

use burn::nn::loss::HuberLossConfig;
use burn::prelude::*;
use burn::tensor::{Tensor, cast::ToElement};

/// Classification and box-regression losses of one cascade stage.
#[derive(Debug, Clone)]
pub struct FastRcnnLosses<B: Backend> {
    pub classification: Tensor<B, 1>,
    pub box_regression: Tensor<B, 1>,
}

/// Computes the cross-entropy loss for multi-class classification without
/// requiring one-hot encoding.
///
/// Applies log-softmax to the logits and gathers the log-probability of each
/// row's true class, producing the per-row negative log-likelihood.
///
/// # Arguments
/// * `logits` - `[R, num_classes + 1]` raw scores, background last.
/// * `targets` - `[R]` class indices in `[0, num_classes]`.
///
/// # Returns
/// * `Tensor<B, 1>` - per-row loss `[R]`.
fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [rows] = targets.dims();

    let log_probabilities = burn::tensor::activation::log_softmax(logits, 1);
    let targets = targets.reshape([rows as i32, 1]);

    let nll = log_probabilities.gather(1, targets) * -1;

    nll.reshape([rows as i32])
}

/// The fast-RCNN loss primitive for one cascade stage.
///
/// Classification is cross entropy over every proposal, background included.
/// Regression is a Huber loss between the predicted deltas and the deltas
/// that would map each foreground proposal onto its matched ground-truth box,
/// summed over foreground rows and normalized by the total row count.
/// Background rows never reach the regression term, so their zero-box
/// placeholders are never read.
///
/// # Arguments
/// * `logits` - `[R, num_classes + 1]` classification logits.
/// * `deltas` - `[R, 4]` class-agnostic predicted deltas.
/// * `proposal_boxes` - `[R, 4]` the proposals the deltas refer to.
/// * `gt_classes` - `[R]` matched classes, background = `num_classes`.
/// * `gt_boxes` - `[R, 4]` matched ground-truth boxes, zero for background.
/// * `box_coder` - the stage's coder, used to encode regression targets.
/// * `smooth_l1_beta` - transition point of the Huber loss.
/// * `num_classes` - foreground class count (background sentinel value).
#[allow(clippy::too_many_arguments)]
pub fn fast_rcnn_losses<B: Backend>(
    logits: Tensor<B, 2>,
    deltas: Tensor<B, 2>,
    proposal_boxes: Tensor<B, 2>,
    gt_classes: Tensor<B, 1, Int>,
    gt_boxes: Tensor<B, 2>,
    box_coder: &BoxCoder,
    smooth_l1_beta: f32,
    num_classes: usize,
) -> FastRcnnLosses<B> {
    let device = &logits.device();
    let [rows] = gt_classes.dims();

    // An image batch can lose every proposal to degenerate-box filtering;
    // a stage with nothing to score contributes nothing.
    if rows == 0 {
        return FastRcnnLosses {
            classification: Tensor::zeros([1], device),
            box_regression: Tensor::zeros([1], device),
        };
    }

    let classification = cross_entropy_loss(logits, gt_classes.clone()).mean();

    let foreground = gt_classes.lower_elem(num_classes as i64);
    let num_fg = foreground.clone().int().sum().into_scalar().to_i64();

    let box_regression = if num_fg > 0 {
        let fg_idx = Tensor::cat(foreground.nonzero(), 0);

        let fg_deltas = deltas.select(0, fg_idx.clone());
        let fg_proposals = proposal_boxes.select(0, fg_idx.clone());
        let fg_gt = gt_boxes.select(0, fg_idx);

        let target_deltas = box_coder.encode(fg_gt, fg_proposals);

        let huber = HuberLossConfig::new(smooth_l1_beta)
            .init()
            .forward_no_reduction(fg_deltas, target_deltas);

        // Normalized by the full row count, not the foreground count, so a
        // stage with few positives does not dominate the gradient
        huber.sum().div_scalar(rows as f32).reshape([1])
    } else {
        Tensor::zeros([1], device)
    };

    FastRcnnLosses {
        classification,
        box_regression,
    }
}
