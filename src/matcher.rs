use burn::{
    prelude::Backend,
    tensor::{Bool, Int, Tensor},
};

/// Assigns each proposal to its best-overlapping ground-truth box.
///
/// Stateless given a match-quality matrix: every call takes the full IoU
/// matrix for one image and one fixed threshold. Each cascade stage owns its
/// own matcher with a progressively stricter threshold.
///
/// Unlike the proposal-generation matcher elsewhere in a detector, this one
/// has no low-quality/ignore band: a proposal whose best IoU reaches the
/// threshold is foreground, everything else is background.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    pub threshold: f32,
}

impl Matcher {
    pub fn new(threshold: f32) -> Self {
        Matcher { threshold }
    }

    /// Matches proposals against ground truth.
    ///
    /// # Arguments
    /// * `iou` - IoU matrix of shape `[num_ground_truth, num_proposals]`.
    ///
    /// # Returns
    /// * `Tensor<B, 1, Int>` - per proposal, the index of the ground-truth
    ///   box with the highest IoU (0 when there is no ground truth).
    /// * `Tensor<B, 1, Bool>` - per proposal, `true` iff that best IoU is
    ///   `>= threshold`. With an empty ground-truth set every proposal is
    ///   background.
    pub fn assign<B: Backend>(
        &self,
        iou: Tensor<B, 2>,
    ) -> (Tensor<B, 1, Int>, Tensor<B, 1, Bool>) {
        let device = &iou.device();
        let [num_gt, num_proposals] = iou.dims();

        // An image without annotated instances matches everything as
        // background; argmax over an empty dimension is undefined.
        if num_gt == 0 || num_proposals == 0 {
            return (
                Tensor::zeros([num_proposals], device),
                Tensor::<B, 1, Int>::zeros([num_proposals], device).bool(),
            );
        }

        let (best_iou, matched_idx) = iou.max_dim_with_indices(0);

        let foreground = best_iou.greater_equal_elem(self.threshold).squeeze(0);

        (matched_idx.squeeze(0), foreground)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::pairwise_iou;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_assign_picks_best_gt_and_thresholds() {
        let device = &NdArrayDevice::default();

        let iou = Tensor::<B, 2>::from_data(
            [
                [0.10, 0.55, 0.30, 0.80],
                [0.60, 0.20, 0.40, 0.10],
            ],
            device,
        );

        let matcher = Matcher::new(0.5);
        let (idx, fg) = matcher.assign(iou);

        assert_eq!(idx.to_data().to_vec::<i64>().unwrap(), vec![1, 0, 1, 0]);
        assert_eq!(
            fg.to_data().to_vec::<bool>().unwrap(),
            vec![true, true, false, true]
        );
    }

    #[test]
    fn test_exact_threshold_is_foreground() {
        let device = &NdArrayDevice::default();

        let iou = Tensor::<B, 2>::from_data([[0.5, 0.49999]], device);

        let matcher = Matcher::new(0.5);
        let (_, fg) = matcher.assign(iou);

        assert_eq!(fg.to_data().to_vec::<bool>().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_empty_ground_truth_is_all_background() {
        let device = &NdArrayDevice::default();

        let gt = Tensor::<B, 2>::zeros([0, 4], device);
        let proposals = Tensor::<B, 2>::from_data(
            [[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 5.0, 5.0], [2.0, 2.0, 6.0, 6.0]],
            device,
        );

        let iou = pairwise_iou(gt, proposals);
        assert_eq!(iou.dims(), [0, 3]);

        let matcher = Matcher::new(0.6);
        let (idx, fg) = matcher.assign(iou);

        assert_eq!(idx.dims(), [3]);
        assert_eq!(
            fg.to_data().to_vec::<bool>().unwrap(),
            vec![false, false, false]
        );
    }

    #[test]
    fn test_empty_proposals() {
        let device = &NdArrayDevice::default();

        let iou = Tensor::<B, 2>::zeros([2, 0], device);

        let matcher = Matcher::new(0.5);
        let (idx, fg) = matcher.assign(iou);

        assert_eq!(idx.dims(), [0]);
        assert_eq!(fg.dims(), [0]);
    }
}
