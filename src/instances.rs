use burn::{
    prelude::Backend,
    tensor::{Int, Tensor},
};

/// Pixel dimensions of one input image, used to clip decoded boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize) -> Self {
        ImageSize { width, height }
    }
}

/// Candidate boxes for one image, the unit of per-stage refinement.
///
/// Stage 0 proposals come from the external proposal generator; later stages
/// re-derive them by decoding the previous stage's regressed boxes. During
/// training the matching step produces a fresh labeled value via
/// [`Proposals::with_ground_truth`] rather than mutating a shared one, so a
/// stage can never observe another stage's labels.
#[derive(Debug, Clone)]
pub struct Proposals<B: Backend> {
    /// Proposal boxes `[N, 4]` in `xyxy` image coordinates.
    pub boxes: Tensor<B, 2>,
    /// Matched class per proposal `[N]`, background encoded as `num_classes`.
    /// Present only after matching.
    pub gt_classes: Option<Tensor<B, 1, Int>>,
    /// Matched ground-truth box per proposal `[N, 4]`, zero for background
    /// rows. Present only after matching.
    pub gt_boxes: Option<Tensor<B, 2>>,
}

impl<B: Backend> Proposals<B> {
    pub fn new(boxes: Tensor<B, 2>) -> Self {
        Proposals {
            boxes,
            gt_classes: None,
            gt_boxes: None,
        }
    }

    /// Builds the labeled proposals for one stage.
    ///
    /// Panics if the label counts disagree with the box count; that is a
    /// programming error in the matching step, not a data condition.
    pub fn with_ground_truth(
        boxes: Tensor<B, 2>,
        gt_classes: Tensor<B, 1, Int>,
        gt_boxes: Tensor<B, 2>,
    ) -> Self {
        let num = boxes.dims()[0];
        assert_eq!(gt_classes.dims()[0], num, "gt_classes count != proposal count");
        assert_eq!(gt_boxes.dims()[0], num, "gt_boxes count != proposal count");

        Proposals {
            boxes,
            gt_classes: Some(gt_classes),
            gt_boxes: Some(gt_boxes),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable ground-truth annotations for one training image.
///
/// An image with no object instances is a valid target: both tensors then
/// have zero rows and every proposal matches as background.
#[derive(Debug, Clone)]
pub struct Targets<B: Backend> {
    /// Ground-truth boxes `[M, 4]` in `xyxy` image coordinates.
    pub boxes: Tensor<B, 2>,
    /// Ground-truth class per box `[M]`, in `[0, num_classes)`.
    pub classes: Tensor<B, 1, Int>,
}

impl<B: Backend> Targets<B> {
    pub fn new(boxes: Tensor<B, 2>, classes: Tensor<B, 1, Int>) -> Self {
        assert_eq!(
            boxes.dims()[0],
            classes.dims()[0],
            "target boxes count != target classes count"
        );
        Targets { boxes, classes }
    }

    /// Targets for an image without any annotated instance.
    pub fn empty(device: &B::Device) -> Self {
        Targets {
            boxes: Tensor::zeros([0, 4], device),
            classes: Tensor::zeros([0], device),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final per-image detections after ensembling and filtering.
#[derive(Debug, Clone)]
pub struct Detections<B: Backend> {
    /// Detected boxes `[K, 4]` in `xyxy` image coordinates.
    pub boxes: Tensor<B, 2>,
    /// Ensembled score per detection `[K]`.
    pub scores: Tensor<B, 1>,
    /// Predicted class per detection `[K]`, in `[0, num_classes)`.
    pub classes: Tensor<B, 1, Int>,
}

impl<B: Backend> Detections<B> {
    pub fn empty(device: &B::Device) -> Self {
        Detections {
            boxes: Tensor::zeros([0, 4], device),
            scores: Tensor::zeros([0], device),
            classes: Tensor::zeros([0], device),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_labeled_proposals_counts_agree() {
        let device = &NdArrayDevice::default();

        let boxes = Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 3.0, 3.0]], device);
        let classes = Tensor::<B, 1, Int>::from_data([2, 5], device);
        let gt_boxes = Tensor::<B, 2>::zeros([2, 4], device);

        let labeled = Proposals::with_ground_truth(boxes, classes, gt_boxes);
        assert_eq!(labeled.len(), 2);
    }

    #[test]
    #[should_panic(expected = "gt_classes count != proposal count")]
    fn test_labeled_proposals_count_mismatch_panics() {
        let device = &NdArrayDevice::default();

        let boxes = Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0]], device);
        let classes = Tensor::<B, 1, Int>::from_data([2, 5], device);
        let gt_boxes = Tensor::<B, 2>::zeros([1, 4], device);

        let _ = Proposals::with_ground_truth(boxes, classes, gt_boxes);
    }

    #[test]
    fn test_empty_targets() {
        let device = &NdArrayDevice::default();

        let targets = Targets::<B>::empty(device);
        assert!(targets.is_empty());
        assert_eq!(targets.boxes.dims(), [0, 4]);
    }
}
