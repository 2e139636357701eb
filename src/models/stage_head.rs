use crate::models::box_head::{BoxHead, BoxHeadKind};

use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::Backend,
    tensor::Tensor,
};

/// Prediction head of one cascade stage.
///
/// Wraps the stage's feature transform and the two prediction layers: class
/// logits over `num_classes + 1` (background last) and a single shared box
/// delta per proposal. Box regression in the cascade is always
/// class-agnostic, so `bbox_pred` has exactly 4 outputs.
#[derive(Module, Debug)]
pub struct StageHead<B: Backend> {
    transform: BoxHead<B>,
    cls_score: Linear<B>,
    bbox_pred: Linear<B>,
}

impl<B: Backend> StageHead<B> {
    pub fn new(
        kind: &BoxHeadKind,
        in_channels: usize,
        resolution: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let transform = BoxHead::new(kind, in_channels, resolution, device);
        let embedding = transform.output_size();

        StageHead {
            transform,
            cls_score: LinearConfig::new(embedding, num_classes + 1).init(device),
            bbox_pred: LinearConfig::new(embedding, 4).init(device),
        }
    }

    /// Runs pooled region features `[R, C, S, S]` through the transform and
    /// prediction layers.
    ///
    /// # Returns
    /// * `Tensor<B, 2>` - classification logits `[R, num_classes + 1]`.
    /// * `Tensor<B, 2>` - class-agnostic box deltas `[R, 4]`.
    pub fn forward(&self, pooled: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let embedding = self.transform.forward(pooled);

        let logits = self.cls_score.forward(embedding.clone());
        let deltas = self.bbox_pred.forward(embedding);

        (logits, deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_forward_shapes() {
        let device = &NdArrayDevice::default();

        let head = StageHead::<B>::new(&BoxHeadKind::FullyConnected(2, 64), 16, 7, 5, device);
        let pooled = Tensor::<B, 4>::ones([9, 16, 7, 7], device);

        let (logits, deltas) = head.forward(pooled);

        assert_eq!(logits.dims(), [9, 6]); // 5 classes + background
        assert_eq!(deltas.dims(), [9, 4]); // class-agnostic
    }

    #[test]
    fn test_forward_empty_batch() {
        let device = &NdArrayDevice::default();

        let head = StageHead::<B>::new(&BoxHeadKind::AveragePool, 8, 4, 3, device);
        let pooled = Tensor::<B, 4>::zeros([0, 8, 4, 4], device);

        let (logits, deltas) = head.forward(pooled);

        assert_eq!(logits.dims(), [0, 4]);
        assert_eq!(deltas.dims(), [0, 4]);
    }
}
