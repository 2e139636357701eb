use std::collections::HashMap;

use crate::{
    box_coder::BoxCoder,
    boxes::{clip_boxes, nonempty_mask, pairwise_iou},
    config::{CascadeConfigError, CascadeRoiHeadsConfig},
    gradient::scale_gradient,
    instances::{Detections, ImageSize, Proposals, Targets},
    loss::fast_rcnn_losses,
    matcher::Matcher,
    models::stage_head::StageHead,
    nms::nms_and_filter,
    pooler::RegionPooler,
    stats::MatchStats,
};

use burn::{
    module::{Ignored, Module},
    prelude::Backend,
    tensor::{Int, Tensor, activation::softmax, cast::ToElement},
};

/// Everything a forward pass produces.
///
/// Training (targets supplied): empty detections, one classification and one
/// regression loss per stage, and the per-stage match statistics. Inference:
/// final detections, empty losses, untouched statistics.
#[derive(Debug)]
pub struct CascadeOutput<B: Backend> {
    pub detections: Vec<Detections<B>>,
    pub losses: HashMap<String, Tensor<B, 1>>,
    pub match_stats: MatchStats,
}

#[derive(Debug, Clone)]
struct CascadeSettings {
    num_classes: usize,
    smooth_l1_beta: f32,
    proposal_append_gt: bool,
    score_thresh: f32,
    nms_thresh: f32,
    topk_per_image: usize,
}

/// The cascade controller: runs region proposals through a fixed sequence of
/// refinement stages.
///
/// Each stage pools region features for its proposals, predicts class logits
/// and class-agnostic box deltas, and hands its regressed boxes to the next
/// stage as that stage's proposals. Stage components (matcher, box coder,
/// head) live in arrays built once at construction and indexed by stage.
///
/// In training every stage re-matches its proposals against the ground truth
/// under its own, stricter IoU threshold and contributes a namespaced loss
/// pair. In inference the per-stage class probabilities are averaged with
/// equal weight while the boxes come from the last stage's decode alone.
#[derive(Module, Debug)]
pub struct CascadeRoiHeads<B: Backend> {
    stages: Vec<StageHead<B>>,
    matchers: Ignored<Vec<Matcher>>,
    box_coders: Ignored<Vec<BoxCoder>>,
    pooler: Ignored<RegionPooler>,
    settings: Ignored<CascadeSettings>,
}

impl CascadeRoiHeadsConfig {
    /// Builds the cascade head, validating the whole configuration first.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<CascadeRoiHeads<B>, CascadeConfigError> {
        self.validate()?;

        let stages = self
            .stage_ious
            .iter()
            .map(|_| {
                StageHead::new(
                    &self.box_head,
                    self.in_channels(),
                    self.pooler_resolution,
                    self.num_classes,
                    device,
                )
            })
            .collect();

        let matchers = self.stage_ious.iter().map(|iou| Matcher::new(*iou)).collect();
        let box_coders = self
            .stage_bbox_reg_weights
            .iter()
            .map(|weights| BoxCoder::new(*weights))
            .collect();

        let pooler = RegionPooler::new(
            self.pooler_resolution,
            self.pooler_scales(),
            self.pooler_sampling_ratio,
        );

        Ok(CascadeRoiHeads {
            stages,
            matchers: Ignored(matchers),
            box_coders: Ignored(box_coders),
            pooler: Ignored(pooler),
            settings: Ignored(CascadeSettings {
                num_classes: self.num_classes,
                smooth_l1_beta: self.smooth_l1_beta,
                proposal_append_gt: self.proposal_append_gt,
                score_thresh: self.test_score_thresh,
                nms_thresh: self.test_nms_thresh,
                topk_per_image: self.test_topk_per_image,
            }),
        })
    }
}

impl<B: Backend> CascadeRoiHeads<B> {
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// The single entry point of the head.
    ///
    /// With `targets` supplied the pass runs in training mode and returns an
    /// empty detection set plus the per-stage losses; without targets it
    /// returns the final detections and an empty loss map.
    ///
    /// # Arguments
    /// * `images` - per-image pixel bounds, used to clip decoded boxes.
    /// * `features` - one `[batch, C, H, W]` map per configured level.
    /// * `proposals` - per-image initial proposals from the external
    ///   generator.
    /// * `targets` - per-image ground truth, training only.
    pub fn forward(
        &self,
        images: &[ImageSize],
        features: &[Tensor<B, 4>],
        proposals: Vec<Proposals<B>>,
        targets: Option<&[Targets<B>]>,
    ) -> (Vec<Detections<B>>, HashMap<String, Tensor<B, 1>>) {
        let output = self.forward_with_stats(images, features, proposals, targets);
        (output.detections, output.losses)
    }

    /// [`CascadeRoiHeads::forward`] plus the per-stage match statistics, for
    /// training loops that log them.
    pub fn forward_with_stats(
        &self,
        images: &[ImageSize],
        features: &[Tensor<B, 4>],
        proposals: Vec<Proposals<B>>,
        targets: Option<&[Targets<B>]>,
    ) -> CascadeOutput<B> {
        assert!(!images.is_empty(), "forward needs at least one image");
        assert_eq!(images.len(), proposals.len(), "one proposal set per image");

        match targets {
            Some(targets) => {
                assert_eq!(images.len(), targets.len(), "one target set per image");
                self.forward_train(images, features, proposals, targets)
            }
            None => self.forward_inference(images, features, proposals),
        }
    }

    fn forward_train(
        &self,
        images: &[ImageSize],
        features: &[Tensor<B, 4>],
        mut proposals: Vec<Proposals<B>>,
        targets: &[Targets<B>],
    ) -> CascadeOutput<B> {
        let num_stages = self.num_stages();
        let mut stats = MatchStats::new(num_stages);
        let mut losses = HashMap::new();

        if self.settings.proposal_append_gt {
            proposals = append_ground_truth(proposals, targets);
        }

        for stage in 0..num_stages {
            let labeled = self.match_and_label_boxes(stage, proposals, targets, &mut stats);

            let boxes: Vec<Tensor<B, 2>> =
                labeled.proposals.iter().map(|p| p.boxes.clone()).collect();
            let (logits, deltas) = self.run_stage(stage, features, &boxes);

            let stage_losses = fast_rcnn_losses(
                logits,
                deltas.clone(),
                Tensor::cat(boxes.clone(), 0),
                labeled.gt_classes,
                labeled.gt_boxes,
                &self.box_coders[stage],
                self.settings.smooth_l1_beta,
                self.settings.num_classes,
            );

            losses.insert(format!("loss_cls_stage{stage}"), stage_losses.classification);
            losses.insert(
                format!("loss_box_reg_stage{stage}"),
                stage_losses.box_regression,
            );

            proposals = if stage + 1 < num_stages {
                self.create_proposals_from_boxes(stage, &deltas, &boxes, images, true)
            } else {
                Vec::new()
            };
        }

        stats.bump_forwards();

        CascadeOutput {
            detections: Vec::new(),
            losses,
            match_stats: stats,
        }
    }

    fn forward_inference(
        &self,
        images: &[ImageSize],
        features: &[Tensor<B, 4>],
        proposals: Vec<Proposals<B>>,
    ) -> CascadeOutput<B> {
        let num_stages = self.num_stages();
        let mut boxes: Vec<Tensor<B, 2>> = proposals.into_iter().map(|p| p.boxes).collect();
        let mut scores_per_stage: Vec<Vec<Tensor<B, 2>>> = Vec::with_capacity(num_stages);
        let mut detections = Vec::new();

        for stage in 0..num_stages {
            let (logits, deltas) = self.run_stage(stage, features, &boxes);

            let probs = softmax(logits, 1);
            scores_per_stage.push(split_rows(&probs, &boxes));

            if stage + 1 < num_stages {
                boxes = self
                    .create_proposals_from_boxes(stage, &deltas, &boxes, images, false)
                    .into_iter()
                    .map(|p| p.boxes)
                    .collect();
            } else {
                detections = self.finalize_detections(images, &boxes, &deltas, &scores_per_stage);
            }
        }

        CascadeOutput {
            detections,
            losses: HashMap::new(),
            match_stats: MatchStats::new(num_stages),
        }
    }

    /// Pools region features for the stage's proposals and runs its head.
    ///
    /// Gradients entering the pooled features are scaled by `1/num_stages`
    /// so every stage pulls on the backbone with the same weight no matter
    /// how many stages are configured.
    fn run_stage(
        &self,
        stage: usize,
        features: &[Tensor<B, 4>],
        boxes_per_image: &[Tensor<B, 2>],
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let pooled = self.pooler.pool(features, boxes_per_image);
        let pooled = scale_gradient(pooled, 1.0 / self.num_stages() as f32);

        self.stages[stage].forward(pooled)
    }

    /// Matches every image's proposals against its ground truth under this
    /// stage's IoU threshold and attaches labels.
    ///
    /// Unmatched proposals get the background class (`num_classes`) and a
    /// zero gt box; an image without ground truth labels everything
    /// background. Match counts land in `stats`.
    fn match_and_label_boxes(
        &self,
        stage: usize,
        proposals: Vec<Proposals<B>>,
        targets: &[Targets<B>],
        stats: &mut MatchStats,
    ) -> LabeledStage<B> {
        let matcher = &self.matchers[stage];
        let sentinel = self.settings.num_classes as i64;

        let mut labeled = Vec::with_capacity(proposals.len());
        let mut classes_per_image = Vec::with_capacity(proposals.len());
        let mut gt_boxes_per_image = Vec::with_capacity(proposals.len());

        for (proposal, target) in proposals.into_iter().zip(targets.iter()) {
            let device = &proposal.boxes.device();
            let num = proposal.len();

            let (classes, gt_boxes, num_fg) = if num == 0 {
                (
                    Tensor::zeros([0], device),
                    Tensor::zeros([0, 4], device),
                    0usize,
                )
            } else if target.is_empty() {
                (
                    Tensor::full([num], sentinel, device),
                    Tensor::zeros([num, 4], device),
                    0usize,
                )
            } else {
                let iou = pairwise_iou(target.boxes.clone(), proposal.boxes.clone());
                let (matched_idx, fg) = matcher.assign(iou);

                let classes = target
                    .classes
                    .clone()
                    .select(0, matched_idx.clone())
                    .mask_fill(fg.clone().bool_not(), sentinel);

                let bg_rows = fg
                    .clone()
                    .bool_not()
                    .unsqueeze_dim::<2>(1)
                    .expand([num, 4]);
                let gt_boxes = target
                    .boxes
                    .clone()
                    .select(0, matched_idx)
                    .mask_fill(bg_rows, 0.0);

                let num_fg = fg.int().sum().into_scalar().to_i64() as usize;

                (classes, gt_boxes, num_fg)
            };

            stats.update(stage, num_fg, num - num_fg);

            labeled.push(Proposals::with_ground_truth(
                proposal.boxes,
                classes.clone(),
                gt_boxes.clone(),
            ));
            classes_per_image.push(classes);
            gt_boxes_per_image.push(gt_boxes);
        }

        LabeledStage {
            proposals: labeled,
            gt_classes: Tensor::cat(classes_per_image, 0),
            gt_boxes: Tensor::cat(gt_boxes_per_image, 0),
        }
    }

    /// Derives the next stage's proposals from this stage's regressed boxes.
    ///
    /// Deltas are decoded with this stage's coder against this stage's
    /// proposal boxes, clipped to the image, and detached so no gradient
    /// crosses the stage boundary through coordinates. In training, boxes
    /// that collapsed to zero width or height are dropped before the next
    /// match; in inference they stay (clipped) so the proposal count is
    /// stable across stages for score ensembling.
    fn create_proposals_from_boxes(
        &self,
        stage: usize,
        deltas: &Tensor<B, 2>,
        input_boxes: &[Tensor<B, 2>],
        images: &[ImageSize],
        training: bool,
    ) -> Vec<Proposals<B>> {
        let coder = &self.box_coders[stage];
        let device = &deltas.device();

        let mut out = Vec::with_capacity(input_boxes.len());
        let mut offset = 0;

        for (boxes, image) in input_boxes.iter().zip(images.iter()) {
            let count = boxes.dims()[0];
            if count == 0 {
                out.push(Proposals::new(Tensor::zeros([0, 4], device)));
                continue;
            }

            let slice = deltas.clone().narrow(0, offset, count);
            offset += count;

            let decoded = coder.decode(slice, boxes.clone()).detach();
            let decoded = clip_boxes(decoded, image);

            let decoded = if training {
                let keep = nonempty_mask(decoded.clone());
                let num_keep = keep.clone().int().sum().into_scalar().to_i64();

                if num_keep == 0 {
                    Tensor::zeros([0, 4], device)
                } else if num_keep == count as i64 {
                    decoded
                } else {
                    decoded.select(0, Tensor::cat(keep.nonzero(), 0))
                }
            } else {
                decoded
            };

            out.push(Proposals::new(decoded));
        }

        out
    }

    /// Turns the accumulated stage outputs into final per-image detections.
    ///
    /// The classification score is the equal-weight average of every stage's
    /// probabilities; the boxes come from the last stage's decode alone.
    /// That asymmetry is the standard cascade ensembling and is deliberate.
    fn finalize_detections(
        &self,
        images: &[ImageSize],
        last_boxes: &[Tensor<B, 2>],
        last_deltas: &Tensor<B, 2>,
        scores_per_stage: &[Vec<Tensor<B, 2>>],
    ) -> Vec<Detections<B>> {
        let coder = &self.box_coders[self.num_stages() - 1];
        let device = &last_deltas.device();

        let mut detections = Vec::with_capacity(images.len());
        let mut offset = 0;

        for (img, image) in images.iter().enumerate() {
            let per_stage: Vec<Tensor<B, 2>> = scores_per_stage
                .iter()
                .map(|stage_scores| stage_scores[img].clone())
                .collect();
            let scores = ensemble_scores(&per_stage);

            let count = last_boxes[img].dims()[0];
            if count == 0 {
                detections.push(Detections::empty(device));
                continue;
            }

            let deltas = last_deltas.clone().narrow(0, offset, count);
            offset += count;

            let final_boxes = coder.decode(deltas, last_boxes[img].clone());

            detections.push(nms_and_filter(
                final_boxes,
                scores,
                image,
                self.settings.score_thresh,
                self.settings.nms_thresh,
                self.settings.topk_per_image,
            ));
        }

        detections
    }
}

struct LabeledStage<B: Backend> {
    proposals: Vec<Proposals<B>>,
    gt_classes: Tensor<B, 1, Int>,
    gt_boxes: Tensor<B, 2>,
}

/// Equal-weight arithmetic mean of per-stage class probabilities.
pub fn ensemble_scores<B: Backend>(per_stage: &[Tensor<B, 2>]) -> Tensor<B, 2> {
    assert!(!per_stage.is_empty(), "no stage scores to ensemble");

    let mut sum = per_stage[0].clone();
    for scores in &per_stage[1..] {
        sum = sum + scores.clone();
    }

    sum.div_scalar(per_stage.len() as f32)
}

/// Concatenates the ground-truth boxes into each image's proposal set, so the
/// head trains on positives even while the proposal generator is still poor.
fn append_ground_truth<B: Backend>(
    proposals: Vec<Proposals<B>>,
    targets: &[Targets<B>],
) -> Vec<Proposals<B>> {
    proposals
        .into_iter()
        .zip(targets.iter())
        .map(|(proposal, target)| {
            if target.is_empty() {
                proposal
            } else {
                Proposals::new(Tensor::cat(vec![proposal.boxes, target.boxes.clone()], 0))
            }
        })
        .collect()
}

/// Splits a row-concatenated per-proposal tensor back into per-image pieces.
fn split_rows<B: Backend>(
    concatenated: &Tensor<B, 2>,
    boxes_per_image: &[Tensor<B, 2>],
) -> Vec<Tensor<B, 2>> {
    let cols = concatenated.dims()[1];
    let device = &concatenated.device();

    let mut out = Vec::with_capacity(boxes_per_image.len());
    let mut offset = 0;

    for boxes in boxes_per_image {
        let count = boxes.dims()[0];
        if count == 0 {
            out.push(Tensor::zeros([0, cols], device));
        } else {
            out.push(concatenated.clone().narrow(0, offset, count));
            offset += count;
        }
    }

    out
}
