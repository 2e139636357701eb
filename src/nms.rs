use crate::boxes::clip_boxes;
use crate::instances::{Detections, ImageSize};

use burn::{
    prelude::Backend,
    tensor::{Int, Tensor},
};

/// Per-image post-processing: score threshold, class-wise non-maximum
/// suppression and a top-k cap.
///
/// The score tensor carries `num_classes + 1` columns with background last;
/// background never produces a detection. Boxes are clipped to the image
/// before overlap tests. Suppression runs independently per class, so boxes
/// of different classes never suppress each other.
///
/// # Arguments
/// * `boxes` - `[N, 4]` candidate boxes in `xyxy` image coordinates.
/// * `scores` - `[N, num_classes + 1]` per-class probabilities.
/// * `image` - image bounds for clipping.
/// * `score_thresh` - minimum class probability to become a candidate.
/// * `nms_thresh` - IoU above which a lower-scored same-class box is dropped.
/// * `topk` - maximum detections kept per image.
pub fn nms_and_filter<B: Backend>(
    boxes: Tensor<B, 2>,
    scores: Tensor<B, 2>,
    image: &ImageSize,
    score_thresh: f32,
    nms_thresh: f32,
    topk: usize,
) -> Detections<B> {
    let device = &boxes.device();
    let [num_boxes, _] = boxes.dims();
    let num_classes = scores.dims()[1] - 1;

    if num_boxes == 0 {
        return Detections::empty(device);
    }

    let boxes = clip_boxes(boxes, image);
    let coords = boxes.to_data().to_vec::<f32>().unwrap();
    let probs = scores.to_data().to_vec::<f32>().unwrap();

    let box_at = |i: usize| -> [f32; 4] {
        [coords[i * 4], coords[i * 4 + 1], coords[i * 4 + 2], coords[i * 4 + 3]]
    };

    let mut kept: Vec<(f32, [f32; 4], i64)> = Vec::new();

    for class in 0..num_classes {
        let mut candidates: Vec<(f32, usize)> = (0..num_boxes)
            .map(|i| (probs[i * (num_classes + 1) + class], i))
            .filter(|(score, _)| *score > score_thresh)
            .collect();

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut class_kept: Vec<usize> = Vec::new();
        for (score, idx) in candidates {
            let suppressed = class_kept
                .iter()
                .any(|kept_idx| iou(&box_at(idx), &box_at(*kept_idx)) > nms_thresh);

            if !suppressed {
                class_kept.push(idx);
                kept.push((score, box_at(idx), class as i64));
            }
        }
    }

    kept.sort_by(|a, b| b.0.total_cmp(&a.0));
    kept.truncate(topk);

    if kept.is_empty() {
        return Detections::empty(device);
    }

    let mut box_list = Vec::with_capacity(kept.len());
    let mut score_list = Vec::with_capacity(kept.len());
    let mut class_list = Vec::with_capacity(kept.len());

    for (score, coords, class) in kept {
        box_list.extend_from_slice(&coords);
        score_list.push(score);
        class_list.push(class);
    }

    Detections {
        boxes: Tensor::<B, 1>::from_floats(box_list.as_slice(), device).reshape([-1, 4]),
        scores: Tensor::from_floats(score_list.as_slice(), device),
        classes: Tensor::<B, 1, Int>::from_data(class_list.as_slice(), device),
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union <= 0.0 { 0.0 } else { intersection / union }
}
