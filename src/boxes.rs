use crate::{broadcast, instances::ImageSize};

use burn::{
    prelude::Backend,
    tensor::{Bool, Tensor, s},
};

/// Computes the Intersection over Union (IoU) between two sets of bounding
/// boxes in `xyxy` format.
///
/// Each box is represented by its `(x1, y1, x2, y2)` coordinates, where
/// `(x1, y1)` is the top-left corner and `(x2, y2)` is the bottom-right
/// corner. IoU is calculated as:
///
/// `IoU = intersection_area / union_area`
///
/// # Arguments
/// * `a` - Tensor of shape `[N, 4]` in `xyxy` format (ground-truth boxes when
///   building a match-quality matrix).
/// * `b` - Tensor of shape `[M, 4]` in `xyxy` format (proposal boxes).
///
/// # Returns
/// * `Tensor<B, 2>` - IoU matrix of shape `[N, M]`, entry `(i, j)` being the
///   IoU between box `i` of `a` and box `j` of `b`.
pub fn pairwise_iou<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let [na, _] = a.dims();
    let [nb, _] = b.dims();

    // Either side may be empty (an image without instances, or without
    // surviving proposals); the IoU of anything with an empty set is empty.
    if na == 0 || nb == 0 {
        return Tensor::zeros([na, nb], &a.device());
    }

    let (ax1, ay1, ax2, ay2) = boxes_to_components(a);
    let (bx1, by1, bx2, by2) = boxes_to_components(b);

    // Intersection top-left corner: the larger of the two starts
    let bx1_r = bx1.clone().reshape([1, -1]);
    let (l, r) = broadcast!(ax1: Tensor<B, 2>, bx1_r: Tensor<2>);
    let x1_max = l.max_pair(r);

    let by1_r = by1.clone().reshape([1, -1]);
    let (l, r) = broadcast!(ay1: Tensor<B, 2>, by1_r: Tensor<2>);
    let y1_max = l.max_pair(r);

    // Intersection bottom-right corner: the smaller of the two ends
    let bx2_r = bx2.clone().reshape([1, -1]);
    let (l, r) = broadcast!(ax2: Tensor<B, 2>, bx2_r: Tensor<2>);
    let x2_min = l.min_pair(r);

    let by2_r = by2.clone().reshape([1, -1]);
    let (l, r) = broadcast!(ay2: Tensor<B, 2>, by2_r: Tensor<2>);
    let y2_min = l.min_pair(r);

    // Negative extents mean no overlap, clamp them away before multiplying
    let intersection = (x2_min - x1_max).clamp_min(0) * (y2_min - y1_max).clamp_min(0);

    let area_a = (ax2 - ax1) * (ay2 - ay1);
    let area_b = (bx2 - bx1) * (by2 - by1);

    let area_b_r = area_b.reshape([1, -1]);
    let (l, r) = broadcast!(area_a: Tensor<B, 2>, area_b_r: Tensor<2>);
    let union = (l + r) - intersection.clone();

    intersection / union
}

/// Clamps box coordinates to the image bounds `[0, width] x [0, height]`.
pub fn clip_boxes<B: Backend>(boxes: Tensor<B, 2>, image: &ImageSize) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(boxes);

    let w = image.width as f32;
    let h = image.height as f32;

    Tensor::cat(
        vec![
            x1.clamp(0.0, w),
            y1.clamp(0.0, h),
            x2.clamp(0.0, w),
            y2.clamp(0.0, h),
        ],
        1,
    )
}

/// Marks boxes with strictly positive width and height.
///
/// A box that collapses to zero area after decoding carries no region to pool
/// from and is dropped before re-matching in training.
pub fn nonempty_mask<B: Backend>(boxes: Tensor<B, 2>) -> Tensor<B, 1, Bool> {
    let (x1, y1, x2, y2) = boxes_to_components(boxes);

    let wide = (x2 - x1).greater_elem(0.0);
    let tall = (y2 - y1).greater_elem(0.0);

    (wide.int() * tall.int()).bool().squeeze(1)
}

/// Splits a tensor of bounding boxes in any 4 component format (cxcywh, xyxy,
/// etc.) into individual `[N, 1]` component tensors.
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    let c1 = s![.., 0];
    let c2 = s![.., 2];
    let c3 = s![.., 1];
    let c4 = s![.., 3];
    (
        boxes.clone().slice(c1),
        boxes.clone().slice(c3),
        boxes.clone().slice(c2),
        boxes.slice(c4),
    )
}

/// Converts boxes from center format (cx, cy, w, h) to corner format
/// (x1, y1, x2, y2).
pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    Tensor::cat(
        vec![
            cx.clone() - w.clone() * 0.5,
            cy.clone() - h.clone() * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        1,
    )
}

/// Converts boxes from corner format (x1, y1, x2, y2) to center format
/// (cx, cy, w, h).
pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let w = x2.clone() - x1.clone();
    let h = y2.clone() - y1.clone();
    let cx = x1.clone() + w.clone() * 0.5;
    let cy = y1.clone() + h.clone() * 0.5;

    Tensor::cat(vec![cx, cy, w, h], 1)
}
