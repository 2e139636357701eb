use crate::broadcast;
use crate::torch_ops::{flat_grid_index, linspace};

use burn::{
    prelude::Backend,
    tensor::{Int, Tensor},
};

/// Extracts fixed-size feature grids from backbone maps for a set of boxes.
///
/// Boxes are sampled bilinearly: every output bin averages
/// `sampling_ratio^2` sample points spread uniformly over the bin. With
/// several feature levels, each box is pooled from the level matching its
/// scale (canonical level 4 at box size 224, the usual FPN assignment), so a
/// small box reads a high-resolution map and a large box a coarse one.
#[derive(Debug, Clone)]
pub struct RegionPooler {
    pub output_size: usize,
    pub scales: Vec<f32>,
    pub sampling_ratio: usize,
    min_level: i32,
    canonical_level: f32,
    canonical_box_size: f32,
}

impl RegionPooler {
    /// Builds a pooler over feature levels with the given coordinate scales
    /// (one per level, highest resolution first, e.g. `[1/4, 1/8, 1/16]`).
    pub fn new(output_size: usize, scales: Vec<f32>, sampling_ratio: usize) -> Self {
        assert!(!scales.is_empty(), "pooler needs at least one feature level");

        let min_level = (-scales[0].log2()).round() as i32;

        RegionPooler {
            output_size,
            scales,
            sampling_ratio: sampling_ratio.max(1),
            min_level,
            canonical_level: 4.0,
            canonical_box_size: 224.0,
        }
    }

    /// Pools region features for every image of the batch.
    ///
    /// # Arguments
    /// * `features` - one `[batch, C, H, W]` map per configured level.
    /// * `boxes_per_image` - per image, `[N_i, 4]` boxes in image coordinates.
    ///
    /// # Returns
    /// * `Tensor<B, 4>` - `[sum(N_i), C, output_size, output_size]`, images
    ///   concatenated in order.
    pub fn pool<B: Backend>(
        &self,
        features: &[Tensor<B, 4>],
        boxes_per_image: &[Tensor<B, 2>],
    ) -> Tensor<B, 4> {
        assert_eq!(
            features.len(),
            self.scales.len(),
            "feature level count != pooler scale count"
        );

        let device = &features[0].device();
        let channels = features[0].dims()[1];
        let size = self.output_size;

        let mut pooled = Vec::with_capacity(boxes_per_image.len());

        for (img, boxes) in boxes_per_image.iter().enumerate() {
            let num = boxes.dims()[0];
            if num == 0 {
                pooled.push(Tensor::zeros([0, channels, size, size], device));
                continue;
            }

            if self.scales.len() == 1 {
                let map = image_map(&features[0], img);
                pooled.push(self.roi_align(map, boxes.clone(), self.scales[0]));
                continue;
            }

            // Group boxes by assigned level, pool each group, then scatter the
            // grids back to the original proposal order.
            let levels = self.assign_levels(boxes);
            let mut out = Tensor::zeros([num, channels, size, size], device);

            for (level, scale) in self.scales.iter().enumerate() {
                let idx: Vec<i64> = levels
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| **l == level)
                    .map(|(i, _)| i as i64)
                    .collect();

                if idx.is_empty() {
                    continue;
                }

                let idx = Tensor::<B, 1, Int>::from_data(idx.as_slice(), device);
                let subset = boxes.clone().select(0, idx.clone());
                let map = image_map(&features[level], img);

                out = out.select_assign(0, idx, self.roi_align(map, subset, *scale));
            }

            pooled.push(out);
        }

        Tensor::cat(pooled, 0)
    }

    /// FPN level per box, as an index into `scales`.
    fn assign_levels<B: Backend>(&self, boxes: &Tensor<B, 2>) -> Vec<usize> {
        let max_index = self.scales.len() as i32 - 1;
        let coords = boxes.to_data().to_vec::<f32>().unwrap();

        coords
            .chunks(4)
            .map(|b| {
                let area = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
                let level = self.canonical_level
                    + (area.sqrt() / self.canonical_box_size + 1e-8).log2();
                (level.floor() as i32 - self.min_level).clamp(0, max_index) as usize
            })
            .collect()
    }

    /// Bilinear ROI-align of one image's map `[C, H, W]` for boxes `[N, 4]`.
    fn roi_align<B: Backend>(
        &self,
        map: Tensor<B, 3>,
        boxes: Tensor<B, 2>,
        scale: f32,
    ) -> Tensor<B, 4> {
        let device = &map.device();
        let [c, h, w] = map.dims();
        let [n, _] = boxes.dims();
        let s = self.output_size;
        let r = self.sampling_ratio;
        let side = s * r; // sample points per box edge
        let points = side * side;

        let boxes = boxes.mul_scalar(scale);
        let (x1, y1, x2, y2) = crate::boxes::boxes_to_components(boxes);
        let box_w = x2 - x1.clone();
        let box_h = y2 - y1.clone();

        // Sample fractions: the k-th of `side` uniform points along a box edge
        let fractions = linspace::<B>(
            0.5 / side as f32,
            (side as f32 - 0.5) / side as f32,
            side,
            device,
        )
        .reshape([1, side as i32]);

        let (bw, f) = broadcast!(box_w: Tensor<B, 2>, fractions: Tensor<2>);
        let xs = (bw * f + x1.expand([n, side])).clamp(0.0, (w - 1) as f32);
        let (bh, f) = broadcast!(box_h: Tensor<B, 2>, fractions: Tensor<2>);
        let ys = (bh * f + y1.expand([n, side])).clamp(0.0, (h - 1) as f32);

        // Pair every y sample with every x sample: [N, side, side] -> [N, P]
        let ys = ys
            .unsqueeze_dim::<3>(2)
            .expand([n, side, side])
            .reshape([n as i32, points as i32]);
        let xs = xs
            .unsqueeze_dim::<3>(1)
            .expand([n, side, side])
            .reshape([n as i32, points as i32]);

        let y0f = ys.clone().floor();
        let x0f = xs.clone().floor();
        let ly = ys - y0f.clone();
        let lx = xs - x0f.clone();

        let y0 = y0f.int();
        let x0 = x0f.int();
        let y1c = (y0.clone() + 1).clamp_max(h as i64 - 1);
        let x1c = (x0.clone() + 1).clamp_max(w as i64 - 1);

        let flat = map.reshape([c as i32, (h * w) as i32]);
        let corner = |rows: Tensor<B, 2, Int>, cols: Tensor<B, 2, Int>| {
            let idx = flat_grid_index(rows, cols, w).reshape([(n * points) as i32]);
            flat.clone().select(1, idx).reshape([c, n, points])
        };

        let v00 = corner(y0.clone(), x0.clone());
        let v01 = corner(y0, x1c.clone());
        let v10 = corner(y1c.clone(), x0);
        let v11 = corner(y1c, x1c);

        let one_ly = ly.clone().neg().add_scalar(1.0);
        let one_lx = lx.clone().neg().add_scalar(1.0);

        let weight = |t: Tensor<B, 2>| t.unsqueeze::<3>().expand([c, n, points]);
        let w00 = weight(one_ly.clone() * one_lx.clone());
        let w01 = weight(one_ly * lx.clone());
        let w10 = weight(ly.clone() * one_lx);
        let w11 = weight(ly * lx);

        let values = w00 * v00 + w01 * v01 + w10 * v10 + w11 * v11;

        // Average the r x r sub-samples of each output bin
        let bins = values.reshape([c, n, s, r, s, r]);
        let bins = bins.mean_dim(5).squeeze::<5>(5);
        let bins = bins.mean_dim(3).squeeze::<4>(3);

        bins.permute([1, 0, 2, 3])
    }
}

fn image_map<B: Backend>(features: &Tensor<B, 4>, img: usize) -> Tensor<B, 3> {
    features.clone().narrow(0, img, 1).squeeze(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    fn ramp_map(device: &NdArrayDevice) -> Tensor<B, 4> {
        // One channel whose value equals the x coordinate
        Tensor::<B, 4>::from_data(
            [[[
                [0.0, 1.0, 2.0, 3.0],
                [0.0, 1.0, 2.0, 3.0],
                [0.0, 1.0, 2.0, 3.0],
                [0.0, 1.0, 2.0, 3.0],
            ]]],
            device,
        )
    }

    #[test]
    fn test_constant_map_pools_constant() {
        let device = &NdArrayDevice::default();

        let features = [Tensor::<B, 4>::ones([1, 3, 8, 8], device)];
        let boxes = [Tensor::<B, 2>::from_data([[0.0, 0.0, 6.0, 6.0]], device)];

        let pooler = RegionPooler::new(2, vec![1.0], 2);
        let pooled = pooler.pool(&features, &boxes);

        assert_eq!(pooled.dims(), [1, 3, 2, 2]);
        Tensor::<B, 4>::ones([1, 3, 2, 2], device)
            .into_data()
            .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::default());
    }

    #[test]
    fn test_ramp_map_samples_bin_centers() {
        let device = &NdArrayDevice::default();

        let features = [ramp_map(device)];
        let boxes = [Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0]], device)];

        let pooler = RegionPooler::new(2, vec![1.0], 1);
        let pooled = pooler.pool(&features, &boxes);

        // Bin centers fall at x = 1 and x = 3 on the ramp
        Tensor::<B, 4>::from_data([[[[1.0, 3.0], [1.0, 3.0]]]], device)
            .into_data()
            .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::default());
    }

    #[test]
    fn test_scale_maps_boxes_to_feature_coords() {
        let device = &NdArrayDevice::default();

        let features = [ramp_map(device)];
        // Image-space box [0, 16] at scale 1/4 covers feature columns [0, 4]
        let boxes = [Tensor::<B, 2>::from_data([[0.0, 0.0, 16.0, 16.0]], device)];

        let pooler = RegionPooler::new(2, vec![0.25], 1);
        let pooled = pooler.pool(&features, &boxes);

        Tensor::<B, 4>::from_data([[[[1.0, 3.0], [1.0, 3.0]]]], device)
            .into_data()
            .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::default());
    }

    #[test]
    fn test_multi_level_assignment() {
        let device = &NdArrayDevice::default();

        // Level 0 map holds 1s, level 1 map holds 2s
        let features = [
            Tensor::<B, 4>::ones([1, 1, 8, 8], device),
            Tensor::<B, 4>::ones([1, 1, 8, 8], device) * 2.0,
        ];
        let boxes = [Tensor::<B, 2>::from_data(
            [
                [0.0, 0.0, 32.0, 32.0],   // small box -> fine level
                [0.0, 0.0, 512.0, 512.0], // large box -> coarse level
            ],
            device,
        )];

        let pooler = RegionPooler::new(2, vec![0.25, 0.125], 1);
        let pooled = pooler.pool(&features, &boxes);

        assert_eq!(pooled.dims(), [2, 1, 2, 2]);
        Tensor::<B, 4>::from_data(
            [[[[1.0, 1.0], [1.0, 1.0]]], [[[2.0, 2.0], [2.0, 2.0]]]],
            device,
        )
        .into_data()
        .assert_approx_eq::<FT>(&pooled.to_data(), Tolerance::default());
    }

    #[test]
    fn test_empty_boxes_pool_empty() {
        let device = &NdArrayDevice::default();

        let features = [Tensor::<B, 4>::ones([1, 4, 8, 8], device)];
        let boxes = [Tensor::<B, 2>::zeros([0, 4], device)];

        let pooler = RegionPooler::new(3, vec![1.0], 1);
        let pooled = pooler.pool(&features, &boxes);

        assert_eq!(pooled.dims(), [0, 4, 3, 3]);
    }

    #[test]
    fn test_batched_images_concatenate_in_order() {
        let device = &NdArrayDevice::default();

        // Image 0 features are 1s, image 1 features are 3s
        let map0 = Tensor::<B, 4>::ones([1, 2, 6, 6], device);
        let map1 = Tensor::<B, 4>::ones([1, 2, 6, 6], device) * 3.0;
        let features = [Tensor::cat(vec![map0, map1], 0)];

        let boxes = [
            Tensor::<B, 2>::from_data([[0.0, 0.0, 4.0, 4.0]], device),
            Tensor::<B, 2>::from_data([[1.0, 1.0, 5.0, 5.0], [0.0, 0.0, 2.0, 2.0]], device),
        ];

        let pooler = RegionPooler::new(2, vec![1.0], 1);
        let pooled = pooler.pool(&features, &boxes);

        assert_eq!(pooled.dims(), [3, 2, 2, 2]);

        let flat = pooled.to_data().to_vec::<f32>().unwrap();
        assert!(flat[..8].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(flat[8..].iter().all(|v| (*v - 3.0).abs() < 1e-6));
    }
}
