use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::Backend,
    tensor::{Tensor, activation::relu},
};

/// Closed set of per-region feature transforms.
///
/// The surrounding system selects one of these per model; there is no
/// runtime registry, the variant is resolved once at construction.
#[derive(Config, Debug, PartialEq)]
pub enum BoxHeadKind {
    /// Flatten the pooled grid and run it through a tower of fully connected
    /// layers: `FullyConnected(num_fc, fc_dim)` with ReLU after each layer.
    FullyConnected(usize, usize),
    /// Collapse the pooled grid to a channel vector by spatial averaging,
    /// for heads whose convolutional body already ran inside the pooler path.
    AveragePool,
}

/// The feature-transform network of one cascade stage: pooled region grids
/// in, flat per-proposal embeddings out.
#[derive(Module, Debug)]
pub struct BoxHead<B: Backend> {
    // Empty for the averaging variant; the kind is recoverable from this.
    fcs: Vec<Linear<B>>,
    output_size: usize,
}

impl<B: Backend> BoxHead<B> {
    /// Builds the transform for pooled grids of `[in_channels, resolution,
    /// resolution]`.
    pub fn new(
        kind: &BoxHeadKind,
        in_channels: usize,
        resolution: usize,
        device: &B::Device,
    ) -> Self {
        match *kind {
            BoxHeadKind::FullyConnected(num_fc, fc_dim) => {
                let mut fcs = Vec::with_capacity(num_fc);
                let mut input = in_channels * resolution * resolution;

                for _ in 0..num_fc {
                    fcs.push(LinearConfig::new(input, fc_dim).init(device));
                    input = fc_dim;
                }

                BoxHead {
                    fcs,
                    output_size: fc_dim,
                }
            }
            BoxHeadKind::AveragePool => BoxHead {
                fcs: Vec::new(),
                output_size: in_channels,
            },
        }
    }

    /// Width of the embedding this head produces.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Transforms pooled region features `[R, C, S, S]` into embeddings
    /// `[R, output_size]`.
    pub fn forward(&self, pooled: Tensor<B, 4>) -> Tensor<B, 2> {
        if self.fcs.is_empty() {
            // Spatial mean over the pooled grid
            let x = pooled.mean_dim(3).squeeze::<3>(3);
            return x.mean_dim(2).squeeze(2);
        }

        let mut x = pooled.flatten::<2>(1, 3);
        for fc in self.fcs.iter() {
            x = relu(fc.forward(x));
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_fully_connected_shapes() {
        let device = &NdArrayDevice::default();

        let head = BoxHead::<B>::new(&BoxHeadKind::FullyConnected(2, 32), 8, 7, device);
        assert_eq!(head.output_size(), 32);

        let pooled = Tensor::<B, 4>::ones([5, 8, 7, 7], device);
        let embedding = head.forward(pooled);

        assert_eq!(embedding.dims(), [5, 32]);
    }

    #[test]
    fn test_average_pool_is_spatial_mean() {
        let device = &NdArrayDevice::default();

        let head = BoxHead::<B>::new(&BoxHeadKind::AveragePool, 3, 2, device);
        assert_eq!(head.output_size(), 3);

        let pooled = Tensor::<B, 4>::from_data(
            [[
                [[1.0, 3.0], [5.0, 7.0]],
                [[2.0, 2.0], [2.0, 2.0]],
                [[0.0, 4.0], [8.0, 0.0]],
            ]],
            device,
        );
        let embedding = head.forward(pooled);

        Tensor::<B, 2>::from_data([[4.0, 2.0, 3.0]], device)
            .into_data()
            .assert_approx_eq::<burn::tensor::ops::FloatElem<B>>(
                &embedding.to_data(),
                burn::tensor::Tolerance::default(),
            );
    }

    #[test]
    fn test_zero_region_batch() {
        let device = &NdArrayDevice::default();

        let head = BoxHead::<B>::new(&BoxHeadKind::FullyConnected(1, 16), 4, 3, device);
        let pooled = Tensor::<B, 4>::zeros([0, 4, 3, 3], device);

        assert_eq!(head.forward(pooled).dims(), [0, 16]);
    }
}
