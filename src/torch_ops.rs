use burn::{
    prelude::Backend,
    tensor::{Device, Int, Tensor},
};

pub fn linspace<B: Backend>(
    start: f32,
    end: f32,
    steps: usize,
    device: &Device<B>,
) -> Tensor<B, 1> {
    if steps == 1 {
        return Tensor::<B, 1>::from_floats([start], device);
    }

    Tensor::<B, 1, Int>::arange(0..steps as i64, device)
        .float()
        .mul_scalar((end - start) / (steps as f32 - 1.0))
        .add_scalar(start)
}

/// Flattens `(row, col)` index tensors into indices of a row-major `[_, width]`
/// layout, so a 2-D map reshaped to one dimension can be gathered with
/// `select`.
pub fn flat_grid_index<B: Backend, const D: usize>(
    rows: Tensor<B, D, Int>,
    cols: Tensor<B, D, Int>,
    width: usize,
) -> Tensor<B, D, Int> {
    rows.mul_scalar(width as i64) + cols
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    #[test]
    pub fn test_linspace() {
        let device = &NdArrayDevice::default();
        type B = NdArray<f32>;
        type FT = burn::tensor::ops::FloatElem<B>;
        let ls = linspace::<B>(3.0, 10.0, 5, device);
        Tensor::<B, 1>::from_data([3.0, 4.75, 6.5, 8.25, 10.0], device)
            .into_data()
            .assert_approx_eq::<FT>(&ls.to_data(), burn::tensor::Tolerance::default());
    }

    #[test]
    pub fn test_flat_grid_index() {
        let device = &NdArrayDevice::default();
        type B = NdArray<f32>;

        let rows = Tensor::<B, 1, Int>::from_data([0, 1, 2], device);
        let cols = Tensor::<B, 1, Int>::from_data([3, 0, 4], device);

        let flat = flat_grid_index(rows, cols, 5);

        Tensor::<B, 1, Int>::from_data([3, 5, 14], device)
            .into_data()
            .assert_eq(&flat.to_data(), true);
    }
}
