use burn::{prelude::Backend, tensor::Tensor};

/// Scales the gradient flowing through a tensor without touching its value.
///
/// Forward pass: the input is returned unchanged (exactly, not within
/// floating-point tolerance; the detached residual cancels to zero).
/// Backward pass: the incoming gradient is multiplied by `scale` before it
/// continues upstream. The scale itself is a constant and receives no
/// gradient.
///
/// The cascade applies this with `scale = 1 / num_stages` to the pooled
/// region features of every stage, so each stage's loss contributes
/// comparably to the backbone gradients regardless of the stage count.
///
/// On a backend without autodiff this is the identity.
pub fn scale_gradient<B: Backend, const D: usize>(x: Tensor<B, D>, scale: f32) -> Tensor<B, D> {
    let detached = x.clone().detach();
    detached.clone() + (x - detached).mul_scalar(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray, ndarray::NdArrayDevice},
        tensor::{Distribution, Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type ADB = Autodiff<B>;
    type FT = FloatElem<B>;

    #[test]
    fn test_forward_is_identity() {
        let device = &NdArrayDevice::default();

        let x = Tensor::<B, 2>::random([4, 6], Distribution::Uniform(-3.0, 3.0), device);
        let y = scale_gradient(x.clone(), 0.25);

        // Exact equality, the residual term is identically zero
        x.into_data().assert_eq(&y.to_data(), true);
    }

    #[test]
    fn test_backward_scales_gradient() {
        let device = &NdArrayDevice::default();

        let x = Tensor::<ADB, 2>::random([3, 5], Distribution::Uniform(-1.0, 1.0), device)
            .require_grad();
        let scaled = scale_gradient(x.clone(), 0.5);

        // d(sum)/dx is all ones, so the observed gradient is the scale itself
        let grads = scaled.sum().backward();
        let grad = x.grad(&grads).unwrap();

        Tensor::<B, 2>::full([3, 5], 0.5, device)
            .into_data()
            .assert_approx_eq::<FT>(&grad.to_data(), Tolerance::default());
    }

    #[test]
    fn test_backward_unit_scale_is_transparent() {
        let device = &NdArrayDevice::default();

        let x = Tensor::<ADB, 2>::ones([2, 2], device).require_grad();
        let grads = scale_gradient(x.clone(), 1.0).sum().backward();
        let grad = x.grad(&grads).unwrap();

        Tensor::<B, 2>::ones([2, 2], device)
            .into_data()
            .assert_approx_eq::<FT>(&grad.to_data(), Tolerance::default());
    }
}
