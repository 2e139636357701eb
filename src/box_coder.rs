use crate::boxes::{boxes_to_components, x1y1x2y2_to_cxcywh};
use crate::check_nan;

use burn::{prelude::Backend, tensor::Tensor};

/// Encodes and decodes box-regression deltas relative to reference boxes.
///
/// The parameterization is the standard R-CNN one: a scale-invariant
/// translation of the box center plus log-space scaling of width and height,
///
/// - tx = (Gx - Px) / Pw * wx
/// - ty = (Gy - Py) / Ph * wy
/// - tw = log(Gw / Pw) * ww
/// - th = log(Gh / Ph) * wh
///
/// with `(wx, wy, ww, wh)` acting as per-component gains. Each cascade stage
/// owns one coder with progressively larger gains, so later stages regress
/// finer corrections on an equal numeric footing.
#[derive(Debug, Clone)]
pub struct BoxCoder {
    pub weights: (f32, f32, f32, f32),
    pub scale_clamp: f32,
}

impl BoxCoder {
    /// Creates a coder with the given weights and the default `ln(1000/16)`
    /// clamp on predicted log-scale factors.
    pub fn new(weights: (f32, f32, f32, f32)) -> Self {
        BoxCoder {
            weights,
            scale_clamp: (1000_f32 / 16_f32).ln(),
        }
    }

    /// Computes the deltas that map `reference` boxes onto `target` boxes.
    ///
    /// Both inputs are `[N, 4]` in `xyxy` format; the result is `[N, 4]`
    /// deltas `(tx, ty, tw, th)`. Reference boxes must have positive extents,
    /// the log of a non-positive size ratio is meaningless.
    pub fn encode<B: Backend>(&self, target: Tensor<B, 2>, reference: Tensor<B, 2>) -> Tensor<B, 2> {
        let (wx, wy, ww, wh) = self.weights;

        let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(target));
        let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(reference));

        let tx = (gx - px) / pw.clone() * wx;
        let ty = (gy - py) / ph.clone() * wy;

        // Log-space size ratios keep small and large boxes on the same scale
        let tw = (gw.clone() / pw.clone()).log() * ww;
        check_nan!(tw, gw, pw);

        let th = (gh / ph).log() * wh;

        Tensor::cat(vec![tx, ty, tw, th], 1)
    }

    /// Applies predicted deltas to `reference` boxes, the inverse of
    /// [`BoxCoder::encode`].
    ///
    /// Width/height deltas are clamped to `scale_clamp` before
    /// exponentiation so a wild regression output cannot overflow.
    pub fn decode<B: Backend>(&self, deltas: Tensor<B, 2>, reference: Tensor<B, 2>) -> Tensor<B, 2> {
        let (wx, wy, ww, wh) = self.weights;

        let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(reference));
        let (dx, dy, dw, dh) = boxes_to_components(deltas);

        let dx = dx / wx;
        let dy = dy / wy;
        let dw = (dw / ww).clamp_max(self.scale_clamp);
        let dh = (dh / wh).clamp_max(self.scale_clamp);

        let cx = dx * pw.clone() + px;
        let cy = dy * ph.clone() + py;
        let w = dw.exp() * pw;
        let h = dh.exp() * ph;

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
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem, s},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    #[test]
    fn test_encode_matches_reference_values() {
        let device = &NdArrayDevice::default();

        let targets =
            Tensor::<B, 2>::from_data([[0.35725, 0.51429164, 0.61651564, 0.7677916]], device);
        let references =
            Tensor::<B, 2>::from_data([[0.4080761, 0.42141542, 0.5919239, 0.7891109]], device);

        let coder = BoxCoder::new((10.0, 10.0, 5.0, 5.0));
        let deltas = coder.encode(targets, references);

        Tensor::<B, 2>::from_data([[-0.7134, 0.9730, 1.718, -1.859]], device)
            .into_data()
            .assert_approx_eq::<FT>(&deltas.to_data(), Tolerance::default());
    }

    #[test]
    fn test_decode_encode_round_trip() {
        let device = &NdArrayDevice::default();

        let references = Tensor::<B, 2>::from_data(
            [
                [10.0, 10.0, 50.0, 40.0],
                [5.0, 20.0, 25.0, 60.0],
                [0.0, 0.0, 100.0, 100.0],
            ],
            device,
        );
        let deltas = Tensor::<B, 2>::from_data(
            [
                [0.5, -0.3, 0.2, 0.1],
                [-1.0, 0.7, -0.4, 0.3],
                [0.0, 0.0, 0.0, 0.0],
            ],
            device,
        );

        let coder = BoxCoder::new((10.0, 10.0, 5.0, 5.0));
        let decoded = coder.decode(deltas.clone(), references.clone());
        let round_trip = coder.encode(decoded, references);

        deltas
            .into_data()
            .assert_approx_eq::<FT>(&round_trip.to_data(), Tolerance::default());
    }

    #[test]
    fn test_identity_deltas_reproduce_reference() {
        let device = &NdArrayDevice::default();

        let references = Tensor::<B, 2>::from_data([[4.0, 6.0, 24.0, 18.0]], device);
        let deltas = Tensor::<B, 2>::zeros([1, 4], device);

        let coder = BoxCoder::new((1.0, 1.0, 1.0, 1.0));
        let decoded = coder.decode(deltas, references.clone());

        references
            .into_data()
            .assert_approx_eq::<FT>(&decoded.to_data(), Tolerance::default());
    }

    #[test]
    fn test_decode_clamps_scale() {
        let device = &NdArrayDevice::default();

        let references = Tensor::<B, 2>::from_data([[0.0, 0.0, 16.0, 16.0]], device);
        // An absurd width delta must be clamped to exp(ln(1000/16)) growth
        let deltas = Tensor::<B, 2>::from_data([[0.0, 0.0, 50.0, 0.0]], device);

        let coder = BoxCoder::new((1.0, 1.0, 1.0, 1.0));
        let decoded = coder.decode(deltas, references);

        let width = decoded.clone().slice(s![.., 2]).into_scalar()
            - decoded.slice(s![.., 0]).into_scalar();

        crate::debug::assert_approx_eq(&width, &1000.0, 1e-2);
    }
}
