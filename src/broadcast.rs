use burn::{prelude::Backend, tensor::Tensor};

/// Expands two tensors to their common broadcast shape.
///
/// The right-hand tensor may have a lower rank; missing leading dimensions
/// are treated as size 1. Each resulting dimension is the maximum of the two
/// input sizes, so shapes like `[N, 1]` and `[1, M]` both expand to `[N, M]`.
pub fn broadcast_pair<B: Backend, const DR: usize, const D: usize>(
    lhs: Tensor<B, D>,
    rhs: Tensor<B, DR>,
) -> (Tensor<B, D>, Tensor<B, D>) {
    let rhs: Tensor<B, D> = rhs.unsqueeze();

    let ld = lhs.dims();
    let rd = rhs.dims();

    let mut shape = [0usize; D];
    for (i, s) in shape.iter_mut().enumerate() {
        *s = if ld[i] == rd[i] || rd[i] == 1 {
            ld[i]
        } else if ld[i] == 1 {
            rd[i]
        } else {
            panic!("incompatible broadcast dims {ld:?} vs {rd:?}")
        };
    }

    (lhs.expand(shape), rhs.expand(shape))
}

/// Broadcasts a pair of tensors to a common shape:
///
/// ```ignore
/// let (a, b) = broadcast!(x1: Tensor<B, 2>, x2: Tensor<1>);
/// ```
///
/// The first annotation carries the backend and the target rank, the second
/// the rank of the right-hand tensor (which may be lower).
#[macro_export]
macro_rules! broadcast {
    ($lhs:ident : Tensor<$b:ty, $d:literal>, $rhs:ident : Tensor<$dr:literal>) => {
        $crate::broadcast::broadcast_pair::<$b, $dr, $d>($lhs.clone(), $rhs.clone())
    };
}
