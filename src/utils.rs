use alloc::vec;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Pads `dim` of `tensor` with `left` zeros before and `right` zeros after.
pub(crate) fn pad_with_zeros<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    dim: usize,
    left: usize,
    right: usize,
) -> Tensor<B, D> {
    if left == 0 && right == 0 {
        return tensor;
    }
    debug_assert!(
        dim < D,
        "dim must be less than the number of dimensions of the tensor"
    );

    let device = tensor.device();
    let zeros = |width: usize| {
        let mut dims = tensor.dims();
        dims[dim] = width;
        Tensor::<B, D>::zeros(dims, &device)
    };

    let mut parts = vec![];
    if left > 0 {
        parts.push(zeros(left));
    }
    let right = (right > 0).then(|| zeros(right));
    parts.push(tensor);
    parts.extend(right);

    Tensor::cat(parts, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;

    #[test]
    fn test_pad_with_zeros() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 3> =
            Tensor::from_floats([[[1.6585, 0.4320], [-0.8701, -0.4649]]], &device);

        let padded = pad_with_zeros(tensor, 0, 1, 2);

        assert_eq!(padded.dims(), [4, 2, 2]);
        padded.to_data().assert_eq(
            &TensorData::from([
                [[0.0f32, 0.0], [0.0, 0.0]],
                [[1.6585, 0.4320], [-0.8701, -0.4649]],
                [[0.0, 0.0], [0.0, 0.0]],
                [[0.0, 0.0], [0.0, 0.0]],
            ]),
            false,
        );
    }

    #[test]
    fn test_pad_last_dim_right_only() {
        let device = Default::default();
        let tensor: Tensor<TestBackend, 2> = Tensor::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);

        let padded = pad_with_zeros(tensor, 1, 0, 1);

        padded.to_data().assert_eq(
            &TensorData::from([[1.0f32, 2.0, 0.0], [3.0, 4.0, 0.0]]),
            false,
        );
    }
}
