mod batch_norm;
mod bias_relu;
mod conv;
mod tensor_product;

pub use batch_norm::{Affine, FieldBatchNorm};
pub use bias_relu::BiasRelu;
pub use conv::Conv3d;
pub use tensor_product::TensorProduct;

use ndarray::Array5;

use crate::{NetErr, Result};

/// Whether a forward pass updates the normalization statistics or uses the running ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Returns `x` in standard (row major) layout, copying only when it isn't.
pub(crate) fn standard(x: Array5<f32>) -> Array5<f32> {
    if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    }
}

/// Splits the first `n` values off a parameter slice.
pub(crate) fn take<'a>(slice: &mut &'a [f32], n: usize, what: &'static str) -> Result<&'a [f32]> {
    if slice.len() < n {
        return Err(NetErr::SizeMismatch {
            what,
            got: slice.len(),
            expected: n,
        });
    }

    let (head, tail) = slice.split_at(n);
    *slice = tail;
    Ok(head)
}

/// Splits the first `n` values off a mutable slice, used for gradients and buffers.
pub(crate) fn take_mut<'a>(
    slice: &mut &'a mut [f32],
    n: usize,
    what: &'static str,
) -> Result<&'a mut [f32]> {
    if slice.len() < n {
        return Err(NetErr::SizeMismatch {
            what,
            got: slice.len(),
            expected: n,
        });
    }

    let (head, tail) = std::mem::take(slice).split_at_mut(n);
    *slice = tail;
    Ok(head)
}

/// Checks that `x` carries `expected` channels.
pub(crate) fn check_channels(x: &Array5<f32>, expected: usize, what: &'static str) -> Result<()> {
    let got = x.dim().1;
    if got != expected {
        return Err(NetErr::SizeMismatch {
            what,
            got,
            expected,
        });
    }

    Ok(())
}
