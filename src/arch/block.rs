use std::{cell::RefCell, rc::Rc};

use ndarray::Array5;
use rand::Rng;

use super::{
    layers::{Affine, BiasRelu, Conv3d, FieldBatchNorm, Mode, TensorProduct},
    BlockSpec,
};
use crate::{initialization::ParamGen, Result};

/// A convolutional block: `[tensor product] -> convolution -> field normalization -> [bias relu]`.
///
/// Parameters: `[convolution, normalization, activation]`.
#[derive(Debug, Clone)]
pub struct Block {
    spec: BlockSpec,
    tensor: Option<TensorProduct>,
    conv: Conv3d,
    norm: FieldBatchNorm,
    relu: Option<BiasRelu>,
}

impl Block {
    /// Builds the layers of a block following its spec.
    pub fn new(spec: BlockSpec) -> Self {
        let tensor = (spec.vector_in > 0).then(|| TensorProduct::new(spec.scalar_in, spec.vector_in));
        let relu = spec
            .relu
            .then(|| BiasRelu::new(spec.scalar_out, spec.vector_out));

        Self {
            spec,
            tensor,
            conv: Conv3d::new(&spec),
            norm: FieldBatchNorm::new(spec.scalar_out, spec.vector_out, Affine::Weight),
            relu,
        }
    }

    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    /// Returns the amount of parameters this block has.
    pub fn size(&self) -> usize {
        self.conv.size() + self.norm.size() + self.relu.as_ref().map_or(0, BiasRelu::size)
    }

    /// Returns the amount of running statistics this block keeps.
    pub fn buffer_size(&self) -> usize {
        self.norm.buffer_size()
    }

    pub fn momentum(&self) -> f32 {
        self.norm.momentum()
    }

    pub fn set_momentum(&mut self, momentum: f32) {
        self.norm.set_momentum(momentum);
    }

    pub fn param_gens<R: Rng + 'static>(
        &self,
        rng: &Rc<RefCell<R>>,
    ) -> Result<Vec<Box<dyn ParamGen>>> {
        let mut param_gens = self.conv.param_gens(rng)?;
        param_gens.extend(self.norm.param_gens());
        if let Some(relu) = &self.relu {
            param_gens.extend(relu.param_gens());
        }

        Ok(param_gens)
    }

    pub fn init_buffers(&self, buffers: &mut [f32]) {
        self.norm.init_buffers(buffers);
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        buffers: &mut [f32],
        x: Array5<f32>,
        mode: Mode,
    ) -> Result<Array5<f32>> {
        let (conv_params, rest) = params.split_at(self.conv.size().min(params.len()));
        let (norm_params, relu_params) = rest.split_at(self.norm.size().min(rest.len()));

        let x = match &mut self.tensor {
            Some(tensor) => tensor.forward(x)?,
            None => x,
        };
        let x = self.conv.forward(conv_params, x)?;
        let x = self.norm.forward(norm_params, buffers, x, mode)?;

        match &mut self.relu {
            Some(relu) => relu.forward(relu_params, x),
            None => Ok(x),
        }
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array5<f32>,
    ) -> Result<Array5<f32>> {
        let (conv_size, norm_size) = (self.conv.size(), self.norm.size());
        let (conv_params, rest) = params.split_at(conv_size.min(params.len()));
        let (norm_params, _) = rest.split_at(norm_size.min(rest.len()));
        let (conv_grad, rest) = grad.split_at_mut(conv_size.min(grad.len()));
        let (norm_grad, relu_grad) = rest.split_at_mut(norm_size.min(rest.len()));

        let d = match &mut self.relu {
            Some(relu) => relu.backward(relu_grad, d)?,
            None => d,
        };
        let d = self.norm.backward(norm_params, norm_grad, d)?;
        let d = self.conv.backward(conv_params, conv_grad, d)?;

        match &mut self.tensor {
            Some(tensor) => tensor.backward(d),
            None => Ok(d),
        }
    }
}
