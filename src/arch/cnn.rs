use std::{cell::RefCell, rc::Rc, time::Instant};

use log::{debug, info};
use ndarray::{Array2, Array5, Axis, Dimension, Ix5};
use rand::Rng;

use super::{
    block::Block,
    layers::{standard, take, take_mut, Affine, FieldBatchNorm, Mode},
    ArchitectureSpec,
};
use crate::{
    initialization::{ChainedParamGen, ParamGen},
    optimization::Optimizer,
    snapshot::Snapshot,
    NetErr, Result,
};

/// The parameters and running statistics of a `Cnn`.
#[derive(Debug, Clone, PartialEq)]
pub struct CnnState {
    pub params: Vec<f32>,
    pub buffers: Vec<f32>,
}

/// A volumetric classifier: input normalization, a stack of blocks, mean pooling over space
/// and a normalization of the class scores.
///
/// All the learnable parameters live in a single flat buffer, each layer reading its own slice
/// in order; the same goes for the gradient and for the running statistics.
pub struct Cnn {
    input_norm: FieldBatchNorm,
    blocks: Vec<Block>,
    output_norm: FieldBatchNorm,
    input_size: usize,
    number_of_classes: usize,

    params: Vec<f32>,
    grad: Vec<f32>,
    buffers: Vec<f32>,

    // Forward metadata
    pooled_dim: Ix5,
}

impl Cnn {
    /// Creates a new `Cnn` following an architecture spec.
    ///
    /// # Arguments
    /// * `spec` - The declarative description of the network.
    /// * `rng` - The random number generator used to initialize the convolutions.
    ///
    /// # Returns
    /// A new `Cnn` or an error if the spec is invalid.
    pub fn new<R: Rng + 'static>(spec: &ArchitectureSpec, rng: R) -> Result<Self> {
        let number_of_classes = spec.number_of_classes();
        info!("create cnn for classifying {number_of_classes} classes");

        let blocks: Vec<_> = spec.plan()?.into_iter().map(Block::new).collect();
        for (i, block) in blocks.iter().enumerate() {
            let b = block.spec();
            debug!(
                "block {i}: ({}, {}) -> ({}, {}), kernel {} stride {}, extent {} -> {}",
                b.scalar_in,
                b.vector_in,
                b.scalar_out,
                b.vector_out,
                b.kernel,
                b.stride,
                b.in_size,
                b.out_size
            );
        }

        let mut cnn = Self {
            input_norm: FieldBatchNorm::new(1, 0, Affine::None),
            blocks,
            output_norm: FieldBatchNorm::new(number_of_classes, 0, Affine::WeightAndBias),
            input_size: spec.input_size,
            number_of_classes,
            params: Vec::new(),
            grad: Vec::new(),
            buffers: Vec::new(),
            pooled_dim: Ix5(0, 0, 0, 0, 0),
        };

        cnn.init_params(rng)?;
        cnn.init_buffers()?;
        info!("cnn has {} parameters", cnn.size());

        Ok(cnn)
    }

    fn init_params<R: Rng + 'static>(&mut self, rng: R) -> Result<()> {
        let rng = Rc::new(RefCell::new(rng));

        let mut param_gens = self.input_norm.param_gens();
        for block in &self.blocks {
            param_gens.extend(block.param_gens(&rng)?);
        }
        param_gens.extend(self.output_norm.param_gens());

        let size = self.size();
        let params = ChainedParamGen::new(param_gens)
            .sample(size)
            .unwrap_or_default();

        if params.len() != size {
            return Err(NetErr::SizeMismatch {
                what: "initial parameters",
                got: params.len(),
                expected: size,
            });
        }

        self.grad = vec![0.; size];
        self.params = params;
        Ok(())
    }

    fn init_buffers(&mut self) -> Result<()> {
        let sizes = self.buffer_sizes();
        let mut buffers = vec![0.; sizes.iter().sum()];
        let mut rest = &mut buffers[..];

        let input = take_mut(&mut rest, sizes[0], "input buffers")?;
        self.input_norm.init_buffers(input);
        for (block, &size) in self.blocks.iter().zip(&sizes[1..]) {
            block.init_buffers(take_mut(&mut rest, size, "block buffers")?);
        }
        self.output_norm.init_buffers(rest);

        self.buffers = buffers;
        Ok(())
    }

    /// Returns the amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.param_sizes().iter().sum()
    }

    fn param_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.input_norm.size()];
        sizes.extend(self.blocks.iter().map(Block::size));
        sizes.push(self.output_norm.size());
        sizes
    }

    fn buffer_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.input_norm.buffer_size()];
        sizes.extend(self.blocks.iter().map(Block::buffer_size));
        sizes.push(self.output_norm.buffer_size());
        sizes
    }

    pub fn number_of_classes(&self) -> usize {
        self.number_of_classes
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    /// Sets the momentum of every block normalization. The input and output normalizations
    /// keep their own.
    pub fn set_momentum(&mut self, momentum: f32) {
        for block in &mut self.blocks {
            block.set_momentum(momentum);
        }
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `x` - A batch of volumes shaped `(batch, 1, size, size, size)`.
    /// * `mode` - Whether to update the normalization statistics.
    ///
    /// # Returns
    /// The class scores shaped `(batch, classes)` or an error if occurred.
    pub fn forward(&mut self, x: Array5<f32>, mode: Mode) -> Result<Array2<f32>> {
        let (n, _, d, h, w) = x.dim();
        for got in [d, h, w] {
            if got != self.input_size {
                return Err(NetErr::SizeMismatch {
                    what: "volume extent",
                    got,
                    expected: self.input_size,
                });
            }
        }

        // The class scores are normalized over the batch.
        if mode == Mode::Train && n < 2 {
            return Err(NetErr::BatchTooSmall {
                what: "the class scores",
                got: n,
            });
        }

        let param_sizes = self.param_sizes();
        let buffer_sizes = self.buffer_sizes();
        let Self {
            input_norm,
            blocks,
            output_norm,
            params,
            buffers,
            pooled_dim,
            ..
        } = self;

        let mut params = &params[..];
        let mut buffers = &mut buffers[..];
        let mut slices = Vec::with_capacity(param_sizes.len());
        for (&p, &b) in param_sizes.iter().zip(&buffer_sizes) {
            slices.push((
                take(&mut params, p, "layer parameters")?,
                take_mut(&mut buffers, b, "layer buffers")?,
            ));
        }

        let layers = slices.len();
        let mut slices = slices.into_iter();
        let mut next = || {
            slices.next().ok_or(NetErr::SizeMismatch {
                what: "layers",
                got: layers,
                expected: layers + 1,
            })
        };

        let (p, b) = next()?;
        let mut x = input_norm.forward(p, b, x, mode)?;

        for (i, block) in blocks.iter_mut().enumerate() {
            let start = Instant::now();
            let (p, b) = next()?;
            x = block.forward(p, b, x, mode)?;
            debug!("block {i} took {:?}", start.elapsed());
        }

        *pooled_dim = x.raw_dim();
        let (_, c, o, _, _) = x.dim();
        let pooled = standard(x)
            .into_shape_with_order((n, c, o * o * o))?
            .mean_axis(Axis(2))
            .ok_or(NetErr::SizeMismatch {
                what: "pooled extent",
                got: 0,
                expected: 1,
            })?
            .into_shape_with_order((n, c, 1, 1, 1))?;

        let (p, b) = next()?;
        let y = output_norm.forward(p, b, pooled, mode)?;

        Ok(standard(y).into_shape_with_order((n, c))?)
    }

    /// Computes the gradient of the loss with respect to every parameter, overwriting the
    /// previous one.
    ///
    /// # Arguments
    /// * `d` - The derivative of the loss with respect to the class scores of the last
    ///   forward pass.
    pub fn backward(&mut self, d: Array2<f32>) -> Result<()> {
        let param_sizes = self.param_sizes();
        let Self {
            blocks,
            output_norm,
            params,
            grad,
            pooled_dim,
            ..
        } = self;

        grad.fill(0.);
        let mut params = &params[..];
        let mut grad = &mut grad[..];
        let mut slices = Vec::with_capacity(param_sizes.len());
        for &size in &param_sizes {
            slices.push((
                take(&mut params, size, "layer parameters")?,
                take_mut(&mut grad, size, "layer gradient")?,
            ));
        }

        let layers = slices.len();
        let mut slices = slices.into_iter().rev();
        let mut next = || {
            slices.next().ok_or(NetErr::SizeMismatch {
                what: "layers",
                got: layers,
                expected: layers + 1,
            })
        };

        let (n, c) = d.dim();
        let d = d.into_shape_with_order((n, c, 1, 1, 1))?;
        let (p, g) = next()?;
        let d = output_norm.backward(p, g, d)?;

        let pooled_dim = *pooled_dim;
        let (_, _, o, _, _) = pooled_dim.into_pattern();
        let voxels = (o * o * o).max(1) as f32;
        let mut d = d
            .broadcast(pooled_dim)
            .ok_or(NetErr::SizeMismatch {
                what: "pooled delta",
                got: n * c,
                expected: pooled_dim.size(),
            })?
            .mapv(|v| v / voxels);

        for block in blocks.iter_mut().rev() {
            let (p, g) = next()?;
            d = block.backward(p, g, d)?;
        }

        // The input normalization has no parameters and the input gradient isn't needed.
        Ok(())
    }

    /// Takes a step with the gradient of the last backward pass.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) -> Result<()> {
        optimizer.update_params(&self.grad, &mut self.params)
    }
}

impl Snapshot for Cnn {
    type State = CnnState;

    fn snapshot(&self) -> CnnState {
        CnnState {
            params: self.params.clone(),
            buffers: self.buffers.clone(),
        }
    }

    fn restore(&mut self, state: &CnnState) -> Result<()> {
        for (what, got, expected) in [
            ("snapshot parameters", state.params.len(), self.params.len()),
            ("snapshot buffers", state.buffers.len(), self.buffers.len()),
        ] {
            if got != expected {
                return Err(NetErr::SizeMismatch {
                    what,
                    got,
                    expected,
                });
            }
        }

        self.params.copy_from_slice(&state.params);
        self.buffers.copy_from_slice(&state.buffers);
        Ok(())
    }
}
