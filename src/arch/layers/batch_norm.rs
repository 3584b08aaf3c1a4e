use ndarray::{s, Array5, Axis, Zip};

use super::{check_channels, Mode};
use crate::{
    initialization::{ConstParamGen, ParamGen},
    NetErr, Result,
};

/// The learnable parameters of a `FieldBatchNorm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affine {
    None,
    /// A scale per field.
    Weight,
    /// A scale per field and a shift per scalar field.
    WeightAndBias,
}

/// Batch normalization over scalar and vector fields.
///
/// Scalar fields are centered and scaled by their standard deviation. Vector fields are only
/// scaled, by the root of their mean squared component, so that their direction is kept.
///
/// Parameters: `[weights (fields), biases (scalars)]`.
/// Buffers: `[running means (scalars), running variances (fields)]`.
#[derive(Debug, Clone)]
pub struct FieldBatchNorm {
    scalars: usize,
    vectors: usize,
    affine: Affine,
    momentum: f32,
    eps: f32,

    // Forward metadata
    mode: Mode,
    x_hat: Array5<f32>,
    inv_std: Vec<f32>,
}

impl FieldBatchNorm {
    pub const DEFAULT_MOMENTUM: f32 = 0.1;
    const EPS: f32 = 1e-5;

    pub fn new(scalars: usize, vectors: usize, affine: Affine) -> Self {
        Self {
            scalars,
            vectors,
            affine,
            momentum: Self::DEFAULT_MOMENTUM,
            eps: Self::EPS,
            mode: Mode::Train,
            x_hat: Array5::zeros((0, 0, 0, 0, 0)),
            inv_std: Vec::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.scalars + 3 * self.vectors
    }

    fn fields(&self) -> usize {
        self.scalars + self.vectors
    }

    fn field_of(&self, channel: usize) -> usize {
        if channel < self.scalars {
            channel
        } else {
            self.scalars + (channel - self.scalars) / 3
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        match self.affine {
            Affine::None => 0,
            Affine::Weight => self.fields(),
            Affine::WeightAndBias => self.fields() + self.scalars,
        }
    }

    /// Returns the amount of running statistics this layer keeps.
    pub fn buffer_size(&self) -> usize {
        self.scalars + self.fields()
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Sets the weight of the current batch in the running statistics.
    pub fn set_momentum(&mut self, momentum: f32) {
        self.momentum = momentum;
    }

    /// Unit weights and zero biases.
    pub fn param_gens(&self) -> Vec<Box<dyn ParamGen>> {
        let (weights, biases) = match self.affine {
            Affine::None => (0, 0),
            Affine::Weight => (self.fields(), 0),
            Affine::WeightAndBias => (self.fields(), self.scalars),
        };

        vec![
            Box::new(ConstParamGen::ones(weights)),
            Box::new(ConstParamGen::zeros(biases)),
        ]
    }

    /// Zero means and unit variances.
    pub fn init_buffers(&self, buffers: &mut [f32]) {
        let (means, vars) = buffers.split_at_mut(self.scalars.min(buffers.len()));
        means.fill(0.);
        vars.fill(1.);
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        buffers: &mut [f32],
        x: Array5<f32>,
        mode: Mode,
    ) -> Result<Array5<f32>> {
        check_channels(&x, self.channels(), "normalization input channels")?;
        self.check_slices(params, buffers)?;

        let (n, _, d, h, w) = x.dim();
        let count = n * d * h * w;
        if mode == Mode::Train && self.channels() > 0 && count <= 1 {
            return Err(NetErr::BatchTooSmall {
                what: "normalization",
                got: count,
            });
        }

        let (weights, biases) = self.view_params(params);
        let (means, vars) = buffers.split_at_mut(self.scalars);
        let m = self.momentum;
        let eps = self.eps;

        let mut x_hat = x;
        self.inv_std.clear();

        for c in 0..self.scalars {
            let mut xc = x_hat.index_axis_mut(Axis(1), c);
            let (mean, var) = match mode {
                Mode::Train => {
                    let count = xc.len() as f32;
                    let mean = xc.mean().unwrap_or_default();
                    let var = xc.var(0.);
                    let unbiased = if count > 1. { var * count / (count - 1.) } else { var };

                    means[c] = (1. - m) * means[c] + m * mean;
                    vars[c] = (1. - m) * vars[c] + m * unbiased;
                    (mean, var)
                }
                Mode::Eval => (means[c], vars[c]),
            };

            let inv_std = (var + eps).sqrt().recip();
            xc.mapv_inplace(|v| (v - mean) * inv_std);
            self.inv_std.push(inv_std);
        }

        for i in 0..self.vectors {
            let field = self.scalars + i;
            let ch = self.scalars + 3 * i;
            let mut xv = x_hat.slice_mut(s![.., ch..ch + 3, .., .., ..]);

            let q = match mode {
                Mode::Train => {
                    let q = xv.iter().map(|v| v * v).sum::<f32>() / xv.len().max(1) as f32;
                    vars[field] = (1. - m) * vars[field] + m * q;
                    q
                }
                Mode::Eval => vars[field],
            };

            let inv_std = (q + eps).sqrt().recip();
            xv.mapv_inplace(|v| v * inv_std);
            self.inv_std.push(inv_std);
        }

        let mut y = x_hat.clone();
        if self.affine != Affine::None {
            for c in 0..self.channels() {
                let w = weights.map_or(1., |w| w[self.field_of(c)]);
                let b = match biases {
                    Some(b) if c < self.scalars => b[c],
                    _ => 0.,
                };

                y.index_axis_mut(Axis(1), c).mapv_inplace(|v| v * w + b);
            }
        }

        self.mode = mode;
        self.x_hat = x_hat;
        Ok(y)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array5<f32>,
    ) -> Result<Array5<f32>> {
        check_channels(&d, self.channels(), "normalization delta channels")?;
        if grad.len() != self.size() {
            return Err(NetErr::SizeMismatch {
                what: "normalization gradient",
                got: grad.len(),
                expected: self.size(),
            });
        }

        let (weights, _) = self.view_params(params);
        let (gw, gb) = grad.split_at_mut(if weights.is_some() { self.fields() } else { 0 });
        gw.fill(0.);

        for c in 0..self.channels() {
            let dc = d.index_axis(Axis(1), c);
            let xh = self.x_hat.index_axis(Axis(1), c);

            if weights.is_some() {
                gw[self.field_of(c)] += Zip::from(&dc).and(&xh).fold(0., |acc, &d, &x| acc + d * x);
            }
            if c < gb.len() {
                gb[c] = dc.sum();
            }
        }

        let mut dx = d;

        for c in 0..self.scalars {
            let w = weights.map_or(1., |w| w[c]);
            let scale = w * self.inv_std[c];
            let xh = self.x_hat.index_axis(Axis(1), c);
            let mut dc = dx.index_axis_mut(Axis(1), c);

            if self.mode == Mode::Eval {
                dc.mapv_inplace(|d| d * scale);
                continue;
            }

            let count = dc.len().max(1) as f32;
            let mean_d = dc.mean().unwrap_or_default();
            let mean_dx = Zip::from(&dc).and(&xh).fold(0., |acc, &d, &x| acc + d * x) / count;

            Zip::from(&mut dc)
                .and(&xh)
                .for_each(|d, &x| *d = scale * (*d - mean_d - x * mean_dx));
        }

        for i in 0..self.vectors {
            let field = self.scalars + i;
            let ch = self.scalars + 3 * i;
            let w = weights.map_or(1., |w| w[field]);
            let scale = w * self.inv_std[field];
            let xh = self.x_hat.slice(s![.., ch..ch + 3, .., .., ..]);
            let mut dv = dx.slice_mut(s![.., ch..ch + 3, .., .., ..]);

            if self.mode == Mode::Eval {
                dv.mapv_inplace(|d| d * scale);
                continue;
            }

            let count = dv.len().max(1) as f32;
            let mean_dx = Zip::from(&dv).and(&xh).fold(0., |acc, &d, &x| acc + d * x) / count;

            Zip::from(&mut dv)
                .and(&xh)
                .for_each(|d, &x| *d = scale * (*d - x * mean_dx));
        }

        Ok(dx)
    }

    fn check_slices(&self, params: &[f32], buffers: &[f32]) -> Result<()> {
        if params.len() != self.size() {
            return Err(NetErr::SizeMismatch {
                what: "normalization parameters",
                got: params.len(),
                expected: self.size(),
            });
        }

        if buffers.len() != self.buffer_size() {
            return Err(NetErr::SizeMismatch {
                what: "normalization buffers",
                got: buffers.len(),
                expected: self.buffer_size(),
            });
        }

        Ok(())
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> (Option<&'a [f32]>, Option<&'a [f32]>) {
        match self.affine {
            Affine::None => (None, None),
            Affine::Weight => (Some(params), None),
            Affine::WeightAndBias => {
                let (weights, biases) = params.split_at(self.fields());
                (Some(weights), Some(biases))
            }
        }
    }
}
