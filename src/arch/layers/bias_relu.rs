use ndarray::{s, Array5, Axis, Zip};

use super::check_channels;
use crate::{
    initialization::{ConstParamGen, ParamGen},
    NetErr, Result,
};

/// Adds a learned bias to every scalar channel and rectifies it. Vector channels pass through
/// untouched.
#[derive(Debug, Clone)]
pub struct BiasRelu {
    scalars: usize,
    vectors: usize,

    // Forward metadata
    a: Array5<f32>,
}

impl BiasRelu {
    pub fn new(scalars: usize, vectors: usize) -> Self {
        Self {
            scalars,
            vectors,
            a: Array5::zeros((0, 0, 0, 0, 0)),
        }
    }

    /// Returns the amount of parameters this layer has, a bias per scalar channel.
    pub fn size(&self) -> usize {
        self.scalars
    }

    /// Zero biases.
    pub fn param_gens(&self) -> Vec<Box<dyn ParamGen>> {
        vec![Box::new(ConstParamGen::zeros(self.scalars))]
    }

    fn check_params(&self, params: &[f32]) -> Result<()> {
        if params.len() != self.size() {
            return Err(NetErr::SizeMismatch {
                what: "activation biases",
                got: params.len(),
                expected: self.size(),
            });
        }

        Ok(())
    }

    pub fn forward(&mut self, params: &[f32], mut x: Array5<f32>) -> Result<Array5<f32>> {
        check_channels(&x, self.scalars + 3 * self.vectors, "activation input channels")?;
        self.check_params(params)?;

        for (c, &b) in params.iter().enumerate() {
            x.index_axis_mut(Axis(1), c)
                .mapv_inplace(|z| (z + b).max(0.));
        }

        self.a = x.slice(s![.., ..self.scalars, .., .., ..]).to_owned();
        Ok(x)
    }

    pub fn backward(&mut self, grad: &mut [f32], mut d: Array5<f32>) -> Result<Array5<f32>> {
        check_channels(&d, self.scalars + 3 * self.vectors, "activation delta channels")?;
        self.check_params(grad)?;

        for (c, db) in grad.iter_mut().enumerate() {
            let a = self.a.index_axis(Axis(1), c);
            let mut dc = d.index_axis_mut(Axis(1), c);

            Zip::from(&mut dc).and(&a).for_each(|d, &a| {
                if a <= 0. {
                    *d = 0.;
                }
            });

            *db = dc.sum();
        }

        Ok(d)
    }
}
