use ndarray::{s, Array5, Axis, Zip};

use super::check_channels;
use crate::Result;

/// Appends to the input, for every vector field `v`, the 3x3 tensor field `v ⊗ v`.
///
/// The input channels are laid out as `scalars` scalar channels followed by `vectors` triplets;
/// the output adds `9 * vectors` channels with component `(a, b)` of field `i` at
/// `channels + 9 * i + 3 * a + b`.
#[derive(Debug, Clone)]
pub struct TensorProduct {
    scalars: usize,
    vectors: usize,

    // Forward metadata
    x: Array5<f32>,
}

impl TensorProduct {
    pub fn new(scalars: usize, vectors: usize) -> Self {
        Self {
            scalars,
            vectors,
            x: Array5::zeros((0, 0, 0, 0, 0)),
        }
    }

    fn in_channels(&self) -> usize {
        self.scalars + 3 * self.vectors
    }

    fn vector_channel(&self, field: usize, component: usize) -> usize {
        self.scalars + 3 * field + component
    }

    pub fn forward(&mut self, x: Array5<f32>) -> Result<Array5<f32>> {
        let channels = self.in_channels();
        check_channels(&x, channels, "tensor product input channels")?;

        let (n, _, d, h, w) = x.dim();
        let mut out = Array5::zeros((n, channels + 9 * self.vectors, d, h, w));
        out.slice_mut(s![.., ..channels, .., .., ..]).assign(&x);

        for i in 0..self.vectors {
            for a in 0..3 {
                for b in 0..3 {
                    let va = x.index_axis(Axis(1), self.vector_channel(i, a));
                    let vb = x.index_axis(Axis(1), self.vector_channel(i, b));
                    let mut t = out.index_axis_mut(Axis(1), channels + 9 * i + 3 * a + b);

                    Zip::from(&mut t)
                        .and(&va)
                        .and(&vb)
                        .for_each(|t, &va, &vb| *t = va * vb);
                }
            }
        }

        self.x = x;
        Ok(out)
    }

    pub fn backward(&mut self, d: Array5<f32>) -> Result<Array5<f32>> {
        let channels = self.in_channels();
        check_channels(&d, channels + 9 * self.vectors, "tensor product delta channels")?;

        let mut dx = d.slice(s![.., ..channels, .., .., ..]).to_owned();

        for i in 0..self.vectors {
            for a in 0..3 {
                for b in 0..3 {
                    let dt = d.index_axis(Axis(1), channels + 9 * i + 3 * a + b);

                    // d(va * vb) = dva * vb + va * dvb
                    for (target, other) in [(a, b), (b, a)] {
                        let x_other = self.x.index_axis(Axis(1), self.vector_channel(i, other));
                        let mut dv = dx.index_axis_mut(Axis(1), self.vector_channel(i, target));

                        Zip::from(&mut dv)
                            .and(&dt)
                            .and(&x_other)
                            .for_each(|dv, &dt, &x| *dv += dt * x);
                    }
                }
            }
        }

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array5;

    use super::*;
    use crate::arch::layers::testing::random;

    #[test]
    fn appends_outer_products() {
        let mut x = Array5::zeros((1, 4, 1, 1, 1));
        x[[0, 0, 0, 0, 0]] = 7.;
        x[[0, 1, 0, 0, 0]] = 1.;
        x[[0, 2, 0, 0, 0]] = 2.;
        x[[0, 3, 0, 0, 0]] = 3.;

        let mut layer = TensorProduct::new(1, 1);
        let out = layer.forward(x).unwrap();

        let got: Vec<f32> = out.iter().copied().collect();
        assert_eq!(
            got,
            [7., 1., 2., 3., 1., 2., 3., 2., 4., 6., 3., 6., 9.]
        );
    }

    #[test]
    fn backward_matches_finite_differences() {
        let x = random((2, 1 + 3 * 2, 2, 1, 2), 1);
        let upstream = random((2, 1 + 3 * 2 + 18, 2, 1, 2), 2);
        let loss = |x: &Array5<f32>| {
            let out = TensorProduct::new(1, 2).forward(x.clone()).unwrap();
            (&out * &upstream).sum()
        };

        let mut layer = TensorProduct::new(1, 2);
        layer.forward(x.clone()).unwrap();
        let dx = layer.backward(upstream.clone()).unwrap();

        let eps = 1e-2;
        for (idx, &g) in dx.indexed_iter() {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;

            let numeric = (loss(&plus) - loss(&minus)) / (2. * eps);
            assert!(
                (numeric - g).abs() < 1e-2,
                "at {idx:?}: numeric {numeric} analytic {g}"
            );
        }
    }
}
