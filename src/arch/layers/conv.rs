use std::{cell::RefCell, rc::Rc};

use ndarray::{
    linalg, parallel::prelude::*, s, Array2, Array5, ArrayView2, ArrayView4, ArrayViewMut2,
    ArrayViewMut4, Axis,
};
use rand::Rng;

use super::{check_channels, standard};
use crate::{
    arch::BlockSpec,
    initialization::{ParamGen, RandParamGen},
    NetErr, Result,
};

/// Upper bound on the elements of a single patch tile.
const TILE_ELEMS: usize = 1 << 22;

/// A dense 3D convolution over cubic volumes, without bias.
///
/// The weights are laid out as `(out_channels, in_channels, k, k, k)` in the layer's parameter
/// slice. Every sample is lowered into `(in_channels * k^3, tile)` patch matrices, one tile of
/// output voxels at a time, so the convolution becomes a few matrix products; samples of a
/// batch run in parallel.
///
/// Optimizations:
///   1. The patches are built per tile of output voxels, a whole sample would take
///      `in_channels * k^3` times the memory of its output.
///   2. The patches are rebuilt on backward instead of being kept.
#[derive(Debug, Clone)]
pub struct Conv3d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    in_size: usize,
    out_size: usize,
    tile: usize,

    // Forward metadata
    x: Array5<f32>,
}

impl Conv3d {
    /// Creates a new `Conv3d` from the geometry of a block.
    pub fn new(spec: &BlockSpec) -> Self {
        let conv = Self {
            in_channels: spec.conv_in_channels(),
            out_channels: spec.out_channels(),
            kernel: spec.kernel,
            stride: spec.stride,
            padding: spec.padding,
            in_size: spec.in_size,
            out_size: spec.out_size,
            tile: 1,
            x: Array5::zeros((0, 0, 0, 0, 0)),
        };

        let tile = TILE_ELEMS / conv.patch_len().max(1);
        conv.with_tile(tile)
    }

    /// Sets how many output voxels are lowered into patches at once.
    fn with_tile(mut self, tile: usize) -> Self {
        self.tile = tile.clamp(1, self.voxels().max(1));
        self
    }

    /// The `[start, end)` ranges of output voxels covered by each patch tile.
    fn tiles(&self) -> impl Iterator<Item = (usize, usize)> {
        let (voxels, tile) = (self.voxels(), self.tile);
        (0..voxels)
            .step_by(tile)
            .map(move |start| (start, (start + tile).min(voxels)))
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.out_channels * self.patch_len()
    }

    /// Kaiming normal generator for the weights.
    pub fn param_gens<R: Rng + 'static>(
        &self,
        rng: &Rc<RefCell<R>>,
    ) -> Result<Vec<Box<dyn ParamGen>>> {
        let weights = RandParamGen::kaiming(rng.clone(), self.size(), self.patch_len())?;
        Ok(vec![Box::new(weights)])
    }

    fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.pow(3)
    }

    fn voxels(&self) -> usize {
        self.out_size.pow(3)
    }

    pub fn forward(&mut self, params: &[f32], x: Array5<f32>) -> Result<Array5<f32>> {
        check_channels(&x, self.in_channels, "convolution input channels")?;
        self.check_extent(&x)?;

        let x = standard(x);
        let weights = self.view_params(params)?;
        let (n, ..) = x.dim();
        let o = self.out_size;
        let mut y = Array5::zeros((n, self.out_channels, o, o, o));

        y.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(x.axis_iter(Axis(0)).into_par_iter())
            .try_for_each(|(ys, xs)| -> Result<()> {
                let mut ys = ys.into_shape_with_order((self.out_channels, self.voxels()))?;
                for (start, end) in self.tiles() {
                    let cols = self.im2col(xs, start, end);
                    let mut ys = ys.slice_mut(s![.., start..end]);
                    linalg::general_mat_mul(1.0, &weights, &cols, 0.0, &mut ys);
                }
                Ok(())
            })?;

        self.x = x;
        Ok(y)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array5<f32>,
    ) -> Result<Array5<f32>> {
        check_channels(&d, self.out_channels, "convolution delta channels")?;

        let d = standard(d);
        let weights = self.view_params(params)?;
        let (out, patch, voxels) = (self.out_channels, self.patch_len(), self.voxels());
        let mut dx = Array5::zeros(self.x.raw_dim());

        let dw = dx
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(d.axis_iter(Axis(0)).into_par_iter())
            .zip(self.x.axis_iter(Axis(0)).into_par_iter())
            .map(|((mut dxs, ds), xs)| -> Result<Array2<f32>> {
                let ds = ds.into_shape_with_order((out, voxels))?;
                let mut dw = Array2::zeros((out, patch));

                for (start, end) in self.tiles() {
                    let ds = ds.slice(s![.., start..end]);
                    let cols = self.im2col(xs, start, end);
                    linalg::general_mat_mul(1.0, &ds, &cols.t(), 1.0, &mut dw);

                    let mut dcols = Array2::zeros((patch, end - start));
                    linalg::general_mat_mul(1.0, &weights.t(), &ds, 0.0, &mut dcols);
                    self.col2im(dcols.view(), start, &mut dxs);
                }

                Ok(dw)
            })
            .try_reduce(|| Array2::zeros((out, patch)), |a, b| Ok(a + b))?;

        let mut gw = ArrayViewMut2::from_shape((out, patch), grad)?;
        gw.assign(&dw);

        Ok(dx)
    }

    fn check_extent(&self, x: &Array5<f32>) -> Result<()> {
        let (_, _, d, h, w) = x.dim();
        for got in [d, h, w] {
            if got != self.in_size {
                return Err(NetErr::SizeMismatch {
                    what: "convolution input extent",
                    got,
                    expected: self.in_size,
                });
            }
        }

        Ok(())
    }

    /// Splits a patch row into `(channel, kd, kh, kw)`.
    fn unravel_patch(&self, row: usize) -> (usize, usize, usize, usize) {
        let k = self.kernel;
        (row / k.pow(3), row / (k * k) % k, row / k % k, row % k)
    }

    /// Splits a voxel column into `(od, oh, ow)`.
    fn unravel_voxel(&self, col: usize) -> (usize, usize, usize) {
        let o = self.out_size;
        (col / (o * o), col / o % o, col % o)
    }

    /// The input coordinate read by output coordinate `out` at kernel offset `offset`, `None`
    /// when it falls on the padding.
    fn source(&self, out: usize, offset: usize) -> Option<usize> {
        (out * self.stride + offset)
            .checked_sub(self.padding)
            .filter(|&i| i < self.in_size)
    }

    /// Lowers the patches of output voxels `[start, end)` into columns.
    fn im2col(&self, x: ArrayView4<f32>, start: usize, end: usize) -> Array2<f32> {
        let mut cols = Array2::zeros((self.patch_len(), end - start));

        for (row, mut col_row) in cols.outer_iter_mut().enumerate() {
            let (c, kd, kh, kw) = self.unravel_patch(row);

            for (col, value) in col_row.iter_mut().enumerate() {
                let (od, oh, ow) = self.unravel_voxel(start + col);
                if let (Some(i), Some(j), Some(k)) = (
                    self.source(od, kd),
                    self.source(oh, kh),
                    self.source(ow, kw),
                ) {
                    *value = x[[c, i, j, k]];
                }
            }
        }

        cols
    }

    /// Scatters the columns of output voxels starting at `start` back into `dx`.
    fn col2im(&self, dcols: ArrayView2<f32>, start: usize, dx: &mut ArrayViewMut4<f32>) {
        for (row, col_row) in dcols.outer_iter().enumerate() {
            let (c, kd, kh, kw) = self.unravel_patch(row);

            for (col, &value) in col_row.iter().enumerate() {
                let (od, oh, ow) = self.unravel_voxel(start + col);
                if let (Some(i), Some(j), Some(k)) = (
                    self.source(od, kd),
                    self.source(oh, kh),
                    self.source(ow, kw),
                ) {
                    dx[[c, i, j, k]] += value;
                }
            }
        }
    }

    /// Gives a view of the raw parameter slice as the `(out_channels, patch)` weight matrix.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        if params.len() != self.size() {
            return Err(NetErr::SizeMismatch {
                what: "convolution parameters",
                got: params.len(),
                expected: self.size(),
            });
        }

        Ok(ArrayView2::from_shape(
            (self.out_channels, self.patch_len()),
            params,
        )?)
    }
}
