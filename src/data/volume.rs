use std::{fs, path::Path};

use log::debug;
use ndarray::{Array3, Array5, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{NetErr, Result};

/// The fixed shift and scale applied to every voxel on load, `(x - mean) / scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    pub mean: f32,
    pub scale: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: 0.02267,
            scale: 0.14885,
        }
    }
}

impl Normalization {
    pub fn apply(&self, x: f32) -> f32 {
        (x - self.mean) / self.scale
    }
}

/// Loads a single raw volume: `size^3` little endian `f32`s, depth major.
///
/// # Arguments
/// * `path` - The file to read.
/// * `size` - The extent of the volume along every axis.
/// * `normalization` - The shift and scale applied to every voxel.
///
/// # Returns
/// The normalized volume or an error if the file can't be read or has the wrong length.
pub fn load_volume<P: AsRef<Path>>(
    path: P,
    size: usize,
    normalization: &Normalization,
) -> Result<Array3<f32>> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;

    let expected = size * size * size * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(NetErr::MalformedVolume {
            path: path.to_path_buf(),
            got: bytes.len(),
            expected,
        });
    }

    let values: Vec<f32> = bytemuck::pod_collect_to_vec::<u8, f32>(&bytes)
        .into_iter()
        .map(|v| normalization.apply(f32::from_bits(u32::from_le(v.to_bits()))))
        .collect();

    Ok(Array3::from_shape_vec((size, size, size), values)?)
}

/// Loads a batch of volumes in parallel.
///
/// # Arguments
/// * `paths` - The files to read, one volume each.
/// * `size` - The extent of every volume along every axis.
/// * `normalization` - The shift and scale applied to every voxel.
///
/// # Returns
/// The volumes shaped `(paths, 1, size, size, size)` or the first error found.
pub fn load_files<P: AsRef<Path> + Sync>(
    paths: &[P],
    size: usize,
    normalization: &Normalization,
) -> Result<Array5<f32>> {
    let volumes = paths
        .par_iter()
        .map(|path| load_volume(path, size, normalization))
        .collect::<Result<Vec<_>>>()?;

    let mut x = Array5::zeros((volumes.len(), 1, size, size, size));
    for (mut slot, volume) in x.outer_iter_mut().zip(&volumes) {
        slot.index_axis_mut(Axis(0), 0).assign(volume);
    }

    debug!("loaded {} volumes of extent {size}", volumes.len());
    Ok(x)
}

/// Writes raw voxels in the format `load_volume` reads.
pub fn write_volume<P: AsRef<Path>>(path: P, voxels: &[f32]) -> Result<()> {
    let le: Vec<f32> = voxels
        .iter()
        .map(|v| f32::from_bits(v.to_bits().to_le()))
        .collect();

    fs::write(path, bytemuck::cast_slice::<f32, u8>(&le))?;
    Ok(())
}
