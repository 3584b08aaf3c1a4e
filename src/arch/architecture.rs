use serde::{Deserialize, Serialize};

use crate::{NetErr, Result};

/// The amount of `(scalar, vector)` fields flowing between two blocks.
pub type Fields = (usize, usize);

/// Hidden features of the c16 network, between the input volume and the class scores.
const C16_HIDDEN: [Fields; 6] = [(4, 2), (10, 5), (10, 5), (12, 6), (12, 6), (14, 7)];

/// A declarative description of the network: an input extent, a padding and the field counts
/// between consecutive blocks.
///
/// The first entry of `features` describes the input (a single scalar field) and the last one
/// the class scores (only scalar fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub input_size: usize,
    pub padding: usize,
    pub features: Vec<Fields>,
}

/// The geometry and field layout of a single block, resolved from an `ArchitectureSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub scalar_in: usize,
    pub vector_in: usize,
    pub scalar_out: usize,
    pub vector_out: usize,
    pub relu: bool,
    pub kernel: usize,
    pub padding: usize,
    pub stride: usize,
    pub in_size: usize,
    pub out_size: usize,
}

impl BlockSpec {
    /// The channels entering the convolution: the input fields plus, when there are vector
    /// fields, their 3x3 tensor products.
    pub fn conv_in_channels(&self) -> usize {
        self.scalar_in + 3 * self.vector_in + 9 * self.vector_in
    }

    /// The channels leaving the block.
    pub fn out_channels(&self) -> usize {
        self.scalar_out + 3 * self.vector_out
    }
}

impl ArchitectureSpec {
    /// The c16 network for 64^3 volumes.
    pub fn c16(number_of_classes: usize) -> Self {
        Self::with_hidden(number_of_classes, 64, 3, &C16_HIDDEN)
    }

    /// Creates a spec with the given hidden features, framed by the single scalar input field
    /// and the class scores.
    pub fn with_hidden(
        number_of_classes: usize,
        input_size: usize,
        padding: usize,
        hidden: &[Fields],
    ) -> Self {
        let mut features = Vec::with_capacity(hidden.len() + 2);
        features.push((1, 0));
        features.extend_from_slice(hidden);
        features.push((number_of_classes, 0));

        Self {
            input_size,
            padding,
            features,
        }
    }

    /// The amount of classes scored by the last block.
    pub fn number_of_classes(&self) -> usize {
        self.features.last().map_or(0, |&(scalars, _)| scalars)
    }

    /// Resolves the stride, kernel size and spatial extent of every block.
    ///
    /// Even blocks halve the extent with a stride of 2, using a kernel of 6 over even extents
    /// and of 7 over odd ones; odd blocks keep the extent with a kernel of 7.
    ///
    /// `out = (in + 2 * padding - kernel) / stride + 1`
    ///
    /// # Returns
    /// The block specs in order or an error if the features or the geometry are invalid.
    pub fn plan(&self) -> Result<Vec<BlockSpec>> {
        self.validate()?;

        let nblocks = self.features.len() - 1;
        let nrelu = nblocks - 1;
        let padding = self.padding;
        let mut size = self.input_size;

        let mut blocks = Vec::with_capacity(nblocks);
        for (i, pair) in self.features.windows(2).enumerate() {
            let (scalar_in, vector_in) = pair[0];
            let (scalar_out, vector_out) = pair[1];

            let stride = if i % 2 == 0 { 2 } else { 1 };
            let kernel = if stride == 2 && size % 2 == 0 { 6 } else { 7 };

            let invalid = NetErr::InvalidGeometry {
                block: i,
                size,
                kernel,
                padding,
                stride,
            };

            let span = match (size + 2 * padding).checked_sub(kernel) {
                Some(span) if span % stride == 0 => span,
                _ => return Err(invalid),
            };
            let out_size = span / stride + 1;

            blocks.push(BlockSpec {
                scalar_in,
                vector_in,
                scalar_out,
                vector_out,
                relu: i < nrelu,
                kernel,
                padding,
                stride,
                in_size: size,
                out_size,
            });

            size = out_size;
        }

        Ok(blocks)
    }

    fn validate(&self) -> Result<()> {
        if self.features.len() < 2 {
            return Err(NetErr::InvalidArchitecture(
                "at least an input and an output are needed",
            ));
        }

        if self.features[0] != (1, 0) {
            return Err(NetErr::InvalidArchitecture(
                "the input must be a single scalar field",
            ));
        }

        match self.features.last() {
            Some(&(classes, 0)) if classes > 0 => {}
            _ => {
                return Err(NetErr::InvalidArchitecture(
                    "the output must be made of scalar fields only",
                ))
            }
        }

        if self.input_size == 0 {
            return Err(NetErr::InvalidArchitecture("the input extent can't be 0"));
        }

        if self
            .features
            .iter()
            .any(|&(scalars, vectors)| scalars + vectors == 0)
        {
            return Err(NetErr::InvalidArchitecture("every block needs some field"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c16_extents() {
        let blocks = ArchitectureSpec::c16(10).plan().unwrap();

        let extents: Vec<_> = blocks.iter().map(|b| b.out_size).collect();
        assert_eq!(extents, [33, 33, 17, 17, 9, 9, 5]);

        let strides: Vec<_> = blocks.iter().map(|b| b.stride).collect();
        assert_eq!(strides, [2, 1, 2, 1, 2, 1, 2]);

        let kernels: Vec<_> = blocks.iter().map(|b| b.kernel).collect();
        assert_eq!(kernels, [6, 7, 7, 7, 7, 7, 7]);
    }

    #[test]
    fn only_last_block_skips_relu() {
        let blocks = ArchitectureSpec::c16(10).plan().unwrap();
        let (last, rest) = blocks.split_last().unwrap();

        assert!(rest.iter().all(|b| b.relu));
        assert!(!last.relu);
        assert_eq!(last.scalar_out, 10);
        assert_eq!(last.vector_out, 0);
    }

    #[test]
    fn channel_counts_include_tensor_products() {
        let blocks = ArchitectureSpec::c16(3).plan().unwrap();

        assert_eq!(blocks[0].conv_in_channels(), 1);
        assert_eq!(blocks[0].out_channels(), 4 + 6);
        assert_eq!(blocks[1].conv_in_channels(), 4 + 6 + 18);
    }

    #[test]
    fn small_volume() {
        let spec = ArchitectureSpec::with_hidden(2, 8, 3, &[(2, 1), (2, 1)]);
        let extents: Vec<_> = spec.plan().unwrap().iter().map(|b| b.out_size).collect();
        assert_eq!(extents, [5, 5, 3]);
    }

    #[test]
    fn kernel_larger_than_padded_extent() {
        let spec = ArchitectureSpec::with_hidden(2, 4, 0, &[(2, 0)]);
        let err = spec.plan().unwrap_err();

        assert!(matches!(
            err,
            NetErr::InvalidGeometry {
                block: 0,
                size: 4,
                kernel: 6,
                ..
            }
        ));
    }

    #[test]
    fn rejects_vector_output() {
        let spec = ArchitectureSpec {
            input_size: 8,
            padding: 3,
            features: vec![(1, 0), (2, 1)],
        };

        assert!(matches!(
            spec.plan(),
            Err(NetErr::InvalidArchitecture(_))
        ));
    }
}
