use super::ParamGen;

/// Fills a layer's slice with a fixed value: normalization weights start at one, normalization
/// and activation biases at zero.
pub struct ConstParamGen {
    value: f32,
    remaining: usize,
}

impl ConstParamGen {
    /// Creates a new `ConstParamGen` yielding `len` copies of `value`.
    pub fn new(value: f32, len: usize) -> Self {
        Self {
            value,
            remaining: len,
        }
    }

    pub fn ones(len: usize) -> Self {
        Self::new(1., len)
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(0., len)
    }
}

impl ParamGen for ConstParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let take = n.min(self.remaining);
        if take == 0 {
            return None;
        }

        self.remaining -= take;
        Some(vec![self.value; take])
    }
}
