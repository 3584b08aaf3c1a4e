use super::ParamGen;

/// A parameter generator that delegates the generation to a chain of parameter generators.
///
/// Every layer contributes the generators for its own slice of the flat parameter buffer, the
/// network chains them in layer order and samples the whole buffer at once.
pub struct ChainedParamGen {
    param_gens: Vec<Box<dyn ParamGen>>,
    curr: usize,
}

impl ChainedParamGen {
    /// Creates a new `ChainedParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `param_gens` - A vec of potentially different parameter generators.
    pub fn new(param_gens: Vec<Box<dyn ParamGen>>) -> Self {
        Self {
            param_gens,
            curr: 0,
        }
    }
}

impl ParamGen for ChainedParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.curr == self.param_gens.len() {
            return None;
        }

        match self.param_gens[self.curr].sample(n) {
            Some(sample) if sample.len() == n => Some(sample),
            Some(mut sample) => {
                self.curr += 1;

                if let Some(next_sample) = self.sample(n - sample.len()) {
                    sample.extend(next_sample);
                }

                Some(sample)
            }
            None => {
                self.curr += 1;
                self.sample(n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{super::ConstParamGen, *};

    #[test]
    fn network_without_layers_yields_nothing() {
        assert!(ChainedParamGen::new(vec![]).sample(1).is_none());
    }

    #[test]
    fn fills_layers_in_order() {
        // A normalization with five weights and two biases followed by a relu with three biases.
        let param_gens: Vec<Box<dyn ParamGen>> = vec![
            Box::new(ConstParamGen::ones(5)),
            Box::new(ConstParamGen::zeros(2)),
            Box::new(ConstParamGen::new(0.5, 3)),
        ];

        let mut param_gen = ChainedParamGen::new(param_gens);
        let sample = param_gen.sample(10).unwrap();

        assert_eq!(sample, [1., 1., 1., 1., 1., 0., 0., 0.5, 0.5, 0.5]);
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn layers_without_parameters_are_skipped() {
        let param_gens: Vec<Box<dyn ParamGen>> = vec![
            Box::new(ConstParamGen::zeros(0)),
            Box::new(ConstParamGen::ones(1)),
            Box::new(ConstParamGen::zeros(0)),
            Box::new(ConstParamGen::new(2., 2)),
        ];

        let mut param_gen = ChainedParamGen::new(param_gens);
        assert_eq!(param_gen.sample(2).unwrap(), [1., 2.]);
        assert_eq!(param_gen.sample(2).unwrap(), [2.]);
    }
}
