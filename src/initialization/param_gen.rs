/// Produces the initial values of a layer's slice of the flat parameter buffer.
pub trait ParamGen {
    /// Yields up to `n` values, or `None` once the layer's slice is filled.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}
