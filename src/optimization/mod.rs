mod adam;
mod optimizer;

pub use adam::{Adam, AdamConfig, AdamState};
pub use optimizer::Optimizer;
