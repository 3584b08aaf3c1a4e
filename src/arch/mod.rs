mod architecture;
mod block;
mod cnn;
pub mod layers;
pub mod loss;

pub use architecture::{ArchitectureSpec, BlockSpec, Fields};
pub use block::Block;
pub use cnn::{Cnn, CnnState};
