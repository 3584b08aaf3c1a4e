pub mod arch;
pub mod config;
pub mod data;
pub mod error;
pub mod initialization;
pub mod optimization;
pub mod snapshot;
pub mod training;

pub use error::{NetErr, Result};
