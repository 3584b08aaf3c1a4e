mod classifier;
mod controller;
mod metrics;
mod trainer;

pub use classifier::VolumeClassifier;
pub use controller::{AdaptiveController, ControllerConfig, Decision};
pub use metrics::{EpochStats, Evaluation};
pub use trainer::ModelTrainer;
