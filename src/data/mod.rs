mod dataset;
mod volume;

pub use dataset::{LabeledVolumes, VolumeEntry};
pub use volume::{load_files, load_volume, write_volume, Normalization};
