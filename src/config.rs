use std::{fs, num::NonZeroUsize, path::Path};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    arch::{ArchitectureSpec, Fields},
    data::{Normalization, VolumeEntry},
    optimization::AdamConfig,
    training::ControllerConfig,
    NetErr, Result,
};

pub const DEFAULT_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(16).unwrap();

/// The geometry of the network. Without `hidden_features` the c16 preset is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    pub input_size: usize,
    pub padding: usize,
    pub hidden_features: Option<Vec<Fields>>,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            input_size: 64,
            padding: 3,
            hidden_features: None,
        }
    }
}

impl ArchitectureConfig {
    /// Resolves the architecture for the given amount of classes.
    pub fn spec(&self, number_of_classes: usize) -> ArchitectureSpec {
        match &self.hidden_features {
            Some(hidden) => ArchitectureSpec::with_hidden(
                number_of_classes,
                self.input_size,
                self.padding,
                hidden,
            ),
            None => {
                let mut spec = ArchitectureSpec::c16(number_of_classes);
                spec.input_size = self.input_size;
                spec.padding = self.padding;
                spec
            }
        }
    }
}

/// Everything the classifier needs besides the amount of classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub architecture: ArchitectureConfig,
    pub optimizer: AdamConfig,
    pub controller: ControllerConfig,
    pub normalization: Normalization,
    pub batch_size: NonZeroUsize,
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: ArchitectureConfig::default(),
            optimizer: AdamConfig::default(),
            controller: ControllerConfig::default(),
            normalization: Normalization::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            seed: None,
        }
    }
}

/// A whole training run, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub number_of_classes: NonZeroUsize,
    pub epochs: NonZeroUsize,
    #[serde(default)]
    pub model: ModelConfig,
    pub dataset: Vec<VolumeEntry>,
    /// Volumes scored in evaluation mode after every epoch, never trained on.
    #[serde(default)]
    pub validation: Vec<VolumeEntry>,
}

impl TrainingConfig {
    /// Reads and validates a `TrainingConfig` from a JSON file.
    ///
    /// # Arguments
    /// * `path` - The path of the configuration file.
    ///
    /// # Returns
    /// The configuration or an error if it can't be read, parsed or is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("reading training config from {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Checks the values serde can't.
    pub fn validate(&self) -> Result<()> {
        let controller = &self.model.controller;

        let positive = [
            ("initial_learning_rate", controller.initial_learning_rate),
            ("rejection_factor", controller.rejection_factor),
            ("backoff", controller.backoff),
            ("growth", controller.growth),
            ("growth_ceiling", controller.growth_ceiling),
            ("normalization.scale", self.model.normalization.scale),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(v.is_finite() && *v > 0.)) {
            return Err(NetErr::InvalidConfig(format!(
                "{name} must be positive, got {value}"
            )));
        }

        let fractions = [
            ("initial_momentum", controller.initial_momentum),
            ("momentum_decay", controller.momentum_decay),
        ];
        if let Some((name, value)) = fractions.iter().find(|(_, v)| !(0f32..=1.).contains(v)) {
            return Err(NetErr::InvalidConfig(format!(
                "{name} must be within [0, 1], got {value}"
            )));
        }

        if !self.model.normalization.mean.is_finite() {
            return Err(NetErr::InvalidConfig(
                "normalization.mean must be finite".to_string(),
            ));
        }

        if self.model.batch_size.get() < 2 {
            return Err(NetErr::InvalidConfig(
                "batch_size must be at least 2 to normalize while training".to_string(),
            ));
        }

        if self.dataset.len() < 2 {
            return Err(NetErr::InvalidConfig(
                "the dataset needs at least 2 entries".to_string(),
            ));
        }

        self.model
            .architecture
            .spec(self.number_of_classes.get())
            .plan()?;

        Ok(())
    }
}
