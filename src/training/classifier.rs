use std::{num::NonZeroUsize, path::Path};

use log::info;
use ndarray::Array5;
use rand::Rng;

use super::{AdaptiveController, Decision};
use crate::{
    arch::Cnn,
    config::ModelConfig,
    data,
    optimization::{Adam, Optimizer},
    NetErr, Result,
};

struct Network {
    cnn: Cnn,
    optimizer: Adam,
}

/// The classifier a training loop talks to: it owns the network, its optimizer and the
/// controller deciding what to keep after every epoch.
pub struct VolumeClassifier {
    config: ModelConfig,
    network: Option<Network>,
    controller: AdaptiveController<Cnn, Adam>,
}

impl VolumeClassifier {
    /// Creates a new `VolumeClassifier` with no network yet.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            controller: AdaptiveController::new(config.controller),
            config,
            network: None,
        }
    }

    /// Builds the network and its optimizer.
    ///
    /// # Arguments
    /// * `number_of_classes` - The amount of classes to score.
    /// * `rng` - The random number generator used to initialize the network.
    ///
    /// # Returns
    /// An error if the configured architecture is invalid.
    pub fn initialize<R: Rng + 'static>(&mut self, number_of_classes: usize, rng: R) -> Result<()> {
        let spec = self.config.architecture.spec(number_of_classes);
        let cnn = Cnn::new(&spec, rng)?;
        let optimizer = Adam::new(
            cnn.size(),
            self.controller.learning_rate(),
            self.config.optimizer,
        );

        self.network = Some(Network { cnn, optimizer });
        Ok(())
    }

    pub fn controller(&self) -> &AdaptiveController<Cnn, Adam> {
        &self.controller
    }

    pub fn cnn(&self) -> Result<&Cnn> {
        let network = self.network.as_ref().ok_or(NetErr::UninitializedModel)?;
        Ok(&network.cnn)
    }

    pub fn optimizer(&self) -> Result<&Adam> {
        let network = self.network.as_ref().ok_or(NetErr::UninitializedModel)?;
        Ok(&network.optimizer)
    }

    /// Borrows the network and its optimizer at once, as a training step needs.
    pub fn network_mut(&mut self) -> Result<(&mut Cnn, &mut Adam)> {
        let Network { cnn, optimizer } = self.network.as_mut().ok_or(NetErr::UninitializedModel)?;
        Ok((cnn, optimizer))
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.config.batch_size
    }

    /// Prepares the network for the next epoch: applies the current momentum to every block
    /// normalization and hands the learning rate to the optimizer.
    ///
    /// # Returns
    /// The learning rate for the next epoch or an error if the model isn't initialized.
    pub fn learning_rate(&mut self) -> Result<f32> {
        let momentum = self.controller.current_momentum();
        let learning_rate = self.controller.learning_rate();

        let (cnn, optimizer) = self.network_mut()?;
        cnn.set_momentum(momentum);
        optimizer.set_learning_rate(learning_rate);

        info!("momentum is {momentum:.3e} and learning rate is {learning_rate:.3e}");
        Ok(learning_rate)
    }

    /// Reports the result of an epoch to the controller, which may roll the network back.
    pub fn training_done(&mut self, avg_loss: f32, accuracy: f32) -> Result<Decision> {
        let Network { cnn, optimizer } = self.network.as_mut().ok_or(NetErr::UninitializedModel)?;
        self.controller
            .record_epoch_result(cnn, optimizer, avg_loss, accuracy)
    }

    /// Loads a batch of volumes with the configured extent and normalization.
    pub fn load_files<P: AsRef<Path> + Sync>(&self, paths: &[P]) -> Result<Array5<f32>> {
        data::load_files(
            paths,
            self.config.architecture.input_size,
            &self.config.normalization,
        )
    }
}
