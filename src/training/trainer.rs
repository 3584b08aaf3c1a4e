use std::{num::NonZeroUsize, time::Instant};

use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{EpochStats, Evaluation, VolumeClassifier};
use crate::{
    arch::{
        layers::Mode,
        loss::{self, CrossEntropy, LossFn},
    },
    config::TrainingConfig,
    data::LabeledVolumes,
    Result,
};

/// Runs the epoch loop: every epoch goes through the whole dataset in shuffled batches and
/// reports its average loss and accuracy to the classifier.
pub struct ModelTrainer<L: LossFn, R: Rng> {
    classifier: VolumeClassifier,
    dataset: LabeledVolumes,
    validation: Option<LabeledVolumes>,
    loss_fn: L,
    epochs: NonZeroUsize,
    rng: R,
}

fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

impl ModelTrainer<CrossEntropy, StdRng> {
    /// Builds the classifier, its network and the dataset described by a config.
    ///
    /// # Arguments
    /// * `config` - The training run to set up.
    ///
    /// # Returns
    /// A new `ModelTrainer` or an error if the config describes an invalid run.
    pub fn from_config(config: TrainingConfig) -> Result<Self> {
        let TrainingConfig {
            number_of_classes,
            epochs,
            model,
            dataset,
            validation,
        } = config;

        let mut rng = generate_rng(model.seed);
        let classes = number_of_classes.get();
        let dataset = LabeledVolumes::new(dataset, classes)?;

        let mut classifier = VolumeClassifier::new(model);
        classifier.initialize(classes, StdRng::from_rng(&mut rng))?;

        let trainer = Self::new(classifier, dataset, epochs, CrossEntropy::new(), rng);
        if validation.is_empty() {
            return Ok(trainer);
        }

        Ok(trainer.with_validation(LabeledVolumes::new(validation, classes)?))
    }
}

impl<L: LossFn, R: Rng> ModelTrainer<L, R> {
    /// Creates a new `ModelTrainer`.
    ///
    /// # Arguments
    /// * `classifier` - An initialized classifier.
    /// * `dataset` - The volumes to train with.
    /// * `epochs` - The amount of epochs `train` runs.
    /// * `loss_fn` - Measures the difference between the class scores and the labels.
    /// * `rng` - Shuffles the dataset before every epoch.
    pub fn new(
        classifier: VolumeClassifier,
        dataset: LabeledVolumes,
        epochs: NonZeroUsize,
        loss_fn: L,
        rng: R,
    ) -> Self {
        Self {
            classifier,
            dataset,
            validation: None,
            loss_fn,
            epochs,
            rng,
        }
    }

    /// Scores the kept network on `validation` after every epoch.
    pub fn with_validation(mut self, validation: LabeledVolumes) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn classifier(&self) -> &VolumeClassifier {
        &self.classifier
    }

    /// Runs every epoch.
    ///
    /// # Returns
    /// The stats of each epoch or the first error found.
    pub fn train(&mut self) -> Result<Vec<EpochStats>> {
        info!(
            "training on {} volumes for {} epochs",
            self.dataset.len(),
            self.epochs
        );

        (0..self.epochs.get())
            .map(|epoch| self.run_epoch(epoch))
            .collect()
    }

    /// Runs a single epoch and lets the classifier decide whether to keep it.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<EpochStats> {
        let start = Instant::now();
        let learning_rate = self.classifier.learning_rate()?;
        let momentum = self.classifier.controller().current_momentum();

        self.dataset.shuffle(&mut self.rng);
        let classes = self.classifier.cnn()?.number_of_classes();

        let mut total_loss = 0.;
        let mut correct = 0;

        for (i, batch) in self
            .dataset
            .batches(self.classifier.batch_size())
            .enumerate()
        {
            let paths: Vec<_> = batch.iter().map(|e| &e.path).collect();
            let labels: Vec<_> = batch.iter().map(|e| e.label).collect();

            let x = self.classifier.load_files(&paths)?;
            let y = loss::one_hot(&labels, classes)?;

            let (cnn, optimizer) = self.classifier.network_mut()?;
            let y_pred = cnn.forward(x, Mode::Train)?;
            let batch_loss = self.loss_fn.loss(y_pred.view(), y.view());
            let d = self.loss_fn.loss_prime(y_pred.view(), y.view());
            cnn.backward(d)?;
            cnn.step(optimizer)?;

            debug!("batch {i}: loss {batch_loss:.4}");
            total_loss += batch_loss * batch.len() as f32;
            correct += loss::correct(y_pred.view(), &labels);
        }

        let n = self.dataset.len() as f32;
        let avg_loss = total_loss / n;
        let accuracy = correct as f32 / n;
        let decision = self.classifier.training_done(avg_loss, accuracy)?;

        let validation = match self.validation.take() {
            Some(dataset) => {
                let evaluation = self.evaluate(&dataset);
                self.validation = Some(dataset);
                Some(evaluation?)
            }
            None => None,
        };

        let stats = EpochStats {
            epoch,
            learning_rate,
            momentum,
            avg_loss,
            accuracy,
            decision,
            validation,
            elapsed: start.elapsed(),
        };
        info!("{stats}");

        Ok(stats)
    }

    /// Scores the network on a dataset without training it. The normalizations use their
    /// running statistics, which are left untouched.
    ///
    /// # Arguments
    /// * `dataset` - The volumes to score.
    ///
    /// # Returns
    /// The average loss and accuracy or an error if a volume can't be loaded.
    pub fn evaluate(&mut self, dataset: &LabeledVolumes) -> Result<Evaluation> {
        let classes = self.classifier.cnn()?.number_of_classes();

        let mut total_loss = 0.;
        let mut correct = 0;

        for batch in dataset.batches(self.classifier.batch_size()) {
            let paths: Vec<_> = batch.iter().map(|e| &e.path).collect();
            let labels: Vec<_> = batch.iter().map(|e| e.label).collect();

            let x = self.classifier.load_files(&paths)?;
            let y = loss::one_hot(&labels, classes)?;

            let (cnn, _) = self.classifier.network_mut()?;
            let y_pred = cnn.forward(x, Mode::Eval)?;

            total_loss += self.loss_fn.loss(y_pred.view(), y.view()) * batch.len() as f32;
            correct += loss::correct(y_pred.view(), &labels);
        }

        let n = dataset.len() as f32;
        Ok(Evaluation {
            avg_loss: total_loss / n,
            accuracy: correct as f32 / n,
        })
    }
}
