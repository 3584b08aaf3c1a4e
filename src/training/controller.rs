use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{snapshot::Snapshot, Result};

/// The constants driving an `AdaptiveController`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub initial_learning_rate: f32,
    /// An epoch is rejected when its loss exceeds the last accepted one by this factor.
    pub rejection_factor: f32,
    pub backoff: f32,
    pub growth: f32,
    /// The learning rate only grows while it's below this value.
    pub growth_ceiling: f32,
    pub initial_momentum: f32,
    pub momentum_decay: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_learning_rate: 1e-2,
            rejection_factor: 1.3,
            backoff: 1.1414,
            growth: 1.189,
            growth_ceiling: 0.1,
            initial_momentum: 0.5,
            momentum_decay: 0.5,
        }
    }
}

/// What the controller did with the result of an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The loss blew up: the model and the optimizer were rolled back.
    Rejected,
    FirstAccepted,
    Improved { improvement: f32 },
    NotImproved,
}

struct Accepted<M, O> {
    loss: f32,
    model: M,
    optimizer: O,
}

/// Accepts or rolls back every epoch of a training run depending on how its loss compares
/// with the last accepted one, adapting the learning rate and the normalization momentum
/// along the way.
///
/// The rollback point is updated on the first acceptance and on every improvement.
pub struct AdaptiveController<M: Snapshot, O: Snapshot> {
    config: ControllerConfig,
    accepted: Option<Accepted<M::State, O::State>>,

    learning_rate: f32,
    good_learning_rate: f32,
    accepted_epochs: usize,
    rejection_streak: usize,
}

impl<M: Snapshot, O: Snapshot> Default for AdaptiveController<M, O> {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl<M: Snapshot, O: Snapshot> AdaptiveController<M, O> {
    /// Creates a new `AdaptiveController` that hasn't seen any epoch.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            accepted: None,
            learning_rate: config.initial_learning_rate,
            good_learning_rate: config.initial_learning_rate,
            accepted_epochs: 0,
            rejection_streak: 0,
        }
    }

    /// The learning rate for the next epoch.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// The learning rate in use when the loss last improved.
    pub fn good_learning_rate(&self) -> f32 {
        self.good_learning_rate
    }

    pub fn accepted_epochs(&self) -> usize {
        self.accepted_epochs
    }

    /// The amount of epochs rejected since the last accepted one.
    pub fn rejection_streak(&self) -> usize {
        self.rejection_streak
    }

    /// The loss of the last epoch saved as rollback point, if any.
    pub fn accepted_loss(&self) -> Option<f32> {
        self.accepted.as_ref().map(|accepted| accepted.loss)
    }

    /// The normalization momentum for the next epoch, halving with every accepted epoch.
    pub fn current_momentum(&self) -> f32 {
        let exp = i32::try_from(self.accepted_epochs).unwrap_or(i32::MAX);
        self.config.initial_momentum * self.config.momentum_decay.powi(exp)
    }

    /// Decides whether to keep the epoch that just finished.
    ///
    /// # Arguments
    /// * `model` - The model as left by the epoch.
    /// * `optimizer` - The optimizer as left by the epoch.
    /// * `avg_loss` - The average loss over the epoch.
    /// * `accuracy` - The accuracy over the epoch, only logged.
    ///
    /// # Returns
    /// The decision taken or an error if restoring the saved state failed.
    pub fn record_epoch_result(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        avg_loss: f32,
        accuracy: f32,
    ) -> Result<Decision> {
        if let Some(accepted) = &self.accepted {
            if avg_loss > self.config.rejection_factor * accepted.loss {
                self.learning_rate = self.good_learning_rate / self.config.backoff;
                model.restore(&accepted.model)?;
                optimizer.restore(&accepted.optimizer)?;

                self.rejection_streak += 1;
                info!(
                    "rejected: loss {avg_loss:.3e} against {:.3e}, learning rate backs off to {:.3e}",
                    accepted.loss, self.learning_rate
                );
                if self.rejection_streak > 1 {
                    warn!("{} epochs rejected in a row", self.rejection_streak);
                }

                return Ok(Decision::Rejected);
            }
        }

        self.rejection_streak = 0;
        self.accepted_epochs += 1;

        let decision = match self.accepted_loss() {
            None => {
                self.save(model, optimizer, avg_loss);
                info!("accepted first epoch with loss {avg_loss:.3e} and accuracy {accuracy:.3}");
                Decision::FirstAccepted
            }
            Some(previous) if avg_loss < previous => {
                let improvement = previous - avg_loss;
                self.save(model, optimizer, avg_loss);
                self.good_learning_rate = self.learning_rate;
                if self.learning_rate < self.config.growth_ceiling {
                    self.learning_rate *= self.config.growth;
                }

                info!("accepted with improvement of {improvement:.1e}, accuracy {accuracy:.3}");
                Decision::Improved { improvement }
            }
            Some(_) => {
                info!("accepted but not better, accuracy {accuracy:.3}");
                Decision::NotImproved
            }
        };

        Ok(decision)
    }

    fn save(&mut self, model: &M, optimizer: &O, loss: f32) {
        self.accepted = Some(Accepted {
            loss,
            model: model.snapshot(),
            optimizer: optimizer.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetErr;

    /// A model whose whole state is a vector of values.
    #[derive(Debug, Default)]
    struct Weights(Vec<f32>);

    impl Snapshot for Weights {
        type State = Vec<f32>;

        fn snapshot(&self) -> Vec<f32> {
            self.0.clone()
        }

        fn restore(&mut self, state: &Vec<f32>) -> Result<()> {
            if state.len() != self.0.len() {
                return Err(NetErr::SizeMismatch {
                    what: "weights",
                    got: state.len(),
                    expected: self.0.len(),
                });
            }

            self.0.copy_from_slice(state);
            Ok(())
        }
    }

    fn setup() -> (AdaptiveController<Weights, Weights>, Weights, Weights) {
        (
            AdaptiveController::default(),
            Weights(vec![1., 2.]),
            Weights(vec![0.]),
        )
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.)
    }

    #[test]
    fn first_epoch_is_accepted() {
        let (mut controller, mut model, mut optimizer) = setup();

        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 2.0, 0.5)
            .unwrap();

        assert_eq!(decision, Decision::FirstAccepted);
        assert_eq!(controller.accepted_epochs(), 1);
        assert_eq!(controller.accepted_loss(), Some(2.0));
        assert_eq!(controller.learning_rate(), 1e-2);
        assert_eq!(controller.good_learning_rate(), 1e-2);
        assert_eq!(controller.current_momentum(), 0.25);
    }

    #[test]
    fn first_epoch_is_accepted_whatever_the_loss() {
        let (mut controller, mut model, mut optimizer) = setup();

        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 1e30, 0.)
            .unwrap();

        assert_eq!(decision, Decision::FirstAccepted);
    }

    #[test]
    fn improvement_grows_learning_rate() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 2.0, 0.5)
            .unwrap();

        model.0[0] = 7.;
        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 1.5, 0.6)
            .unwrap();

        assert!(matches!(decision, Decision::Improved { improvement } if close(improvement, 0.5)));
        assert_eq!(controller.good_learning_rate(), 1e-2);
        assert!(close(controller.learning_rate(), 0.01189));
        assert_eq!(controller.accepted_epochs(), 2);
        assert_eq!(controller.accepted_loss(), Some(1.5));
        assert_eq!(controller.current_momentum(), 0.125);
    }

    #[test]
    fn rejection_restores_last_improvement() {
        let (mut controller, mut model, mut optimizer) = setup();
        for loss in [2.0, 1.9, 1.8] {
            model.0[0] = loss;
            optimizer.0[0] = -loss;
            controller
                .record_epoch_result(&mut model, &mut optimizer, loss, 0.5)
                .unwrap();
        }
        assert!(close(controller.learning_rate(), 1e-2 * 1.189 * 1.189));
        assert!(close(controller.good_learning_rate(), 0.01189));

        model.0 = vec![100., 100.];
        optimizer.0 = vec![100.];
        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 3.0, 0.1)
            .unwrap();

        assert_eq!(decision, Decision::Rejected);
        assert_eq!(model.0, [1.8, 2.]);
        assert_eq!(optimizer.0, [-1.8]);
        assert!(close(controller.learning_rate(), 0.01189 / 1.1414));
        assert_eq!(controller.accepted_epochs(), 3);
        assert_eq!(controller.accepted_loss(), Some(1.8));
        assert_eq!(controller.rejection_streak(), 1);
    }

    #[test]
    fn accepted_without_improvement_keeps_rollback_point() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 2.0, 0.5)
            .unwrap();

        model.0[0] = 9.;
        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 2.4, 0.4)
            .unwrap();

        assert_eq!(decision, Decision::NotImproved);
        assert_eq!(controller.accepted_epochs(), 2);
        assert_eq!(controller.accepted_loss(), Some(2.0));
        assert_eq!(controller.learning_rate(), 1e-2);
        assert_eq!(model.0, [9., 2.]);

        controller
            .record_epoch_result(&mut model, &mut optimizer, 2.7, 0.4)
            .unwrap();
        assert_eq!(model.0, [1., 2.]);
    }

    #[test]
    fn equal_loss_is_not_an_improvement() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 2.0, 0.5)
            .unwrap();

        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 2.0, 0.5)
            .unwrap();

        assert_eq!(decision, Decision::NotImproved);
    }

    #[test]
    fn loss_at_threshold_is_accepted() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 1.0, 0.5)
            .unwrap();

        let decision = controller
            .record_epoch_result(&mut model, &mut optimizer, 1.3, 0.5)
            .unwrap();

        assert_eq!(decision, Decision::NotImproved);
    }

    #[test]
    fn learning_rate_stops_growing_at_ceiling() {
        let config = ControllerConfig {
            initial_learning_rate: 0.09,
            ..Default::default()
        };
        let mut controller = AdaptiveController::new(config);
        let (mut model, mut optimizer) = (Weights(vec![0.]), Weights(vec![0.]));

        let mut loss = 10.;
        for _ in 0..4 {
            controller
                .record_epoch_result(&mut model, &mut optimizer, loss, 0.5)
                .unwrap();
            loss -= 1.;
        }

        // 0.09 grows once past the ceiling and then stays there.
        assert!(close(controller.learning_rate(), 0.09 * 1.189));
        assert!(close(controller.good_learning_rate(), 0.09 * 1.189));
    }

    #[test]
    fn consecutive_rejections_do_not_compound() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 1.0, 0.5)
            .unwrap();

        for streak in 1..=3 {
            model.0[1] = 50.;
            let decision = controller
                .record_epoch_result(&mut model, &mut optimizer, 5.0, 0.)
                .unwrap();

            assert_eq!(decision, Decision::Rejected);
            assert_eq!(controller.rejection_streak(), streak);
            assert!(close(controller.learning_rate(), 1e-2 / 1.1414));
            assert_eq!(model.0, [1., 2.]);
        }

        assert_eq!(controller.accepted_epochs(), 1);
        controller
            .record_epoch_result(&mut model, &mut optimizer, 0.9, 0.6)
            .unwrap();
        assert_eq!(controller.rejection_streak(), 0);
    }

    #[test]
    fn momentum_is_idempotent() {
        let (controller, ..) = setup();
        assert_eq!(controller.current_momentum(), controller.current_momentum());
        assert_eq!(controller.current_momentum(), 0.5);
    }

    #[test]
    fn accepted_count_never_decreases() {
        let (mut controller, mut model, mut optimizer) = setup();
        let mut last = 0;

        for loss in [3.0, 2.0, 9.0, 2.5, 10.0, 1.0, 1.1] {
            controller
                .record_epoch_result(&mut model, &mut optimizer, loss, 0.5)
                .unwrap();
            assert!(controller.accepted_epochs() >= last);
            assert!(controller.learning_rate() > 0.);
            last = controller.accepted_epochs();
        }

        assert_eq!(last, 5);
    }

    #[test]
    fn restore_failure_is_reported() {
        let (mut controller, mut model, mut optimizer) = setup();
        controller
            .record_epoch_result(&mut model, &mut optimizer, 1.0, 0.5)
            .unwrap();

        model.0.push(3.);
        assert!(controller
            .record_epoch_result(&mut model, &mut optimizer, 5.0, 0.)
            .is_err());
    }
}
